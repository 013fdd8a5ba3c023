use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use lsm_compactor::admin;
use lsm_compactor::object_store::ObjectStore;
use lsm_compactor::Settings;
use object_store::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use crate::args::{manifest_range, parse_args, CliArgs, CliCommands};

mod args;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .init();

    let args: CliArgs = parse_args();
    let path = Path::from(args.path.as_str());
    let object_store = admin::load_object_store_from_env(args.env_file)?;
    let cancellation_token = CancellationToken::new();

    let ct = cancellation_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("intercepted SIGINT ... shutting down the compactor");
            ct.cancel();
        }
    });

    match args.command {
        CliCommands::ReadManifest { id } => exec_read_manifest(&path, object_store, id).await?,
        CliCommands::ListManifests { start, end } => {
            exec_list_manifest(&path, object_store, start, end).await?
        }
        CliCommands::RunCompactor {
            config,
            poll_interval,
            max_concurrent_compactions,
        } => {
            let settings = load_settings(config, poll_interval, max_concurrent_compactions)?;
            exec_run_compactor(&path, object_store, settings, cancellation_token).await?
        }
    }

    Ok(())
}

async fn exec_read_manifest(
    path: &Path,
    object_store: Arc<dyn ObjectStore>,
    id: Option<u64>,
) -> Result<(), Box<dyn Error>> {
    match admin::read_manifest(path, object_store, id).await? {
        None => {
            println!("no manifest file found")
        }
        Some(manifest) => {
            println!("{}", manifest);
        }
    }
    Ok(())
}

async fn exec_list_manifest(
    path: &Path,
    object_store: Arc<dyn ObjectStore>,
    start: Option<u64>,
    end: Option<u64>,
) -> Result<(), Box<dyn Error>> {
    let range = manifest_range(start, end);
    println!(
        "{}",
        admin::list_manifests(path, object_store, range).await?
    );
    Ok(())
}

fn load_settings(
    config: Option<PathBuf>,
    poll_interval: Option<Duration>,
    max_concurrent_compactions: Option<usize>,
) -> Result<Settings, Box<dyn Error>> {
    let mut settings = match config {
        Some(config) => Settings::from_file(config)?,
        None => Settings::load()?,
    };
    if let Some(poll_interval) = poll_interval {
        settings.compactor_options.poll_interval = poll_interval;
    }
    if let Some(max_concurrent_compactions) = max_concurrent_compactions {
        settings.compactor_options.max_concurrent_compactions = max_concurrent_compactions;
    }
    Ok(settings)
}

async fn exec_run_compactor(
    path: &Path,
    object_store: Arc<dyn ObjectStore>,
    settings: Settings,
    cancellation_token: CancellationToken,
) -> Result<(), Box<dyn Error>> {
    info!(
        "starting compactor [path={}, settings={}]",
        path,
        serde_json::to_string(&settings)?
    );
    admin::run_compactor(path, object_store, settings, cancellation_token).await?;
    info!("compactor stopped");
    Ok(())
}
