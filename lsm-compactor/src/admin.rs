use std::env;
use std::error::Error;
use std::ops::RangeBounds;
use std::sync::Arc;

use object_store::path::Path;
use object_store::ObjectStore;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::compactor::Compactor;
use crate::config::Settings;
use crate::error::CompactorError;
use crate::manifest::store::ManifestStore;
use crate::size_tiered_compaction::SizeTieredCompactionSchedulerSupplier;

/// read-only access to a manifest file, the latest one unless `maybe_id` is set
pub async fn read_manifest(
    path: &Path,
    object_store: Arc<dyn ObjectStore>,
    maybe_id: Option<u64>,
) -> Result<Option<String>, Box<dyn Error>> {
    let manifest_store = ManifestStore::new(path, object_store);
    let id_manifest = if let Some(id) = maybe_id {
        manifest_store
            .read_manifest(id)
            .await?
            .map(|manifest| (id, manifest))
    } else {
        manifest_store.read_latest_manifest().await?
    };

    match id_manifest {
        None => Ok(None),
        Some(result) => Ok(Some(serde_json::to_string_pretty(&result)?)),
    }
}

pub async fn list_manifests<R: RangeBounds<u64>>(
    path: &Path,
    object_store: Arc<dyn ObjectStore>,
    range: R,
) -> Result<String, Box<dyn Error>> {
    let manifest_store = ManifestStore::new(path, object_store);
    let manifests = manifest_store.list_manifests(range).await?;
    Ok(serde_json::to_string(&manifests)?)
}

/// Runs a size-tiered compactor against the db at `path` in the foreground until
/// `cancellation_token` is cancelled.
///
/// # Arguments
///
/// * `path`: The path to the database.
/// * `object_store`: The object store to use.
/// * `settings`: The compactor and scheduler settings.
/// * `cancellation_token`: The cancellation token to stop the compactor.
///
pub async fn run_compactor(
    path: &Path,
    object_store: Arc<dyn ObjectStore>,
    settings: Settings,
    cancellation_token: CancellationToken,
) -> Result<(), Box<dyn Error>> {
    let manifest_store = Arc::new(ManifestStore::new(path, object_store));
    let scheduler_supplier = Arc::new(SizeTieredCompactionSchedulerSupplier::new(
        settings.scheduler_options,
    ));
    let compactor = Compactor::new(
        manifest_store,
        settings.compactor_options,
        scheduler_supplier,
        cancellation_token,
    );
    compactor.run_async_task(Handle::current()).await?;
    Ok(())
}

/// Loads an object store from configured environment variables.
/// The provider is specified using the CLOUD_PROVIDER variable.
/// For specific provider configurations, see the corresponding
/// method documentation:
///
/// | Provider | Value | Documentation |
/// |----------|-------|---------------|
/// | Local | `local` | [load_local] |
/// | In-memory | `memory` | [load_memory] |
pub fn load_object_store_from_env(
    env_file: Option<String>,
) -> Result<Arc<dyn ObjectStore>, Box<dyn Error>> {
    dotenvy::from_filename(env_file.unwrap_or(String::from(".env"))).ok();

    let provider = env::var("CLOUD_PROVIDER")
        .map_err(|_| CompactorError::MissingEnvironmentVariable("CLOUD_PROVIDER".to_string()))?
        .to_lowercase();

    match provider.as_str() {
        "local" => load_local(),
        "memory" => Ok(load_memory()),
        _ => Err(CompactorError::UnsupportedObjectStoreProvider(provider).into()),
    }
}

/// Loads a local object store instance.
///
/// | Env Variable | Doc | Required |
/// |--------------|-----|----------|
/// | LOCAL_PATH | The path to the local directory where all data will be stored | Yes |
pub fn load_local() -> Result<Arc<dyn ObjectStore>, Box<dyn Error>> {
    let local_path = env::var("LOCAL_PATH")
        .map_err(|_| CompactorError::MissingEnvironmentVariable("LOCAL_PATH".to_string()))?;
    let lfs = object_store::local::LocalFileSystem::new_with_prefix(local_path)?;
    Ok(Arc::new(lfs) as Arc<dyn ObjectStore>)
}

/// An in-memory store. Its contents are gone when the process exits.
pub fn load_memory() -> Arc<dyn ObjectStore> {
    Arc::new(object_store::memory::InMemory::new())
}
