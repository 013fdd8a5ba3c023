use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use ulid::Ulid;

use crate::compactor_executor::{CompactionExecutor, CompactionJob, TokioCompactionExecutor};
use crate::compactor_state::{Compaction, CompactorState};
use crate::config::CompactorOptions;
use crate::db_state::{SortedRun, SsTableHandle};
use crate::error::CompactorError;
use crate::manifest::store::{FenceableManifest, ManifestStore, StoredManifest};

pub trait CompactionSchedulerSupplier: Send + Sync {
    fn compaction_scheduler(
        &self,
        options: &CompactorOptions,
    ) -> Box<dyn CompactionScheduler + Send + Sync>;
}

pub trait CompactionScheduler: Send + Sync {
    fn maybe_schedule_compaction(&self, state: &CompactorState) -> Vec<Compaction>;
}

pub(crate) enum WorkerToOrchestratorMsg {
    CompactionFinished {
        destination: u32,
        result: Result<SortedRun, CompactorError>,
    },
}

/// The compactor folds L0 tables and sorted runs into new sorted runs. It's made up
/// of a few components:
///
/// - [`Compactor`]: the event loop. It listens on the manifest poll ticker, the
///   executor's result channel and the cancellation token, and hands each event
///   to a `CompactorEventHandler`.
/// - `CompactorEventHandler`: owns the [`CompactorState`] and the fenced manifest,
///   reconciles the state with the writer's manifest, and writes the result of
///   every finished compaction back.
/// - [`CompactionScheduler`]: decides which compactions should run. The policy is
///   plugged in through a [`CompactionSchedulerSupplier`]; the provided one is
///   [`crate::size_tiered_compaction::SizeTieredCompactionSchedulerSupplier`].
/// - `CompactionExecutor`: runs accepted compactions on a tokio runtime.
#[derive(Clone)]
pub struct Compactor {
    manifest_store: Arc<ManifestStore>,
    options: Arc<CompactorOptions>,
    scheduler_supplier: Arc<dyn CompactionSchedulerSupplier>,
    cancellation_token: CancellationToken,
}

impl Compactor {
    pub fn new(
        manifest_store: Arc<ManifestStore>,
        options: CompactorOptions,
        scheduler_supplier: Arc<dyn CompactionSchedulerSupplier>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            manifest_store,
            options: Arc::new(options),
            scheduler_supplier,
            cancellation_token,
        }
    }

    /// Runs the compaction event loop until the cancellation token is cancelled or
    /// a fatal error occurs. Compaction jobs run on `compactor_runtime`, the loop
    /// itself runs on the current runtime.
    pub async fn run_async_task(&self, compactor_runtime: Handle) -> Result<(), CompactorError> {
        let mut db_runs_log_ticker = tokio::time::interval(Duration::from_secs(10));
        let mut manifest_poll_ticker = tokio::time::interval(self.options.poll_interval);
        let (worker_tx, mut worker_rx) = tokio::sync::mpsc::unbounded_channel();
        let scheduler = Arc::from(self.scheduler_supplier.compaction_scheduler(&self.options));
        let executor = Arc::new(TokioCompactionExecutor::new(compactor_runtime, worker_tx));
        let mut handler = CompactorEventHandler::new(
            self.manifest_store.clone(),
            self.options.clone(),
            scheduler,
            executor,
        )
        .await?;

        loop {
            tokio::select! {
                biased;
                _ = self.cancellation_token.cancelled() => {
                    break;
                }
                _ = db_runs_log_ticker.tick() => {
                    handler.handle_log_ticker();
                }
                _ = manifest_poll_ticker.tick() => {
                    handler.handle_ticker().await?;
                }
                msg = worker_rx.recv() => {
                    let Some(msg) = msg else {
                        return Err(CompactorError::CompactionExecutorFailed);
                    };
                    handler.handle_worker_rx(msg).await?;
                }
            }
        }

        handler.stop_executor();
        // results that arrived before the executor stopped are still applied
        while let Ok(msg) = worker_rx.try_recv() {
            handler.handle_worker_rx(msg).await?;
        }
        Ok(())
    }
}

struct CompactorEventHandler {
    state: CompactorState,
    manifest: FenceableManifest,
    options: Arc<CompactorOptions>,
    scheduler: Arc<dyn CompactionScheduler + Send + Sync>,
    executor: Arc<dyn CompactionExecutor + Send + Sync>,
}

impl CompactorEventHandler {
    async fn new(
        manifest_store: Arc<ManifestStore>,
        options: Arc<CompactorOptions>,
        scheduler: Arc<dyn CompactionScheduler + Send + Sync>,
        executor: Arc<dyn CompactionExecutor + Send + Sync>,
    ) -> Result<Self, CompactorError> {
        let stored_manifest = StoredManifest::load(manifest_store).await?;
        let manifest =
            FenceableManifest::init_compactor(stored_manifest, options.manifest_update_timeout)
                .await?;
        let state = CompactorState::new(manifest.db_state()?.clone());
        Ok(Self {
            state,
            manifest,
            options,
            scheduler,
            executor,
        })
    }

    fn handle_log_ticker(&self) {
        self.log_compaction_state();
    }

    async fn handle_ticker(&mut self) -> Result<(), CompactorError> {
        if self.executor.is_stopped() {
            return Ok(());
        }
        self.load_manifest().await
    }

    async fn handle_worker_rx(&mut self, msg: WorkerToOrchestratorMsg) -> Result<(), CompactorError> {
        match msg {
            WorkerToOrchestratorMsg::CompactionFinished {
                destination,
                result,
            } => match result {
                Ok(sr) => self.finish_compaction(sr).await,
                Err(err) => {
                    error!(
                        "error executing compaction [destination={}]: {:#?}",
                        destination, err
                    );
                    self.finish_failed_compaction(destination);
                    Ok(())
                }
            },
        }
    }

    fn stop_executor(&self) {
        self.executor.stop();
    }

    async fn load_manifest(&mut self) -> Result<(), CompactorError> {
        self.manifest.refresh().await?;
        self.refresh_db_state().await
    }

    async fn write_manifest(&mut self) -> Result<(), CompactorError> {
        let core = self.state.db_state().clone();
        self.manifest.update_db_state(core).await
    }

    async fn write_manifest_safely(&mut self) -> Result<(), CompactorError> {
        let timeout = self.options.manifest_update_timeout;
        tokio::time::timeout(timeout, self.write_manifest_with_retries())
            .await
            .map_err(|_| CompactorError::ManifestUpdateTimeout { timeout })?
    }

    async fn write_manifest_with_retries(&mut self) -> Result<(), CompactorError> {
        loop {
            self.manifest.refresh().await?;
            self.state.refresh_db_state(self.manifest.db_state()?)?;
            match self.write_manifest().await {
                Ok(()) => return Ok(()),
                Err(CompactorError::ManifestVersionExists) => {
                    warn!("conflicting manifest version. updating and retrying write again.");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn maybe_schedule_compactions(&mut self) -> Result<(), CompactorError> {
        let compactions = self.scheduler.maybe_schedule_compaction(&self.state);
        for compaction in compactions.into_iter() {
            if self.state.num_compactions() >= self.options.max_concurrent_compactions {
                info!(
                    "already running {} compactions, which is at the max {}. Won't run compaction {}",
                    self.state.num_compactions(),
                    self.options.max_concurrent_compactions,
                    compaction
                );
                break;
            }
            self.submit_compaction(compaction).await?;
        }
        Ok(())
    }

    async fn start_compaction(&mut self, compaction: Compaction) -> Result<(), CompactorError> {
        self.log_compaction_state();
        let db_state = self.state.db_state();
        let l0_by_id: HashMap<Ulid, &SsTableHandle> = db_state
            .l0
            .iter()
            .filter_map(|sst| sst.compacted_id().map(|id| (id, sst)))
            .collect();
        let srs_by_id: HashMap<u32, &SortedRun> =
            db_state.compacted.iter().map(|sr| (sr.id, sr)).collect();
        let ssts: Vec<SsTableHandle> = compaction
            .sources
            .iter()
            .filter_map(|s| s.maybe_unwrap_sst())
            .filter_map(|id| l0_by_id.get(&id).map(|sst| (*sst).clone()))
            .collect();
        let sorted_runs: Vec<SortedRun> = compaction
            .sources
            .iter()
            .filter_map(|s| s.maybe_unwrap_sorted_run())
            .filter_map(|id| srs_by_id.get(&id).map(|sr| (*sr).clone()))
            .collect();
        let job = CompactionJob {
            destination: compaction.destination,
            ssts,
            sorted_runs,
        };
        self.state.compaction_started(compaction.destination)?;
        self.executor.start_compaction(job);
        Ok(())
    }

    // state writers
    fn finish_failed_compaction(&mut self, destination: u32) {
        self.state.finish_failed_compaction(destination);
    }

    #[instrument(level = "debug", skip_all, fields(destination = output_sr.id))]
    async fn finish_compaction(&mut self, output_sr: SortedRun) -> Result<(), CompactorError> {
        self.state.finish_compaction(output_sr)?;
        self.log_compaction_state();
        self.write_manifest_safely().await?;
        self.maybe_schedule_compactions().await
    }

    #[instrument(level = "debug", skip_all, fields(destination = compaction.destination))]
    async fn submit_compaction(&mut self, compaction: Compaction) -> Result<(), CompactorError> {
        match self.state.submit_compaction(compaction.clone()) {
            Ok(()) => self.start_compaction(compaction).await,
            Err(err) => {
                warn!("invalid compaction [compaction={}]: {:?}", compaction, err);
                Ok(())
            }
        }
    }

    async fn refresh_db_state(&mut self) -> Result<(), CompactorError> {
        self.state.refresh_db_state(self.manifest.db_state()?)?;
        self.maybe_schedule_compactions().await
    }

    fn log_compaction_state(&self) {
        self.state.db_state().log_db_runs();
        for compaction in self.state.compactions().iter() {
            info!("in-flight compaction: {}", compaction);
        }
    }
}
