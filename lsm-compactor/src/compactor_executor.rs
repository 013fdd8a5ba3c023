use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::compactor::WorkerToOrchestratorMsg;
use crate::db_state::{SortedRun, SsTableHandle};
use crate::error::CompactorError;

/// The inputs of one accepted compaction, resolved to table handles.
pub(crate) struct CompactionJob {
    pub(crate) destination: u32,
    pub(crate) ssts: Vec<SsTableHandle>,
    pub(crate) sorted_runs: Vec<SortedRun>,
}

impl CompactionJob {
    pub(crate) fn estimated_source_bytes(&self) -> u64 {
        let sst_bytes: u64 = self.ssts.iter().map(|sst| sst.estimate_size()).sum();
        let sr_bytes: u64 = self.sorted_runs.iter().map(|sr| sr.estimate_size()).sum();
        sst_bytes + sr_bytes
    }
}

pub(crate) trait CompactionExecutor {
    fn start_compaction(&self, compaction: CompactionJob);

    fn stop(&self);

    fn is_stopped(&self) -> bool;
}

/// Runs compaction jobs as tasks on a tokio runtime and reports each result to the
/// compactor's event loop.
pub(crate) struct TokioCompactionExecutor {
    inner: Arc<TokioCompactionExecutorInner>,
}

impl TokioCompactionExecutor {
    pub(crate) fn new(
        handle: tokio::runtime::Handle,
        worker_tx: UnboundedSender<WorkerToOrchestratorMsg>,
    ) -> Self {
        Self {
            inner: Arc::new(TokioCompactionExecutorInner {
                handle,
                worker_tx,
                tasks: Mutex::new(HashMap::new()),
                is_stopped: AtomicBool::new(false),
            }),
        }
    }
}

impl CompactionExecutor for TokioCompactionExecutor {
    fn start_compaction(&self, compaction: CompactionJob) {
        self.inner.start_compaction(compaction);
    }

    fn stop(&self) {
        self.inner.stop();
    }

    fn is_stopped(&self) -> bool {
        self.inner.is_stopped.load(Ordering::SeqCst)
    }
}

struct TokioCompactionExecutorInner {
    handle: tokio::runtime::Handle,
    worker_tx: UnboundedSender<WorkerToOrchestratorMsg>,
    tasks: Mutex<HashMap<u32, JoinHandle<()>>>,
    is_stopped: AtomicBool,
}

impl TokioCompactionExecutorInner {
    // Source tables move into the output run as they are: the run keeps the
    // source handles ordered by their first key.
    async fn execute_compaction(compaction: CompactionJob) -> Result<SortedRun, CompactorError> {
        debug!(
            "executing compaction [destination={}, estimated_source_bytes={}]",
            compaction.destination,
            compaction.estimated_source_bytes()
        );
        let mut ssts: Vec<SsTableHandle> = compaction
            .ssts
            .into_iter()
            .chain(compaction.sorted_runs.into_iter().flat_map(|sr| sr.ssts))
            .collect();
        if ssts.is_empty() {
            return Err(CompactorError::InvalidCompaction);
        }
        ssts.sort_by(|a, b| a.info.first_key.cmp(&b.info.first_key));
        Ok(SortedRun::new(compaction.destination, ssts))
    }

    fn start_compaction(self: &Arc<Self>, compaction: CompactionJob) {
        if self.is_stopped.load(Ordering::SeqCst) {
            warn!(
                "executor is stopped, dropping compaction [destination={}]",
                compaction.destination
            );
            return;
        }
        let mut tasks = self.tasks.lock();
        let destination = compaction.destination;
        if tasks.contains_key(&destination) {
            warn!(
                "compaction is already running [destination={}]",
                destination
            );
            return;
        }
        let this = self.clone();
        let task = self.handle.spawn(async move {
            let result = Self::execute_compaction(compaction).await;
            if this
                .worker_tx
                .send(WorkerToOrchestratorMsg::CompactionFinished {
                    destination,
                    result,
                })
                .is_err()
            {
                debug!(
                    "compactor is gone, dropping compaction result [destination={}]",
                    destination
                );
            }
            this.tasks.lock().remove(&destination);
        });
        tasks.insert(destination, task);
    }

    fn stop(&self) {
        self.is_stopped.store(true, Ordering::SeqCst);
        let mut tasks = self.tasks.lock();
        for (_, task) in tasks.drain() {
            task.abort();
        }
    }
}
