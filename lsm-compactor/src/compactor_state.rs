use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::{Display, Formatter};

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::compactor_state::CompactionStatus::{InProgress, Submitted};
use crate::db_state::{CoreDbState, SortedRun, SsTableHandle};
use crate::error::CompactorError;

/// An input of a compaction: either a single L0 table or a whole sorted run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceId {
    SortedRun(u32),
    Sst(Ulid),
}

impl Display for SourceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceId::SortedRun(id) => write!(f, "sr:{}", id),
            SourceId::Sst(id) => write!(f, "sst:{}", id),
        }
    }
}

impl SourceId {
    pub fn maybe_unwrap_sorted_run(&self) -> Option<u32> {
        match self {
            SourceId::SortedRun(id) => Some(*id),
            SourceId::Sst(_) => None,
        }
    }

    pub fn maybe_unwrap_sst(&self) -> Option<Ulid> {
        match self {
            SourceId::SortedRun(_) => None,
            SourceId::Sst(id) => Some(*id),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompactionStatus {
    Submitted,
    InProgress,
    Completed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compaction {
    pub status: CompactionStatus,
    pub sources: Vec<SourceId>,
    pub destination: u32,
}

impl Display for Compaction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let displayed_sources: Vec<_> = self.sources.iter().map(|s| format!("{}", s)).collect();
        write!(
            f,
            "{:?} -> {}: {:?}",
            displayed_sources, self.destination, self.status
        )
    }
}

impl Compaction {
    pub fn new(sources: Vec<SourceId>, destination: u32) -> Self {
        Self {
            status: Submitted,
            sources,
            destination,
        }
    }
}

/// The compactor's private view of the tree together with the compactions it has
/// accepted but not yet finished. Active compactions are keyed by destination run.
pub struct CompactorState {
    db_state: CoreDbState,
    compactions: HashMap<u32, Compaction>,
}

impl CompactorState {
    pub fn new(db_state: CoreDbState) -> Self {
        Self {
            db_state,
            compactions: HashMap::new(),
        }
    }

    pub fn db_state(&self) -> &CoreDbState {
        &self.db_state
    }

    /// Active compactions ordered by destination.
    pub fn compactions(&self) -> Vec<Compaction> {
        let mut compactions: Vec<Compaction> = self.compactions.values().cloned().collect();
        compactions.sort_by_key(|c| c.destination);
        compactions
    }

    pub fn num_compactions(&self) -> usize {
        self.compactions.len()
    }

    pub fn submit_compaction(&mut self, compaction: Compaction) -> Result<(), CompactorError> {
        self.validate_compaction(&compaction)?;
        let compaction = Compaction {
            status: Submitted,
            ..compaction
        };
        info!("accepted submitted compaction [compaction={}]", compaction);
        self.compactions.insert(compaction.destination, compaction);
        Ok(())
    }

    pub fn compaction_started(&mut self, destination: u32) -> Result<(), CompactorError> {
        let Some(compaction) = self.compactions.get_mut(&destination) else {
            return Err(CompactorError::NoMatchingCompaction(destination));
        };
        compaction.status = InProgress;
        Ok(())
    }

    pub fn finish_failed_compaction(&mut self, destination: u32) {
        if self.compactions.remove(&destination).is_none() {
            warn!(
                "failed compaction is not active [destination={}]",
                destination
            );
        }
    }

    /// Applies a finished sorted run. The run's tables must be exactly the tables
    /// named by the active compaction with the same destination. The L0 sources
    /// leave `l0`, consumed runs are replaced by the output run, and the watermark
    /// moves to the newest L0 table that was removed.
    pub fn finish_compaction(&mut self, output_sr: SortedRun) -> Result<(), CompactorError> {
        let Some(compaction) = self.compactions.get(&output_sr.id) else {
            error!(
                "finished sorted run has no active compaction [sorted_run={}]",
                output_sr.id
            );
            return Err(CompactorError::NoMatchingCompaction(output_sr.id));
        };
        let expected_ids = self.resolve_source_tables(compaction)?;
        let output_ids: HashSet<Ulid> = output_sr.sst_ids().collect();
        if output_ids.len() != output_sr.ssts.len() || output_ids != expected_ids {
            error!(
                "finished sorted run does not match its compaction [sorted_run={}, compaction={}]",
                output_sr.id, compaction
            );
            return Err(CompactorError::NoMatchingCompaction(output_sr.id));
        }

        let l0_sources: HashSet<Ulid> = compaction
            .sources
            .iter()
            .filter_map(|s| s.maybe_unwrap_sst())
            .collect();
        let run_sources: HashSet<u32> = compaction
            .sources
            .iter()
            .filter_map(|s| s.maybe_unwrap_sorted_run())
            .collect();

        let mut db_state = self.db_state.clone();
        let is_l0_source =
            |sst: &SsTableHandle| sst.compacted_id().is_some_and(|id| l0_sources.contains(&id));
        let newest_removed = db_state
            .l0
            .iter()
            .find(|sst| is_l0_source(*sst))
            .and_then(|sst| sst.compacted_id());
        db_state.l0.retain(|sst| !is_l0_source(sst));
        if newest_removed.is_some() {
            db_state.l0_last_compacted = newest_removed;
        }

        let insert_at = db_state
            .compacted
            .iter()
            .position(|sr| run_sources.contains(&sr.id));
        db_state.compacted.retain(|sr| !run_sources.contains(&sr.id));
        let destination = output_sr.id;
        match insert_at {
            Some(idx) => db_state.compacted.insert(idx, output_sr),
            None => db_state.compacted.push(output_sr),
        }
        db_state.validate()?;

        self.db_state = db_state;
        if let Some(mut compaction) = self.compactions.remove(&destination) {
            compaction.status = CompactionStatus::Completed;
            info!("finished compaction [compaction={}]", compaction);
        }
        Ok(())
    }

    /// Merges a freshly loaded writer snapshot into the local state. Either the
    /// whole merge applies or the local state is left untouched.
    pub fn refresh_db_state(&mut self, writer_state: &CoreDbState) -> Result<(), CompactorError> {
        let merged = merge_writer_db_state(&self.db_state, writer_state)?;
        self.db_state = merged;
        Ok(())
    }

    fn validate_compaction(&self, compaction: &Compaction) -> Result<(), CompactorError> {
        if compaction.sources.is_empty() {
            warn!("submitted compaction has no sources [compaction={}]", compaction);
            return Err(CompactorError::InvalidCompaction);
        }
        if self.compactions.contains_key(&compaction.destination) {
            warn!(
                "submitted compaction is already in progress [compaction={}]",
                compaction
            );
            return Err(CompactorError::InvalidCompaction);
        }
        let mut sources = HashSet::new();
        for source in compaction.sources.iter() {
            if !sources.insert(*source) {
                warn!(
                    "submitted compaction names a source twice [source={}]",
                    source
                );
                return Err(CompactorError::InvalidCompaction);
            }
        }
        if self.db_state.find_sorted_run(compaction.destination).is_some()
            && !sources.contains(&SourceId::SortedRun(compaction.destination))
        {
            warn!(
                "submitted compaction overwrites a sorted run it does not consume [compaction={}]",
                compaction
            );
            return Err(CompactorError::InvalidCompaction);
        }

        self.resolve_source_tables(compaction)?;

        let claimed: HashSet<SourceId> = self
            .compactions
            .values()
            .flat_map(|c| c.sources.iter().copied())
            .collect();
        if let Some(source) = compaction.sources.iter().find(|s| claimed.contains(*s)) {
            return Err(CompactorError::ConflictingSource(*source));
        }

        let l0_sources: HashSet<Ulid> = compaction
            .sources
            .iter()
            .filter_map(|s| s.maybe_unwrap_sst())
            .filter(|id| self.is_in_l0(id))
            .collect();
        let is_oldest_tail = self
            .db_state
            .l0
            .iter()
            .rev()
            .take(l0_sources.len())
            .all(|sst| sst.compacted_id().is_some_and(|id| l0_sources.contains(&id)));
        if !is_oldest_tail {
            return Err(CompactorError::NonContiguousL0Sources);
        }
        Ok(())
    }

    fn is_in_l0(&self, id: &Ulid) -> bool {
        self.db_state
            .l0
            .iter()
            .any(|sst| sst.compacted_id().as_ref() == Some(id))
    }

    // the set of table ids a compaction folds together
    fn resolve_source_tables(&self, compaction: &Compaction) -> Result<HashSet<Ulid>, CompactorError> {
        let mut tables = HashSet::new();
        let mut named_runs = Vec::new();
        for source in compaction.sources.iter() {
            if let SourceId::SortedRun(id) = source {
                let Some(sr) = self.db_state.find_sorted_run(*id) else {
                    return Err(CompactorError::InvalidSource(*source));
                };
                tables.extend(sr.sst_ids());
                named_runs.push(sr);
            }
        }
        for source in compaction.sources.iter() {
            if let SourceId::Sst(id) = source {
                let in_named_run = named_runs.iter().any(|sr| sr.sst_ids().any(|t| t == *id));
                if !self.is_in_l0(id) && !in_named_run {
                    return Err(CompactorError::InvalidSource(*source));
                }
                tables.insert(*id);
            }
        }
        Ok(tables)
    }
}

/// Reconciles the compactor's view with the writer's latest snapshot.
///
/// The writer only ever prepends tables to its l0, so everything strictly newer
/// than `l0_last_compacted` in the writer's l0 is live. The compactor's own l0
/// must be the oldest part of that live range; whatever precedes it was flushed
/// since the last refresh and is prepended. A writer snapshot that already
/// carries the same watermark was written on top of the compactor's output, so
/// its whole l0 is live.
pub(crate) fn merge_writer_db_state(
    local: &CoreDbState,
    writer: &CoreDbState,
) -> Result<CoreDbState, CompactorError> {
    let l0 = match local.l0_last_compacted {
        None => writer.l0.clone(),
        Some(last_compacted) => {
            let live: Vec<&SsTableHandle> = match writer
                .l0
                .iter()
                .position(|sst| sst.compacted_id() == Some(last_compacted))
            {
                Some(pos) => writer.l0.iter().take(pos).collect(),
                None if writer.l0_last_compacted == Some(last_compacted) => {
                    writer.l0.iter().collect()
                }
                None => {
                    return Err(CompactorError::InconsistentManifest(format!(
                        "l0_last_compacted {} not found in writer l0",
                        last_compacted
                    )));
                }
            };
            if live.len() < local.l0.len() {
                return Err(CompactorError::InconsistentManifest(format!(
                    "writer has {} live l0 tables but the compactor holds {}",
                    live.len(),
                    local.l0.len()
                )));
            }
            let new_count = live.len() - local.l0.len();
            let held_matches = live[new_count..]
                .iter()
                .zip(local.l0.iter())
                .all(|(w, l)| w.id == l.id);
            if !held_matches {
                return Err(CompactorError::InconsistentManifest(
                    "compactor l0 is not the oldest part of the writer's live l0".to_string(),
                ));
            }
            live[..new_count]
                .iter()
                .map(|sst| (*sst).clone())
                .chain(local.l0.iter().cloned())
                .collect::<VecDeque<SsTableHandle>>()
        }
    };
    let merged = CoreDbState {
        l0_last_compacted: local.l0_last_compacted,
        l0,
        compacted: local.compacted.clone(),
        next_wal_sst_id: writer.next_wal_sst_id,
        last_compacted_wal_sst_id: writer.last_compacted_wal_sst_id,
    };
    merged.validate()?;
    Ok(merged)
}
