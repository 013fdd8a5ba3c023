use std::collections::{HashSet, VecDeque};
use std::fmt::{Debug, Display, Formatter};

use bytes::Bytes;
use log::debug;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::CompactorError;

/// Identity of a sorted table file. Tables produced by the write path start out
/// `Unassigned` and are given a `Compacted` id before the manifest records them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum SsTableId {
    Unassigned,
    Compacted(Ulid),
}

impl SsTableId {
    pub fn compacted_id(&self) -> Option<Ulid> {
        match self {
            SsTableId::Compacted(id) => Some(*id),
            SsTableId::Unassigned => None,
        }
    }
}

impl Display for SsTableId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SsTableId::Unassigned => write!(f, "unassigned"),
            SsTableId::Compacted(id) => write!(f, "{}", id),
        }
    }
}

/// Physical layout facts about a table file that the compactor needs for planning.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct SsTableInfo {
    pub first_key: Option<Bytes>,
    pub index_offset: u64,
    pub index_len: u64,
    pub filter_offset: u64,
    pub filter_len: u64,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsTableHandle {
    pub id: SsTableId,
    pub info: SsTableInfo,
}

impl Debug for SsTableHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SsTableHandle({}, {:?})", self.id, self.info.first_key)
    }
}

impl SsTableHandle {
    pub fn new(id: SsTableId, info: SsTableInfo) -> Self {
        Self { id, info }
    }

    /// Returns a copy of this handle with its identity set to `Compacted(id)`.
    pub fn with_compacted_id(&self, id: Ulid) -> Self {
        Self {
            id: SsTableId::Compacted(id),
            info: self.info.clone(),
        }
    }

    pub fn compacted_id(&self) -> Option<Ulid> {
        self.id.compacted_id()
    }

    pub(crate) fn estimate_size(&self) -> u64 {
        // the index is the last block before the info footer, so its end offset
        // approximates the file size
        self.info.index_offset + self.info.index_len
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct SortedRun {
    pub id: u32,
    pub ssts: Vec<SsTableHandle>,
}

impl SortedRun {
    pub fn new(id: u32, ssts: Vec<SsTableHandle>) -> Self {
        Self { id, ssts }
    }

    pub(crate) fn estimate_size(&self) -> u64 {
        self.ssts.iter().map(|sst| sst.estimate_size()).sum()
    }

    pub(crate) fn sst_ids(&self) -> impl Iterator<Item = Ulid> + '_ {
        self.ssts.iter().filter_map(|sst| sst.compacted_id())
    }
}

/// The persisted state of the tree: the newest-first L0 list, the sorted runs
/// produced by compaction, and the WAL counters owned by the writer.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct CoreDbState {
    pub l0_last_compacted: Option<Ulid>,
    pub l0: VecDeque<SsTableHandle>,
    pub compacted: Vec<SortedRun>,
    pub next_wal_sst_id: u64,
    pub last_compacted_wal_sst_id: u64,
}

impl Default for CoreDbState {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreDbState {
    pub fn new() -> Self {
        Self {
            l0_last_compacted: None,
            l0: VecDeque::new(),
            compacted: Vec::new(),
            next_wal_sst_id: 1,
            last_compacted_wal_sst_id: 0,
        }
    }

    pub fn l0_ids(&self) -> Vec<Option<Ulid>> {
        self.l0.iter().map(|sst| sst.compacted_id()).collect()
    }

    pub(crate) fn find_sorted_run(&self, id: u32) -> Option<&SortedRun> {
        self.compacted.iter().find(|sr| sr.id == id)
    }

    /// Checks the structural invariants of the state: every recorded table has an
    /// assigned id, no table is held twice, run ids are unique, and the l0
    /// watermark does not name a table still in l0.
    pub(crate) fn validate(&self) -> Result<(), CompactorError> {
        let mut seen = HashSet::new();
        for sst in self
            .l0
            .iter()
            .chain(self.compacted.iter().flat_map(|sr| sr.ssts.iter()))
        {
            let Some(id) = sst.compacted_id() else {
                return Err(CompactorError::InvalidDBState(
                    "table without an assigned id".to_string(),
                ));
            };
            if !seen.insert(id) {
                return Err(CompactorError::InvalidDBState(format!(
                    "table {} is held more than once",
                    id
                )));
            }
        }
        let mut run_ids = HashSet::new();
        for sr in self.compacted.iter() {
            if !run_ids.insert(sr.id) {
                return Err(CompactorError::InvalidDBState(format!(
                    "sorted run {} appears more than once",
                    sr.id
                )));
            }
        }
        if let Some(last_compacted) = self.l0_last_compacted {
            if self.l0.iter().any(|sst| sst.compacted_id() == Some(last_compacted)) {
                return Err(CompactorError::InvalidDBState(format!(
                    "l0_last_compacted {} is still in l0",
                    last_compacted
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn log_db_runs(&self) {
        let l0s: Vec<_> = self.l0.iter().map(|l0| l0.estimate_size()).collect();
        let compacted: Vec<_> = self
            .compacted
            .iter()
            .map(|sr| (sr.id, sr.estimate_size()))
            .collect();
        debug!("DB Levels:");
        debug!("-----------------");
        debug!("{:?}", l0s);
        debug!("{:?}", compacted);
        debug!("-----------------");
    }
}
