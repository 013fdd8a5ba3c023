#![warn(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![warn(clippy::panic)]
#![cfg_attr(test, allow(clippy::panic))]
#![allow(clippy::result_large_err)]

/// Re-export the bytes crate.
///
/// Table handles carry their first key as [`bytes::Bytes`].
pub use bytes;

/// Re-export the object store crate.
///
/// This is useful for callers that want to point the compactor at a store
/// without depending on the object store crate directly.
pub use object_store;

pub use compactor::{CompactionScheduler, CompactionSchedulerSupplier, Compactor};
pub use compactor_state::{Compaction, CompactionStatus, CompactorState, SourceId};
pub use config::{CompactorOptions, Settings, SizeTieredCompactionSchedulerOptions};
pub use db_state::{CoreDbState, SortedRun, SsTableHandle, SsTableId, SsTableInfo};
pub use error::CompactorError;
pub use manifest::store::{
    apply_db_state_update, FenceableManifest, ManifestFileMetadata, ManifestStore,
    StoredManifest,
};
pub use manifest::Manifest;
pub use size_tiered_compaction::SizeTieredCompactionSchedulerSupplier;

pub mod admin;
pub mod config;
pub mod size_tiered_compaction;

mod compactor;
mod compactor_executor;
mod compactor_state;
mod db_state;
mod error;
mod manifest;
#[cfg(test)]
mod test_utils;
mod transactional_object;
