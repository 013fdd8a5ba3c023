use bytes::Bytes;
use ulid::Ulid;

use crate::db_state::{CoreDbState, SsTableHandle, SsTableId, SsTableInfo};
use crate::error::CompactorError;
use crate::manifest::store::{apply_db_state_update, StoredManifest};

pub(crate) fn ulid(n: u128) -> Ulid {
    Ulid::from(n)
}

/// A table whose id and first key are both derived from `n`.
pub(crate) fn sst_handle(n: u128) -> SsTableHandle {
    SsTableHandle::new(
        SsTableId::Compacted(ulid(n)),
        SsTableInfo {
            first_key: Some(Bytes::copy_from_slice(&n.to_be_bytes())),
            index_offset: 4096,
            index_len: 64,
            filter_offset: 4000,
            filter_len: 96,
        },
    )
}

/// Builds a state whose l0 holds tables for `ids`, newest first.
pub(crate) fn db_state_with_l0(ids: &[u128]) -> CoreDbState {
    let mut state = CoreDbState::new();
    state.l0 = ids.iter().map(|id| sst_handle(*id)).collect();
    state
}

/// Records a freshly flushed table at the head of the manifest's l0 the way the
/// write path does, retrying on version conflicts.
pub(crate) async fn flush_l0(
    manifest: &mut StoredManifest,
    handle: SsTableHandle,
) -> Result<(), CompactorError> {
    apply_db_state_update(manifest, |stored| {
        let mut state = stored.db_state().clone();
        state.l0.push_front(handle.clone());
        state.next_wal_sst_id += 1;
        Ok(state)
    })
    .await
}
