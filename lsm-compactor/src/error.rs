use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error as ThisError;

use crate::compactor_state::SourceId;

#[non_exhaustive]
#[derive(Clone, Debug, ThisError)]
pub enum CompactorError {
    #[error("io error")]
    IoError(#[from] Arc<std::io::Error>),

    #[error("object store error")]
    ObjectStoreError(#[from] Arc<object_store::Error>),

    #[error("manifest encoding error")]
    ManifestEncodingError(#[from] Arc<serde_json::Error>),

    #[error("manifest file already exists")]
    ManifestVersionExists,

    #[error("failed to find manifest with id. id=`{0}`")]
    ManifestMissing(u64),

    #[error("failed to find latest manifest")]
    LatestManifestMissing,

    #[error("invalid manifest path. path=`{0}`")]
    InvalidManifestPath(String),

    #[error("invalid deletion")]
    InvalidDeletion,

    #[error("invalid DB state. reason=`{0}`")]
    InvalidDBState(String),

    #[error("invalid compaction")]
    InvalidCompaction,

    #[error("compaction source not present in db state. source=`{0}`")]
    InvalidSource(SourceId),

    #[error("compaction source already claimed by an active compaction. source=`{0}`")]
    ConflictingSource(SourceId),

    #[error("l0 sources must be the oldest contiguous tables of l0")]
    NonContiguousL0Sources,

    #[error("finished sorted run matches no active compaction. sorted_run=`{0}`")]
    NoMatchingCompaction(u32),

    #[error("writer manifest is inconsistent with compactor state. reason=`{0}`")]
    InconsistentManifest(String),

    #[error("compaction executor failed")]
    CompactionExecutorFailed,

    #[error("detected newer compactor or writer")]
    Fenced,

    #[error(
        "byte format version mismatch. expected_version=`{expected_version}`, actual_version=`{actual_version}`"
    )]
    InvalidVersion {
        expected_version: u16,
        actual_version: u16,
    },

    #[error("manifest update timeout after {timeout:?}")]
    ManifestUpdateTimeout { timeout: Duration },

    #[error("unknown configuration file format. path=`{0}`")]
    UnknownConfigurationFormat(PathBuf),

    #[error("invalid configuration format")]
    InvalidConfigurationFormat(#[from] Box<figment::Error>),

    #[error("unsupported object store provider. provider=`{0}`")]
    UnsupportedObjectStoreProvider(String),

    #[error("missing environment variable. name=`{0}`")]
    MissingEnvironmentVariable(String),
}

impl From<std::io::Error> for CompactorError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(Arc::new(value))
    }
}

impl From<object_store::Error> for CompactorError {
    fn from(value: object_store::Error) -> Self {
        Self::ObjectStoreError(Arc::new(value))
    }
}

impl From<serde_json::Error> for CompactorError {
    fn from(value: serde_json::Error) -> Self {
        Self::ManifestEncodingError(Arc::new(value))
    }
}
