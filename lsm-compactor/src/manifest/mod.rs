use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::db_state::CoreDbState;
use crate::error::CompactorError;

pub(crate) mod store;

const MANIFEST_FORMAT_VERSION: u16 = 1;

/// One durable version of the tree's state, together with the fencing epochs of
/// the writer and compactor that last claimed it.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Debug)]
pub struct Manifest {
    pub core: CoreDbState,
    pub writer_epoch: u64,
    pub compactor_epoch: u64,
}

impl Manifest {
    pub(crate) fn initial(core: CoreDbState) -> Self {
        Self {
            core,
            writer_epoch: 0,
            compactor_epoch: 0,
        }
    }
}

pub(crate) trait ManifestCodec: Send + Sync {
    fn encode(&self, manifest: &Manifest) -> Result<Bytes, CompactorError>;

    fn decode(&self, bytes: &Bytes) -> Result<Manifest, CompactorError>;
}

#[derive(Serialize)]
struct VersionedManifestRef<'a> {
    format_version: u16,
    manifest: &'a Manifest,
}

#[derive(Deserialize)]
struct VersionedManifest {
    format_version: u16,
    manifest: serde_json::Value,
}

/// Stores manifests as JSON documents tagged with a format version.
pub(crate) struct JsonManifestCodec {}

impl ManifestCodec for JsonManifestCodec {
    fn encode(&self, manifest: &Manifest) -> Result<Bytes, CompactorError> {
        let versioned = VersionedManifestRef {
            format_version: MANIFEST_FORMAT_VERSION,
            manifest,
        };
        Ok(Bytes::from(serde_json::to_vec(&versioned)?))
    }

    fn decode(&self, bytes: &Bytes) -> Result<Manifest, CompactorError> {
        let versioned: VersionedManifest = serde_json::from_slice(bytes)?;
        if versioned.format_version != MANIFEST_FORMAT_VERSION {
            return Err(CompactorError::InvalidVersion {
                expected_version: MANIFEST_FORMAT_VERSION,
                actual_version: versioned.format_version,
            });
        }
        Ok(serde_json::from_value(versioned.manifest)?)
    }
}
