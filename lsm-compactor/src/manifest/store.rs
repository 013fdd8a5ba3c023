use std::ops::RangeBounds;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use log::warn;
use object_store::path::Path;
use object_store::Error::AlreadyExists;
use object_store::{Error, ObjectStore};
use serde::Serialize;

use crate::db_state::CoreDbState;
use crate::error::CompactorError;
use crate::manifest::{JsonManifestCodec, Manifest, ManifestCodec};
use crate::transactional_object::{DelegatingTransactionalObjectStore, TransactionalObjectStore};

/// Applies `mutator` to the stored manifest and writes the result as the next
/// version. When another client wins the race for that version, the manifest is
/// refreshed and the mutation is applied again.
pub async fn apply_db_state_update<F>(
    manifest: &mut StoredManifest,
    mutator: F,
) -> Result<(), CompactorError>
where
    F: Fn(&StoredManifest) -> Result<CoreDbState, CompactorError>,
{
    loop {
        let mutated_db_state = mutator(manifest)?;
        match manifest.update_db_state(mutated_db_state).await {
            Err(CompactorError::ManifestVersionExists) => {
                manifest.refresh().await?;
            }
            result => return result,
        }
    }
}

/// Wraps [`StoredManifest`] and fences out older writers or compactors by bumping
/// the matching epoch when opened. Once a newer epoch is stored, every operation
/// fails with [`CompactorError::Fenced`].
pub struct FenceableManifest {
    stored_manifest: StoredManifest,
    local_epoch: u64,
    stored_epoch: fn(&Manifest) -> u64,
}

impl FenceableManifest {
    pub async fn init_writer(
        stored_manifest: StoredManifest,
        manifest_update_timeout: Duration,
    ) -> Result<Self, CompactorError> {
        Self::init(
            stored_manifest,
            manifest_update_timeout,
            |m| m.writer_epoch,
            |m, e| m.writer_epoch = e,
        )
        .await
    }

    pub async fn init_compactor(
        stored_manifest: StoredManifest,
        manifest_update_timeout: Duration,
    ) -> Result<Self, CompactorError> {
        Self::init(
            stored_manifest,
            manifest_update_timeout,
            |m| m.compactor_epoch,
            |m, e| m.compactor_epoch = e,
        )
        .await
    }

    // Claims the next epoch on top of the latest manifest. A concurrent update of
    // the same version refreshes the manifest and claims again.
    async fn init(
        mut stored_manifest: StoredManifest,
        manifest_update_timeout: Duration,
        stored_epoch: fn(&Manifest) -> u64,
        set_epoch: fn(&mut Manifest, u64),
    ) -> Result<Self, CompactorError> {
        tokio::time::timeout(manifest_update_timeout, async move {
            loop {
                let mut manifest = stored_manifest.manifest.clone();
                let local_epoch = stored_epoch(&manifest) + 1;
                set_epoch(&mut manifest, local_epoch);
                match stored_manifest.update_manifest(manifest).await {
                    Err(CompactorError::ManifestVersionExists) => {
                        warn!("conflicting manifest version while claiming epoch. retrying.");
                        stored_manifest.refresh().await?;
                    }
                    Err(err) => return Err(err),
                    Ok(()) => {
                        return Ok(Self {
                            stored_manifest,
                            local_epoch,
                            stored_epoch,
                        })
                    }
                }
            }
        })
        .await
        .map_err(|_| CompactorError::ManifestUpdateTimeout {
            timeout: manifest_update_timeout,
        })?
    }

    pub fn db_state(&self) -> Result<&CoreDbState, CompactorError> {
        self.check_epoch()?;
        Ok(self.stored_manifest.db_state())
    }

    pub async fn refresh(&mut self) -> Result<&CoreDbState, CompactorError> {
        self.stored_manifest.refresh().await?;
        self.db_state()
    }

    pub async fn update_db_state(&mut self, db_state: CoreDbState) -> Result<(), CompactorError> {
        self.check_epoch()?;
        self.stored_manifest.update_db_state(db_state).await
    }

    fn check_epoch(&self) -> Result<(), CompactorError> {
        let stored_epoch = (self.stored_epoch)(&self.stored_manifest.manifest);
        if self.local_epoch < stored_epoch {
            return Err(CompactorError::Fenced);
        }
        if self.local_epoch > stored_epoch {
            return Err(CompactorError::InvalidDBState(format!(
                "stored epoch {} is lower than local epoch {}",
                stored_epoch, self.local_epoch
            )));
        }
        Ok(())
    }
}

/// The latest manifest version known to this client. Updates are written with the
/// next consecutive id and only succeed if no other client has written that id.
pub struct StoredManifest {
    id: u64,
    manifest: Manifest,
    manifest_store: Arc<ManifestStore>,
}

impl StoredManifest {
    pub async fn create_new_db(
        store: Arc<ManifestStore>,
        core: CoreDbState,
    ) -> Result<Self, CompactorError> {
        let manifest = Manifest::initial(core);
        store.write_manifest(1, &manifest).await?;
        Ok(Self {
            id: 1,
            manifest,
            manifest_store: store,
        })
    }

    /// Loads the latest manifest, failing if the store holds none.
    pub async fn load(store: Arc<ManifestStore>) -> Result<Self, CompactorError> {
        Self::try_load(store)
            .await?
            .ok_or(CompactorError::LatestManifestMissing)
    }

    pub async fn try_load(store: Arc<ManifestStore>) -> Result<Option<Self>, CompactorError> {
        let Some((id, manifest)) = store.read_latest_manifest().await? else {
            return Ok(None);
        };
        Ok(Some(Self {
            id,
            manifest,
            manifest_store: store,
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn db_state(&self) -> &CoreDbState {
        &self.manifest.core
    }

    pub async fn refresh(&mut self) -> Result<&CoreDbState, CompactorError> {
        let Some((id, manifest)) = self.manifest_store.read_latest_manifest().await? else {
            return Err(CompactorError::LatestManifestMissing);
        };
        self.manifest = manifest;
        self.id = id;
        Ok(&self.manifest.core)
    }

    pub async fn update_db_state(&mut self, core: CoreDbState) -> Result<(), CompactorError> {
        let manifest = Manifest {
            core,
            writer_epoch: self.manifest.writer_epoch,
            compactor_epoch: self.manifest.compactor_epoch,
        };
        self.update_manifest(manifest).await
    }

    async fn update_manifest(&mut self, manifest: Manifest) -> Result<(), CompactorError> {
        let new_id = self.id + 1;
        self.manifest_store.write_manifest(new_id, &manifest).await?;
        self.manifest = manifest;
        self.id = new_id;
        Ok(())
    }
}

/// Metadata of one manifest file in the object store.
#[derive(Serialize, Debug)]
pub struct ManifestFileMetadata {
    pub id: u64,
    #[serde(serialize_with = "serialize_path")]
    pub location: Path,
    pub last_modified: chrono::DateTime<Utc>,
    pub size: usize,
}

fn serialize_path<S>(path: &Path, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(path.as_ref())
}

pub struct ManifestStore {
    object_store: Box<dyn TransactionalObjectStore>,
    codec: Box<dyn ManifestCodec>,
    manifest_suffix: &'static str,
}

impl ManifestStore {
    pub fn new(root_path: &Path, object_store: Arc<dyn ObjectStore>) -> Self {
        Self {
            object_store: Box::new(DelegatingTransactionalObjectStore::new(
                root_path.child("manifest"),
                object_store,
            )),
            codec: Box::new(JsonManifestCodec {}),
            manifest_suffix: "manifest",
        }
    }

    pub async fn write_manifest(&self, id: u64, manifest: &Manifest) -> Result<(), CompactorError> {
        let manifest_path = &self.get_manifest_path(id);

        self.object_store
            .put_if_not_exists(manifest_path, self.codec.encode(manifest)?)
            .await
            .map_err(|err| {
                if let AlreadyExists { path: _, source: _ } = err {
                    CompactorError::ManifestVersionExists
                } else {
                    CompactorError::from(err)
                }
            })?;

        Ok(())
    }

    /// Deletes an old manifest version. The latest version can't be deleted.
    pub async fn delete_manifest(&self, id: u64) -> Result<(), CompactorError> {
        let (active_id, _) = self
            .read_latest_manifest()
            .await?
            .ok_or(CompactorError::LatestManifestMissing)?;
        if active_id == id {
            return Err(CompactorError::InvalidDeletion);
        }
        let manifest_path = &self.get_manifest_path(id);
        self.object_store.delete(manifest_path).await?;
        Ok(())
    }

    /// Lists manifests whose id falls in `id_range`, ordered by id. The last entry
    /// of an unbounded listing is the current manifest.
    pub async fn list_manifests<R: RangeBounds<u64>>(
        &self,
        id_range: R,
    ) -> Result<Vec<ManifestFileMetadata>, CompactorError> {
        let manifest_path = &Path::from("/");
        let mut files_stream = self.object_store.list(Some(manifest_path));
        let mut manifests = Vec::new();

        while let Some(file) = files_stream.next().await.transpose()? {
            match self.parse_id(&file.location) {
                Ok(id) if id_range.contains(&id) => {
                    manifests.push(ManifestFileMetadata {
                        id,
                        location: file.location,
                        last_modified: file.last_modified,
                        size: file.size,
                    });
                }
                Err(_) => warn!("unknown file in manifest directory: {:?}", file.location),
                _ => {}
            }
        }

        manifests.sort_by_key(|m| m.id);
        Ok(manifests)
    }

    pub async fn read_latest_manifest(&self) -> Result<Option<(u64, Manifest)>, CompactorError> {
        let manifest_metadatas_list = self.list_manifests(..).await?;
        let Some(metadata) = manifest_metadatas_list.last() else {
            return Ok(None);
        };
        let manifest = self.read_manifest(metadata.id).await?;
        Ok(manifest.map(|manifest| (metadata.id, manifest)))
    }

    pub async fn read_manifest(&self, id: u64) -> Result<Option<Manifest>, CompactorError> {
        let manifest_path = &self.get_manifest_path(id);
        match self.object_store.get(manifest_path).await {
            Ok(manifest) => {
                let bytes = manifest.bytes().await?;
                Ok(Some(self.codec.decode(&bytes)?))
            }
            Err(Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(CompactorError::from(e)),
        }
    }

    fn parse_id(&self, path: &Path) -> Result<u64, CompactorError> {
        let invalid = || CompactorError::InvalidManifestPath(path.to_string());
        match path.extension() {
            Some(ext) if ext == self.manifest_suffix => path
                .filename()
                .and_then(|name| name.split('.').next())
                .ok_or_else(invalid)?
                .parse()
                .map_err(|_| invalid()),
            _ => Err(invalid()),
        }
    }

    fn get_manifest_path(&self, id: u64) -> Path {
        Path::from(format!("{:020}.{}", id, self.manifest_suffix))
    }
}
