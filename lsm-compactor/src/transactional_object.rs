use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use object_store::path::Path;
use object_store::{
    path, Error, GetResult, ObjectMeta, ObjectStore, PutMode, PutOptions, PutPayload, PutResult,
};

/// The conditional-write primitives the manifest store is built on. A put must
/// fail with `Error::AlreadyExists` when another client created the object first.
#[async_trait]
pub(crate) trait TransactionalObjectStore: Send + Sync {
    async fn put_if_not_exists(&self, path: &Path, data: Bytes) -> Result<PutResult, Error>;

    async fn get(&self, path: &Path) -> Result<GetResult, Error>;

    async fn delete(&self, path: &Path) -> Result<(), Error>;

    fn list(&self, path: Option<&Path>) -> BoxStream<'_, Result<ObjectMeta, Error>>;
}

// Relies on the object store's own create-if-absent support. Paths handed to this
// type are relative to `root_path`, and listed locations are returned relative too.
pub(crate) struct DelegatingTransactionalObjectStore {
    root_path: Path,
    object_store: Arc<dyn ObjectStore>,
}

impl DelegatingTransactionalObjectStore {
    pub(crate) fn new(root_path: Path, object_store: Arc<dyn ObjectStore>) -> Self {
        Self {
            root_path,
            object_store,
        }
    }

    fn path(&self, path: &Path) -> Path {
        Path::from(format!("{}/{}", self.root_path, path))
    }

    fn strip_root(&self, path: &Path) -> Result<Path, Error> {
        let root_raw = self.root_path.to_string();
        let path_raw = path.to_string();
        if let Some(stripped) = path_raw.strip_prefix(root_raw.as_str()) {
            return Ok(Path::from(stripped));
        }
        Err(Error::InvalidPath {
            source: path::Error::PrefixMismatch {
                path: path.to_string(),
                prefix: self.root_path.to_string(),
            },
        })
    }
}

#[async_trait]
impl TransactionalObjectStore for DelegatingTransactionalObjectStore {
    async fn put_if_not_exists(&self, path: &Path, data: Bytes) -> Result<PutResult, Error> {
        let path = self.path(path);
        self.object_store
            .put_opts(
                &path,
                PutPayload::from_bytes(data),
                PutOptions::from(PutMode::Create),
            )
            .await
    }

    async fn get(&self, path: &Path) -> Result<GetResult, Error> {
        let path = self.path(path);
        self.object_store.get(&path).await
    }

    async fn delete(&self, path: &Path) -> Result<(), Error> {
        let path = self.path(path);
        self.object_store.delete(&path).await
    }

    fn list(&self, path: Option<&Path>) -> BoxStream<'_, Result<ObjectMeta, Error>> {
        let path = path.map_or(self.root_path.clone(), |p| self.path(p));
        self.object_store
            .list(Some(&path))
            .map(|r| match r {
                Ok(om) => Ok(ObjectMeta {
                    location: self.strip_root(&om.location)?,
                    last_modified: om.last_modified,
                    size: om.size,
                    e_tag: om.e_tag,
                    version: om.version,
                }),
                Err(err) => Err(err),
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use futures::StreamExt;
    use object_store::memory::InMemory;
    use object_store::path::Path;
    use object_store::ObjectStore;

    use crate::transactional_object::{
        DelegatingTransactionalObjectStore, TransactionalObjectStore,
    };

    const ROOT_PATH: &str = "/root/path";

    #[tokio::test]
    async fn test_should_fail_put_if_exists() {
        // given:
        let os: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let store = DelegatingTransactionalObjectStore::new(Path::from(ROOT_PATH), os);
        let path = Path::from("obj");
        store
            .put_if_not_exists(&path, Bytes::from(b"data1".as_slice()))
            .await
            .unwrap();

        // when:
        let result = store
            .put_if_not_exists(&path, Bytes::from(b"data2".as_slice()))
            .await;

        // then:
        assert!(matches!(
            result,
            Err(object_store::Error::AlreadyExists { .. })
        ));
        let stored = store.get(&path).await.unwrap().bytes().await.unwrap();
        assert_eq!(stored, Bytes::from(b"data1".as_slice()));
    }

    #[tokio::test]
    async fn test_should_write_under_root_and_list_relative() {
        // given:
        let os: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let store = DelegatingTransactionalObjectStore::new(Path::from(ROOT_PATH), os.clone());

        // when:
        store
            .put_if_not_exists(&Path::from("foo"), Bytes::from(b"bar".as_slice()))
            .await
            .unwrap();

        // then:
        let raw = os.get(&Path::from("/root/path/foo")).await.unwrap();
        assert_eq!(raw.bytes().await.unwrap(), Bytes::from(b"bar".as_slice()));
        let listed: Vec<_> = store.list(None).collect().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].as_ref().unwrap().location, Path::from("foo"));
    }

    #[tokio::test]
    async fn test_should_delete_object() {
        // given:
        let os: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let store = DelegatingTransactionalObjectStore::new(Path::from(ROOT_PATH), os);
        let path = Path::from("obj");
        store
            .put_if_not_exists(&path, Bytes::from(b"data".as_slice()))
            .await
            .unwrap();

        // when:
        store.delete(&path).await.unwrap();

        // then:
        assert!(matches!(
            store.get(&path).await,
            Err(object_store::Error::NotFound { .. })
        ));
    }
}
