//! Immutable Files and the Remote Object Store
//!
//! Sealed fractions read their `.index` and `.docs`/`.sdocs` files through
//! the [`ImmutableFile`] abstraction, so the same reader code serves local
//! files and object-store-resident files.
//!
//! [`RemoteStore`] is the interface offloading requires from the external
//! object store: existence checks, deletion, whole-file upload, and
//! byte-addressable readers. [`ObjectStoreClient`] implements it over any
//! `object_store::ObjectStore` (S3, local filesystem, in-memory for tests).
//!
//! Remote `read_at` calls run on blocking threads (the whole search path is
//! synchronous, bounded by the read limiter), so the client bridges into the
//! async object store via a captured runtime handle.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use object_store::path::Path as StorePath;
use object_store::ObjectStore;
use tokio::runtime::Handle;

use seqdb_core::{Error, Result};

/// A named, random-access, immutable byte source.
pub trait ImmutableFile: Send + Sync {
    fn name(&self) -> &str;

    fn size(&self) -> Result<u64>;

    /// Fill `buf` from `offset`; short data is an error.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()>;
}

/// Local-filesystem immutable file.
pub struct LocalFile {
    file: File,
    path: PathBuf,
    name: String,
}

impl LocalFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(LocalFile { file, path, name })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ImmutableFile for LocalFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

/// Object store operations required by offloading and remote fractions.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn exists(&self, name: &str) -> Result<bool>;

    async fn remove(&self, names: &[String]) -> Result<()>;

    /// Upload a local file under its base name.
    async fn upload(&self, path: &Path) -> Result<()>;

    /// Open a byte-addressable reader over a stored object.
    async fn reader(&self, name: &str) -> Result<Arc<dyn ImmutableFile>>;
}

/// `RemoteStore` over any `object_store::ObjectStore`.
pub struct ObjectStoreClient {
    store: Arc<dyn ObjectStore>,
    handle: Handle,
}

impl ObjectStoreClient {
    /// Captures the current tokio runtime handle for the blocking read
    /// bridge; must be called from within a runtime.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        ObjectStoreClient {
            store,
            handle: Handle::current(),
        }
    }
}

fn store_err(e: object_store::Error) -> Error {
    Error::ObjectStore(e.to_string())
}

#[async_trait]
impl RemoteStore for ObjectStoreClient {
    async fn exists(&self, name: &str) -> Result<bool> {
        match self.store.head(&StorePath::from(name)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(store_err(e)),
        }
    }

    async fn remove(&self, names: &[String]) -> Result<()> {
        for name in names {
            match self.store.delete(&StorePath::from(name.as_str())).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(store_err(e)),
            }
        }
        Ok(())
    }

    async fn upload(&self, path: &Path) -> Result<()> {
        let name = path
            .file_name()
            .ok_or_else(|| Error::InvalidArgument(format!("no file name in {}", path.display())))?
            .to_string_lossy()
            .into_owned();

        let data = tokio::fs::read(path).await?;
        let size = data.len();
        self.store
            .put(&StorePath::from(name.as_str()), data.into())
            .await
            .map_err(store_err)?;

        tracing::info!(object = %name, size, "uploaded file to remote store");
        Ok(())
    }

    async fn reader(&self, name: &str) -> Result<Arc<dyn ImmutableFile>> {
        let path = StorePath::from(name);
        let meta = self.store.head(&path).await.map_err(store_err)?;
        Ok(Arc::new(RemoteFile {
            store: self.store.clone(),
            path,
            name: name.to_string(),
            size: meta.size as u64,
            handle: self.handle.clone(),
        }))
    }
}

/// Byte-addressable reader over one stored object.
struct RemoteFile {
    store: Arc<dyn ObjectStore>,
    path: StorePath,
    name: String,
    size: u64,
    handle: Handle,
}

impl ImmutableFile for RemoteFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let range = offset as usize..offset as usize + buf.len();
        let store = self.store.clone();
        let path = self.path.clone();
        let bytes = self
            .handle
            .block_on(async move { store.get_range(&path, range).await })
            .map_err(store_err)?;
        if bytes.len() != buf.len() {
            return Err(Error::corrupted(format!(
                "short remote read: wanted {}, got {}",
                buf.len(),
                bytes.len()
            )));
        }
        buf.copy_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use std::io::Write;

    fn client() -> ObjectStoreClient {
        ObjectStoreClient::new(Arc::new(InMemory::new()))
    }

    #[tokio::test]
    async fn test_upload_exists_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seq-db-test.index");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"index bytes")
            .unwrap();

        let client = client();
        assert!(!client.exists("seq-db-test.index").await.unwrap());

        client.upload(&path).await.unwrap();
        assert!(client.exists("seq-db-test.index").await.unwrap());

        client
            .remove(&["seq-db-test.index".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert!(!client.exists("seq-db-test.index").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_remote_reader_read_at() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"0123456789abcdef")
            .unwrap();

        let client = client();
        client.upload(&path).await.unwrap();

        let reader = client.reader("blob").await.unwrap();
        assert_eq!(reader.size().unwrap(), 16);

        // read_exact_at is blocking; run it off the async workers
        let result = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 6];
            reader.read_exact_at(&mut buf, 10)?;
            Ok::<_, Error>(buf)
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(&result, b"abcdef");
    }

    #[tokio::test]
    async fn test_reader_missing_object() {
        let client = client();
        assert!(client.reader("nope").await.is_err());
    }

    #[test]
    fn test_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seq-db-x.docs");
        std::fs::File::create(&path).unwrap().write_all(b"hello").unwrap();

        let file = LocalFile::open(&path).unwrap();
        assert_eq!(file.name(), "seq-db-x.docs");
        assert_eq!(file.size().unwrap(), 5);

        let mut buf = [0u8; 2];
        file.read_exact_at(&mut buf, 3).unwrap();
        assert_eq!(&buf, b"lo");
    }
}
