// Object storage abstraction for archived document blobs.
//
// Backends are selected by configuration: the in-memory store backs
// tests and single-node setups, the filesystem store maps buckets to
// directories. Missing-object errors normalize to `NotFound` so callers
// never match on backend-specific failures.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object not found")]
    NotFound,
    #[error("object store io: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability surface the archive bridge needs from object storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `body` at `bucket/key`. `content_size` is the advertised
    /// byte count and must match the body.
    async fn send(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_size: u64,
    ) -> Result<(), ObjectStoreError>;

    /// Returns the advertised size and the object bytes.
    async fn get(&self, bucket: &str, key: &str) -> Result<(u64, Vec<u8>), ObjectStoreError>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError>;
}

/// Small in-memory implementation useful for tests.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.objects.lock().expect("object store lock poisoned").contains_key(&full_key(bucket, key))
    }
}

fn full_key(bucket: &str, key: &str) -> String {
    format!("{bucket}/{key}")
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn send(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_size: u64,
    ) -> Result<(), ObjectStoreError> {
        debug_assert_eq!(body.len() as u64, content_size);
        self.objects
            .lock()
            .expect("object store lock poisoned")
            .insert(full_key(bucket, key), body);
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<(u64, Vec<u8>), ObjectStoreError> {
        let objects = self.objects.lock().expect("object store lock poisoned");
        let body = objects.get(&full_key(bucket, key)).ok_or(ObjectStoreError::NotFound)?;
        Ok((body.len() as u64, body.clone()))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
        self.objects.lock().expect("object store lock poisoned").remove(&full_key(bucket, key));
        Ok(())
    }
}

/// Filesystem-backed store: `<root>/<bucket>/<key>`.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn send(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        _content_size: u64,
    ) -> Result<(), ObjectStoreError> {
        let path = self.object_path(bucket, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, body).await?;
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<(u64, Vec<u8>), ObjectStoreError> {
        let path = self.object_path(bucket, key);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(ObjectStoreError::NotFound)
            }
            Err(error) => return Err(error.into()),
        };
        let body = tokio::fs::read(&path).await?;
        Ok((metadata.len(), body))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
        match tokio::fs::remove_file(self.object_path(bucket, key)).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FsObjectStore, MemoryObjectStore, ObjectStore, ObjectStoreError};

    #[tokio::test]
    async fn memory_store_round_trips_and_normalizes_not_found() {
        let store = MemoryObjectStore::new();
        store.send("bucket", "a/b", b"blob".to_vec(), 4).await.expect("send should succeed");

        let (size, body) = store.get("bucket", "a/b").await.expect("get should succeed");
        assert_eq!(size, 4);
        assert_eq!(body, b"blob");

        store.delete("bucket", "a/b").await.expect("delete should succeed");
        assert!(matches!(
            store.get("bucket", "a/b").await,
            Err(ObjectStoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn fs_store_round_trips_under_a_bucket_directory() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        let store = FsObjectStore::new(dir.path());

        store.send("docs", "p/d", b"content".to_vec(), 7).await.expect("send should succeed");
        let (size, body) = store.get("docs", "p/d").await.expect("get should succeed");
        assert_eq!(size, 7);
        assert_eq!(body, b"content");

        store.delete("docs", "p/d").await.expect("delete should succeed");
        assert!(matches!(store.get("docs", "p/d").await, Err(ObjectStoreError::NotFound)));
        // Deleting a missing object is a no-op.
        store.delete("docs", "p/d").await.expect("repeat delete should succeed");
    }
}
