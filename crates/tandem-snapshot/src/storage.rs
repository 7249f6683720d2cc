//! Blob storage boundary
//!
//! Snapshot blobs live in an external store addressed by `/`-separated paths.
//! [`MemoryBlobStorage`] backs tests and single-process deployments.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tandem_core::Result;
use tokio::sync::RwLock;

/// Read/write access to snapshot blobs
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Read a blob, `None` if nothing is stored at `path`
    async fn read_snapshot_blob(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Write a blob, replacing any previous content
    async fn write_snapshot_blob(&self, path: &str, bytes: Vec<u8>) -> Result<()>;

    /// Remove every blob whose path starts with `prefix`, returning how many
    /// were removed
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;

    /// Paths starting with `prefix`, in lexical order
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-memory blob storage
#[derive(Clone, Default)]
pub struct MemoryBlobStorage {
    blobs: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBlobStorage {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    /// True when nothing is stored
    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStorage for MemoryBlobStorage {
    async fn read_snapshot_blob(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let blobs = self.blobs.read().await;
        Ok(blobs.get(path).cloned())
    }

    async fn write_snapshot_blob(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
        let mut blobs = self.blobs.write().await;
        blobs.insert(path.to_string(), bytes);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut blobs = self.blobs.write().await;
        let before = blobs.len();
        blobs.retain(|path, _| !path.starts_with(prefix));
        Ok(before - blobs.len())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let blobs = self.blobs.read().await;
        Ok(blobs
            .keys()
            .filter(|path| path.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_delete() {
        let storage = MemoryBlobStorage::new();
        storage
            .write_snapshot_blob("t/d/1/header", b"abc".to_vec())
            .await
            .unwrap();
        storage
            .write_snapshot_blob("t/d/2/header", b"def".to_vec())
            .await
            .unwrap();

        assert_eq!(
            storage.read_snapshot_blob("t/d/1/header").await.unwrap(),
            Some(b"abc".to_vec())
        );
        assert_eq!(storage.read_snapshot_blob("t/d/3").await.unwrap(), None);
        assert_eq!(storage.list("t/d/").await.unwrap().len(), 2);

        assert_eq!(storage.delete_prefix("t/d/1/").await.unwrap(), 1);
        assert_eq!(storage.len().await, 1);
    }
}
