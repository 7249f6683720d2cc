//! Snapshot store tests
//!
//! Persistence through the blob boundary: versioning, encodings and the
//! corruption paths a cold load can hit.

use proptest::prelude::*;
use std::sync::Arc;
use tandem_core::{DocumentId, TandemError, TenantId};
use tandem_snapshot::{
    BlobStorage, DocumentAttributes, Encoding, MemoryBlobStorage, SnapshotBlob, SnapshotStore,
    SnapshotTree,
};

fn ids() -> (TenantId, DocumentId) {
    (TenantId::new("acme"), DocumentId::new("board"))
}

fn container_tree(seq: u64, msn: u64) -> SnapshotTree {
    let mut object = SnapshotTree::new();
    object
        .insert_blob("header", SnapshotBlob::text(r#"{"color":"red"}"#))
        .unwrap();
    object
        .insert_blob("thumbnail", SnapshotBlob::binary(&[0xff, 0x00, 0x10]))
        .unwrap();

    let mut root = SnapshotTree::new();
    DocumentAttributes {
        sequence_number: seq,
        minimum_sequence_number: msn,
    }
    .write_to(&mut root)
    .unwrap();
    root.insert_tree("canvas", object).unwrap();
    root
}

#[tokio::test]
async fn missing_snapshot_reads_as_none() {
    let store = SnapshotStore::new(Arc::new(MemoryBlobStorage::new()));
    let (tenant, document) = ids();
    assert!(store.read(&tenant, &document).await.unwrap().is_none());
}

#[tokio::test]
async fn write_then_read_preserves_tree_and_encodings() {
    let storage = Arc::new(MemoryBlobStorage::new());
    let store = SnapshotStore::new(storage.clone());
    let (tenant, document) = ids();
    let tree = container_tree(12, 7);

    let manifest = store.write(&tenant, &document, &tree).await.unwrap();
    assert_eq!(manifest.sequence_number, 12);
    assert!(manifest
        .entries
        .iter()
        .any(|e| e.path == "canvas/thumbnail" && e.encoding == Encoding::Base64));

    let loaded = store.read(&tenant, &document).await.unwrap().unwrap();
    assert_eq!(loaded, tree);
    let thumbnail = loaded
        .require_tree("canvas")
        .unwrap()
        .require_blob("thumbnail")
        .unwrap();
    assert_eq!(thumbnail.bytes().unwrap(), vec![0xff, 0x00, 0x10]);
}

#[tokio::test]
async fn newer_snapshot_retires_previous_version() {
    let storage = Arc::new(MemoryBlobStorage::new());
    let store = SnapshotStore::new(storage.clone());
    let (tenant, document) = ids();

    store
        .write(&tenant, &document, &container_tree(5, 3))
        .await
        .unwrap();
    store
        .write(&tenant, &document, &container_tree(9, 9))
        .await
        .unwrap();

    assert!(storage.list("acme/board/5/").await.unwrap().is_empty());
    assert_eq!(storage.list("acme/board/9/").await.unwrap().len(), 3);

    let loaded = store.read(&tenant, &document).await.unwrap().unwrap();
    assert_eq!(
        DocumentAttributes::from_tree(&loaded).unwrap().sequence_number,
        9
    );
}

#[tokio::test]
async fn tree_without_attributes_is_refused() {
    let store = SnapshotStore::new(Arc::new(MemoryBlobStorage::new()));
    let (tenant, document) = ids();
    let err = store
        .write(&tenant, &document, &SnapshotTree::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TandemError::InvalidState { .. }));
}

#[tokio::test]
async fn garbage_manifest_is_corruption() {
    let storage = Arc::new(MemoryBlobStorage::new());
    storage
        .write_snapshot_blob("acme/board/.manifest", b"{not json".to_vec())
        .await
        .unwrap();
    let store = SnapshotStore::new(storage);
    let (tenant, document) = ids();

    let err = store.read(&tenant, &document).await.unwrap_err();
    assert!(matches!(err, TandemError::SnapshotCorruption { .. }));
}

#[tokio::test]
async fn missing_blob_is_corruption() {
    let storage = Arc::new(MemoryBlobStorage::new());
    let store = SnapshotStore::new(storage.clone());
    let (tenant, document) = ids();
    store
        .write(&tenant, &document, &container_tree(4, 4))
        .await
        .unwrap();
    storage.delete_prefix("acme/board/4/canvas/").await.unwrap();

    let err = store.read(&tenant, &document).await.unwrap_err();
    assert!(matches!(err, TandemError::SnapshotCorruption { .. }));
}

/// Storage that lands a newer snapshot the first time a blob under
/// `racing_prefix` is read, retiring the version being read
struct RacingStorage {
    inner: Arc<MemoryBlobStorage>,
    racing_prefix: String,
    newer: tokio::sync::Mutex<Option<SnapshotTree>>,
}

#[async_trait::async_trait]
impl BlobStorage for RacingStorage {
    async fn read_snapshot_blob(&self, path: &str) -> tandem_core::Result<Option<Vec<u8>>> {
        if path.starts_with(&self.racing_prefix) {
            if let Some(tree) = self.newer.lock().await.take() {
                let (tenant, document) = ids();
                SnapshotStore::new(self.inner.clone())
                    .write(&tenant, &document, &tree)
                    .await?;
            }
        }
        self.inner.read_snapshot_blob(path).await
    }

    async fn write_snapshot_blob(&self, path: &str, bytes: Vec<u8>) -> tandem_core::Result<()> {
        self.inner.write_snapshot_blob(path, bytes).await
    }

    async fn delete_prefix(&self, prefix: &str) -> tandem_core::Result<usize> {
        self.inner.delete_prefix(prefix).await
    }

    async fn list(&self, prefix: &str) -> tandem_core::Result<Vec<String>> {
        self.inner.list(prefix).await
    }
}

#[tokio::test]
async fn read_racing_a_write_loads_the_newer_version() {
    let inner = Arc::new(MemoryBlobStorage::new());
    let (tenant, document) = ids();
    SnapshotStore::new(inner.clone())
        .write(&tenant, &document, &container_tree(5, 3))
        .await
        .unwrap();

    let store = SnapshotStore::new(Arc::new(RacingStorage {
        inner: inner.clone(),
        racing_prefix: "acme/board/5/".to_string(),
        newer: tokio::sync::Mutex::new(Some(container_tree(9, 9))),
    }));
    let loaded = store.read(&tenant, &document).await.unwrap().unwrap();

    assert_eq!(loaded, container_tree(9, 9));
    assert!(inner.list("acme/board/5/").await.unwrap().is_empty());
}

fn arb_tree() -> impl Strategy<Value = SnapshotTree> {
    let blob = prop_oneof![
        "[ -~]{0,24}".prop_map(SnapshotBlob::text),
        proptest::collection::vec(any::<u8>(), 0..24).prop_map(|b| SnapshotBlob::binary(&b)),
    ];
    let object = proptest::collection::btree_map("[a-z]{1,6}", blob, 1..4);
    proptest::collection::btree_map("[a-z]{1,6}", object, 0..4).prop_map(|objects| {
        let mut root = SnapshotTree::new();
        for (name, blobs) in objects {
            let mut sub = SnapshotTree::new();
            for (blob_name, blob) in blobs {
                sub.insert_blob(blob_name, blob).unwrap();
            }
            root.insert_tree(name, sub).unwrap();
        }
        root
    })
}

proptest! {
    /// Flattening to storage entries and rebuilding yields the same tree
    #[test]
    fn flatten_rebuild_is_identity(tree in arb_tree()) {
        let rebuilt = SnapshotTree::from_entries(tree.flatten()).unwrap();
        prop_assert_eq!(rebuilt, tree);
    }
}
