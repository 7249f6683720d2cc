//! Versioned snapshot persistence
//!
//! Layout under a document prefix `{tenant}/{document}/`:
//!
//! ```text
//! .manifest              -> {"sequenceNumber": N, "entries": [{path, encoding}, ..]}
//! {N}/{entry path}       -> encoded entry content
//! ```
//!
//! Blobs are written before the manifest, so a reader never observes a
//! manifest naming blobs that are not there yet. The previous version is
//! deleted once the new manifest is in place; readers that raced the delete
//! re-read the manifest.

use crate::storage::BlobStorage;
use crate::tree::{DocumentAttributes, Encoding, SnapshotBlob, SnapshotEntry, SnapshotTree};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tandem_core::{DocumentId, Result, SequenceNumber, TandemError, TenantId};

const MANIFEST_ENTRY: &str = ".manifest";

/// Manifest reads per [`SnapshotStore::read`] before a missing blob is
/// reported as corruption
const READ_ATTEMPTS: usize = 3;

/// Manifest entry naming one stored blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path within the snapshot tree
    pub path: String,
    /// Encoding of the stored content
    pub encoding: Encoding,
}

/// Index of the latest stored snapshot of a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotManifest {
    /// Sequence number the snapshot reflects; also its storage version
    pub sequence_number: SequenceNumber,
    /// Stored entries
    pub entries: Vec<ManifestEntry>,
}

/// Reads and writes whole snapshot trees through a [`BlobStorage`]
#[derive(Clone)]
pub struct SnapshotStore {
    storage: Arc<dyn BlobStorage>,
}

impl SnapshotStore {
    /// Create a store over `storage`
    pub fn new(storage: Arc<dyn BlobStorage>) -> Self {
        Self { storage }
    }

    fn document_prefix(tenant: &TenantId, document: &DocumentId) -> String {
        format!("{tenant}/{document}/")
    }

    /// Persist `tree`, which must carry document attributes at its root.
    pub async fn write(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
        tree: &SnapshotTree,
    ) -> Result<SnapshotManifest> {
        let attributes = DocumentAttributes::from_tree(tree)
            .map_err(|e| TandemError::invalid_state(format!("snapshot without attributes: {e}")))?;
        let prefix = Self::document_prefix(tenant, document);
        let previous = self.read_manifest(tenant, document).await.ok().flatten();

        let version = attributes.sequence_number;
        let entries = tree.flatten();
        for entry in &entries {
            let path = format!("{prefix}{version}/{}", entry.path);
            self.storage
                .write_snapshot_blob(&path, entry.content.clone().into_bytes())
                .await?;
        }

        let manifest = SnapshotManifest {
            sequence_number: version,
            entries: entries
                .into_iter()
                .map(|entry| ManifestEntry {
                    path: entry.path,
                    encoding: entry.encoding,
                })
                .collect(),
        };
        self.storage
            .write_snapshot_blob(
                &format!("{prefix}{MANIFEST_ENTRY}"),
                serde_json::to_vec(&manifest)?,
            )
            .await?;

        if let Some(previous) = previous {
            if previous.sequence_number != version {
                let removed = self
                    .storage
                    .delete_prefix(&format!("{prefix}{}/", previous.sequence_number))
                    .await?;
                tracing::debug!(
                    tenant = %tenant,
                    document = %document,
                    version = previous.sequence_number,
                    removed,
                    "Retired previous snapshot version"
                );
            }
        }

        tracing::info!(
            tenant = %tenant,
            document = %document,
            sequence_number = version,
            entries = manifest.entries.len(),
            "Snapshot stored"
        );
        Ok(manifest)
    }

    /// Manifest of the latest snapshot, `None` if the document has none
    pub async fn read_manifest(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
    ) -> Result<Option<SnapshotManifest>> {
        let path = format!(
            "{}{MANIFEST_ENTRY}",
            Self::document_prefix(tenant, document)
        );
        let Some(bytes) = self.storage.read_snapshot_blob(&path).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| TandemError::snapshot_corruption(format!("unreadable manifest: {e}")))
    }

    /// Latest snapshot tree, `None` if the document has none.
    ///
    /// A concurrent [`Self::write`] may retire the version named by the
    /// manifest while its blobs are being read; the manifest is then re-read
    /// and the newer version loaded instead.
    pub async fn read(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
    ) -> Result<Option<SnapshotTree>> {
        let prefix = Self::document_prefix(tenant, document);
        let mut attempts = 0;
        loop {
            let Some(manifest) = self.read_manifest(tenant, document).await? else {
                return Ok(None);
            };
            let missing = match self.read_version(&prefix, &manifest).await? {
                VersionRead::Complete(entries) => return Self::assemble(&manifest, entries),
                VersionRead::Missing(path) => path,
            };

            attempts += 1;
            let current = self
                .read_manifest(tenant, document)
                .await?
                .map(|latest| latest.sequence_number);
            if current == Some(manifest.sequence_number) || attempts >= READ_ATTEMPTS {
                return Err(TandemError::snapshot_corruption(format!(
                    "manifest names missing blob {missing}"
                )));
            }
            tracing::debug!(
                tenant = %tenant,
                document = %document,
                retired = manifest.sequence_number,
                "Snapshot version retired during read, retrying"
            );
        }
    }

    async fn read_version(&self, prefix: &str, manifest: &SnapshotManifest) -> Result<VersionRead> {
        let mut entries = Vec::with_capacity(manifest.entries.len());
        for entry in &manifest.entries {
            let path = format!("{prefix}{}/{}", manifest.sequence_number, entry.path);
            let Some(stored) = self.storage.read_snapshot_blob(&path).await? else {
                return Ok(VersionRead::Missing(path));
            };
            let blob = SnapshotBlob::from_stored(entry.encoding, stored)?;
            entries.push(SnapshotEntry {
                path: entry.path.clone(),
                encoding: blob.encoding,
                content: blob.content,
            });
        }
        Ok(VersionRead::Complete(entries))
    }

    fn assemble(
        manifest: &SnapshotManifest,
        entries: Vec<SnapshotEntry>,
    ) -> Result<Option<SnapshotTree>> {
        let tree = SnapshotTree::from_entries(entries)?;
        let attributes = DocumentAttributes::from_tree(&tree)?;
        if attributes.sequence_number != manifest.sequence_number {
            return Err(TandemError::snapshot_corruption(format!(
                "manifest version {} does not match attributes {}",
                manifest.sequence_number, attributes.sequence_number
            )));
        }
        Ok(Some(tree))
    }
}

enum VersionRead {
    Complete(Vec<SnapshotEntry>),
    /// First blob of the version that was not found
    Missing(String),
}
