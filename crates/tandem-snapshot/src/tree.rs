//! Snapshot trees
//!
//! A tree maps entry names to either a blob or a nested tree. Names never
//! contain `/`, which is reserved as the separator of the flattened
//! `{path, encoding, content}` form used by storage.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tandem_core::{Result, SequenceNumber, TandemError};

/// Entry name holding [`DocumentAttributes`] at the root of a container tree
pub const ATTRIBUTES_ENTRY: &str = ".attributes";

const PATH_SEPARATOR: char = '/';

/// How a blob's content is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    /// Content is UTF-8 text stored as-is
    #[serde(rename = "utf-8")]
    Utf8,
    /// Content is arbitrary bytes stored as standard base64
    #[serde(rename = "base64")]
    Base64,
}

impl Encoding {
    /// Wire name of the encoding
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Utf8 => "utf-8",
            Self::Base64 => "base64",
        }
    }
}

/// A leaf of the snapshot tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotBlob {
    /// Encoding of `content`
    pub encoding: Encoding,
    /// Content in its encoded form
    pub content: String,
}

impl SnapshotBlob {
    /// Text blob
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            encoding: Encoding::Utf8,
            content: content.into(),
        }
    }

    /// Binary blob, base64 encoded
    pub fn binary(bytes: &[u8]) -> Self {
        Self {
            encoding: Encoding::Base64,
            content: STANDARD.encode(bytes),
        }
    }

    /// Text blob holding `value` serialized as JSON
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::text(serde_json::to_string(value)?))
    }

    /// Rebuild a blob from its stored encoded form
    pub fn from_stored(encoding: Encoding, stored: Vec<u8>) -> Result<Self> {
        let content = String::from_utf8(stored).map_err(|e| {
            TandemError::snapshot_corruption(format!("blob is not valid UTF-8: {e}"))
        })?;
        if encoding == Encoding::Base64 {
            STANDARD.decode(&content).map_err(|e| {
                TandemError::snapshot_corruption(format!("blob is not valid base64: {e}"))
            })?;
        }
        Ok(Self { encoding, content })
    }

    /// Decoded bytes
    pub fn bytes(&self) -> Result<Vec<u8>> {
        match self.encoding {
            Encoding::Utf8 => Ok(self.content.as_bytes().to_vec()),
            Encoding::Base64 => STANDARD.decode(&self.content).map_err(|e| {
                TandemError::snapshot_corruption(format!("blob is not valid base64: {e}"))
            }),
        }
    }

    /// Parse the decoded content as JSON
    pub fn to_json<T: DeserializeOwned>(&self) -> Result<T> {
        let bytes = self.bytes()?;
        serde_json::from_slice(&bytes).map_err(|e| {
            TandemError::snapshot_corruption(format!("blob does not hold the expected JSON: {e}"))
        })
    }
}

/// A node of the snapshot tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum SnapshotNode {
    /// Leaf artifact
    Blob(SnapshotBlob),
    /// Nested tree
    Tree(SnapshotTree),
}

/// One entry of the flattened tree, as laid out in storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// `/`-separated path from the tree root
    pub path: String,
    /// Encoding of `content`
    pub encoding: Encoding,
    /// Content in its encoded form
    pub content: String,
}

/// Named-entry snapshot tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotTree {
    entries: BTreeMap<String, SnapshotNode>,
}

impl SnapshotTree {
    /// Empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a blob entry
    pub fn insert_blob(&mut self, name: impl Into<String>, blob: SnapshotBlob) -> Result<()> {
        let name = validate_name(name.into())?;
        self.entries.insert(name, SnapshotNode::Blob(blob));
        Ok(())
    }

    /// Add or replace a subtree entry
    pub fn insert_tree(&mut self, name: impl Into<String>, tree: SnapshotTree) -> Result<()> {
        let name = validate_name(name.into())?;
        self.entries.insert(name, SnapshotNode::Tree(tree));
        Ok(())
    }

    /// Blob entry by name
    pub fn blob(&self, name: &str) -> Option<&SnapshotBlob> {
        match self.entries.get(name) {
            Some(SnapshotNode::Blob(blob)) => Some(blob),
            _ => None,
        }
    }

    /// Subtree entry by name
    pub fn tree(&self, name: &str) -> Option<&SnapshotTree> {
        match self.entries.get(name) {
            Some(SnapshotNode::Tree(tree)) => Some(tree),
            _ => None,
        }
    }

    /// Blob entry that must exist for the tree to be usable
    pub fn require_blob(&self, name: &str) -> Result<&SnapshotBlob> {
        self.blob(name)
            .ok_or_else(|| TandemError::snapshot_corruption(format!("missing blob entry {name}")))
    }

    /// Subtree entry that must exist for the tree to be usable
    pub fn require_tree(&self, name: &str) -> Result<&SnapshotTree> {
        self.tree(name)
            .ok_or_else(|| TandemError::snapshot_corruption(format!("missing tree entry {name}")))
    }

    /// Iterate direct entries in name order
    pub fn entries(&self) -> impl Iterator<Item = (&str, &SnapshotNode)> {
        self.entries.iter().map(|(name, node)| (name.as_str(), node))
    }

    /// Number of direct entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the tree has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flatten into one entry per blob, depth first in name order
    pub fn flatten(&self) -> Vec<SnapshotEntry> {
        let mut out = Vec::new();
        self.flatten_into("", &mut out);
        out
    }

    fn flatten_into(&self, prefix: &str, out: &mut Vec<SnapshotEntry>) {
        for (name, node) in &self.entries {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}{PATH_SEPARATOR}{name}")
            };
            match node {
                SnapshotNode::Blob(blob) => out.push(SnapshotEntry {
                    path,
                    encoding: blob.encoding,
                    content: blob.content.clone(),
                }),
                SnapshotNode::Tree(tree) => tree.flatten_into(&path, out),
            }
        }
    }

    /// Rebuild a tree from flattened entries
    ///
    /// Fails with `SnapshotCorruption` when two entries collide or a path uses
    /// a blob as a directory.
    pub fn from_entries(entries: impl IntoIterator<Item = SnapshotEntry>) -> Result<Self> {
        let mut root = SnapshotTree::new();
        for entry in entries {
            let segments: Vec<&str> = entry.path.split(PATH_SEPARATOR).collect();
            let Some((leaf, dirs)) = segments.split_last() else {
                continue;
            };
            let mut cursor = &mut root;
            for dir in dirs {
                let node = cursor
                    .entries
                    .entry(validate_name((*dir).to_string()).map_err(corrupt)?)
                    .or_insert_with(|| SnapshotNode::Tree(SnapshotTree::new()));
                cursor = match node {
                    SnapshotNode::Tree(tree) => tree,
                    SnapshotNode::Blob(_) => {
                        return Err(TandemError::snapshot_corruption(format!(
                            "path {} descends through a blob",
                            entry.path
                        )))
                    }
                };
            }
            let leaf = validate_name((*leaf).to_string()).map_err(corrupt)?;
            if cursor.entries.contains_key(&leaf) {
                return Err(TandemError::snapshot_corruption(format!(
                    "duplicate entry {}",
                    entry.path
                )));
            }
            cursor.entries.insert(
                leaf,
                SnapshotNode::Blob(SnapshotBlob {
                    encoding: entry.encoding,
                    content: entry.content,
                }),
            );
        }
        Ok(root)
    }
}

fn validate_name(name: String) -> Result<String> {
    if name.is_empty() || name.contains(PATH_SEPARATOR) {
        return Err(TandemError::invalid_state(format!(
            "invalid snapshot entry name {name:?}"
        )));
    }
    Ok(name)
}

fn corrupt(err: TandemError) -> TandemError {
    TandemError::snapshot_corruption(err.to_string())
}

/// Replay anchor persisted alongside every container snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentAttributes {
    /// Last sequence number reflected in the snapshot
    pub sequence_number: SequenceNumber,
    /// Watermark at the time the snapshot was taken
    pub minimum_sequence_number: SequenceNumber,
}

impl DocumentAttributes {
    /// Read the attributes entry of a container tree
    pub fn from_tree(tree: &SnapshotTree) -> Result<Self> {
        tree.require_blob(ATTRIBUTES_ENTRY)?.to_json()
    }

    /// Write the attributes entry into a container tree
    pub fn write_to(&self, tree: &mut SnapshotTree) -> Result<()> {
        tree.insert_blob(ATTRIBUTES_ENTRY, SnapshotBlob::json(self)?)
    }
}
