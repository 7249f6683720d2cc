//! # Tandem Snapshot - Snapshot & Compaction Store
//!
//! A shared object's committed state is serialized into a [`SnapshotTree`]: a
//! named-entry tree whose leaves are blobs with an explicit [`Encoding`].
//! Containers nest one subtree per object and add document [`DocumentAttributes`]
//! so a cold load knows where replay resumes.
//!
//! ## Components
//!
//! - [`tree`]: the tree, its blobs and the flat `{path, encoding, content}` view
//! - [`storage`]: the `BlobStorage` boundary and an in-memory backend
//! - [`store`]: versioned persistence of whole trees behind a manifest
//! - [`compaction`]: the replay log that retires history below the watermark

#![forbid(unsafe_code)]

pub mod compaction;
pub mod storage;
pub mod store;
pub mod tree;

pub use compaction::{ReplayLog, Sequenced};
pub use storage::{BlobStorage, MemoryBlobStorage};
pub use store::{SnapshotManifest, SnapshotStore};
pub use tree::{
    DocumentAttributes, Encoding, SnapshotBlob, SnapshotEntry, SnapshotNode, SnapshotTree,
    ATTRIBUTES_ENTRY,
};
