//! Core identifier types
//!
//! Tenants, documents and data objects are named by callers, so they are plain
//! string newtypes. Client ids are issued by the ordering service, one per
//! connection epoch.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Position in a document's total order. Assigned only by the ordering
/// service; `0` means "nothing sequenced yet".
pub type SequenceNumber = u64;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string-like value
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the inner string
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id! {
    /// Tenant that owns a set of documents
    TenantId
}

string_id! {
    /// Collaborative document within a tenant
    DocumentId
}

string_id! {
    /// Data object within a container
    ObjectId
}

string_id! {
    /// Identity of one connection epoch of one client
    ///
    /// A client that reconnects receives a fresh `ClientId`.
    ClientId
}

impl ClientId {
    /// Mint a new random client id
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}
