//! Unified error system for Tandem
//!
//! Every failure a caller can observe maps to one variant of [`TandemError`].
//! Variants carry a human readable message; the variant itself is the
//! machine-readable kind.

use serde::{Deserialize, Serialize};

/// Unified error type for all Tandem operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum TandemError {
    /// Bad or expired token. Fatal to the connect attempt, retryable after
    /// re-authentication.
    #[error("Authentication failed: {message}")]
    Auth {
        /// Why the token was rejected
        message: String,
    },

    /// Unknown tenant, document or data object
    #[error("Not found: {message}")]
    NotFound {
        /// What was not found
        message: String,
    },

    /// Creation requested for a type tag absent from the registry
    #[error("Unregistered type: {type_tag}")]
    UnregisteredType {
        /// The type tag that has no factory
        type_tag: String,
    },

    /// Operation delivered out of sequence, or a local echo that does not
    /// match the pending queue
    #[error("Protocol order violation: {message}")]
    ProtocolOrder {
        /// Description of the violation
        message: String,
    },

    /// A stored snapshot tree could not be parsed
    #[error("Snapshot corrupted: {message}")]
    SnapshotCorruption {
        /// What failed to parse
        message: String,
    },

    /// Invalid construction-time configuration
    #[error("Configuration error: {message}")]
    Configuration {
        /// What is misconfigured
        message: String,
    },

    /// A data object with this id already exists in the container
    #[error("Duplicate data object: {id}")]
    DuplicateObject {
        /// The colliding id
        id: String,
    },

    /// The connection to the ordering service is gone
    #[error("Disconnected: {message}")]
    Disconnected {
        /// Context for the dropped connection
        message: String,
    },

    /// Operation not allowed in the current state
    #[error("Invalid state: {message}")]
    InvalidState {
        /// Why the operation was refused
        message: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message describing the serialization failure
        message: String,
    },

    /// Blob storage failure
    #[error("Storage error: {message}")]
    Storage {
        /// Error message describing the storage failure
        message: String,
    },
}

impl TandemError {
    /// Create an authentication error
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create an unregistered type error
    pub fn unregistered_type(type_tag: impl Into<String>) -> Self {
        Self::UnregisteredType {
            type_tag: type_tag.into(),
        }
    }

    /// Create a protocol order error
    pub fn protocol_order(message: impl Into<String>) -> Self {
        Self::ProtocolOrder {
            message: message.into(),
        }
    }

    /// Create a snapshot corruption error
    pub fn snapshot_corruption(message: impl Into<String>) -> Self {
        Self::SnapshotCorruption {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a duplicate object error
    pub fn duplicate_object(id: impl Into<String>) -> Self {
        Self::DuplicateObject { id: id.into() }
    }

    /// Create a disconnected error
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::Disconnected {
            message: message.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Stable error code for logs and wire responses
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::NotFound { .. } => "not_found",
            Self::UnregisteredType { .. } => "unregistered_type",
            Self::ProtocolOrder { .. } => "protocol_order",
            Self::SnapshotCorruption { .. } => "snapshot_corruption",
            Self::Configuration { .. } => "configuration",
            Self::DuplicateObject { .. } => "duplicate_object",
            Self::Disconnected { .. } => "disconnected",
            Self::InvalidState { .. } => "invalid_state",
            Self::Serialization { .. } => "serialization",
            Self::Storage { .. } => "storage",
        }
    }

    /// Whether the caller may retry after re-establishing a connection or
    /// re-authenticating
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Auth { .. } | Self::Disconnected { .. })
    }

    /// Whether the error leaves the affected object or container unusable
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ProtocolOrder { .. }
                | Self::SnapshotCorruption { .. }
                | Self::UnregisteredType { .. }
                | Self::Configuration { .. }
        )
    }
}

/// Standard Result type for Tandem operations
pub type Result<T> = std::result::Result<T, TandemError>;

impl From<serde_json::Error> for TandemError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<std::io::Error> for TandemError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(err.to_string()),
            _ => Self::storage(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_error_display() {
        let err = TandemError::unregistered_type("ink");
        assert_eq!(err.to_string(), "Unregistered type: ink");

        let err = TandemError::not_found("document doc-1");
        assert_eq!(err.to_string(), "Not found: document doc-1");
    }

    #[test]
    fn test_error_codes_are_unique() {
        let errors = [
            TandemError::auth("x"),
            TandemError::not_found("x"),
            TandemError::unregistered_type("x"),
            TandemError::protocol_order("x"),
            TandemError::snapshot_corruption("x"),
            TandemError::configuration("x"),
            TandemError::duplicate_object("x"),
            TandemError::disconnected("x"),
            TandemError::invalid_state("x"),
            TandemError::serialization("x"),
            TandemError::storage("x"),
        ];
        let codes: HashSet<_> = errors.iter().map(TandemError::code).collect();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_retryable_and_fatal_are_disjoint() {
        let auth = TandemError::auth("expired");
        assert!(auth.is_retryable());
        assert!(!auth.is_fatal());

        let order = TandemError::protocol_order("gap");
        assert!(order.is_fatal());
        assert!(!order.is_retryable());
    }

    #[test]
    fn test_io_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing blob");
        assert!(matches!(
            TandemError::from(io_err),
            TandemError::NotFound { .. }
        ));

        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert!(matches!(TandemError::from(io_err), TandemError::Storage { .. }));
    }
}
