//! # Tandem Core - Foundation Types
//!
//! Types every other Tandem crate builds on:
//!
//! - **Identifiers**: tenants, documents, clients and data objects
//! - **Errors**: the single `TandemError` taxonomy and `Result` alias
//! - **Configuration**: `TandemConfig` loaded from TOML and `TANDEM_*` env vars
//! - **Telemetry**: `tracing` subscriber installation
//!
//! This crate carries no replication logic. The operation log protocol lives in
//! `tandem-protocol`, snapshots in `tandem-snapshot`, the shared object state
//! machine in `tandem-shared` and the container registry in `tandem-container`.

#![forbid(unsafe_code)]

/// Runtime configuration
pub mod config;

/// Unified error handling
pub mod errors;

/// Tenant, document, client and object identifiers
pub mod identifiers;

/// Tracing subscriber setup
pub mod telemetry;

pub use config::{
    CompactionConfig, LoggingConfig, ProtocolConfig, RuntimeConfig, TandemConfig,
};
pub use errors::{Result, TandemError};
pub use identifiers::{ClientId, DocumentId, ObjectId, SequenceNumber, TenantId};
