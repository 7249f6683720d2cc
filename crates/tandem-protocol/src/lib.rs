//! # Tandem Protocol - Operation Log Protocol
//!
//! The wire contract every client and the ordering service obey:
//!
//! - **Handshake**: `connect` returns a [`Session`] carrying the client's
//!   identity, the backlog since the last snapshot and the current watermark,
//!   plus a delivery stream
//! - **Envelope**: clients submit [`DocumentMessage`]s, the service broadcasts
//!   sequenced [`Operation`]s to everyone, originator included
//! - **Watermark**: the minimum sequence number across connected clients,
//!   the horizon below which history may be compacted
//!
//! ## Ordering guarantee
//!
//! For any two operations A and B with `A.sequence_number < B.sequence_number`
//! every client applies A before B. [`OperationLog`] enforces this on the
//! receiving side; gaps are `ProtocolOrder` errors.

#![forbid(unsafe_code)]

pub mod content;
pub mod local_service;
pub mod log;
pub mod messages;
pub mod ordering;
pub mod session;
pub mod watermark;

pub use content::{exceeds_limit, split_contents, ContentCache};
pub use local_service::LocalOrderingService;
pub use log::OperationLog;
pub use messages::{
    ClientDescriptor, ClientMode, ContentFragment, DocumentMessage, InboundMessage, MessageType,
    Operation, Signal, SubmitAck,
};
pub use ordering::OrderingService;
pub use session::{Connection, Session};
pub use watermark::WatermarkTracker;
