//! Wire envelope of the operation log protocol
//!
//! Clients submit [`DocumentMessage`]s. The ordering service stamps each one
//! with a sequence number and the current watermark and broadcasts the
//! resulting [`Operation`] to every connected client, the originator included.
//! [`ContentFragment`]s and [`Signal`]s travel on the same stream but are
//! never sequenced.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tandem_core::{ClientId, SequenceNumber};
use tandem_snapshot::Sequenced;

/// Kind of message on the delivery stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    /// Sequenced mutation
    Operation,
    /// Out-of-band contents of an oversized operation
    Content,
    /// Transient, unsequenced broadcast
    Signal,
}

/// What a connecting client intends to do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMode {
    /// Submits operations
    #[default]
    Write,
    /// Observes only
    Read,
}

/// Self-description a client presents at connect time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientDescriptor {
    /// Display name of the user behind the client
    pub user: String,
    /// Read or write
    pub mode: ClientMode,
}

impl ClientDescriptor {
    /// Writer for `user`
    pub fn writer(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            mode: ClientMode::Write,
        }
    }

    /// Read-only observer for `user`
    pub fn reader(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            mode: ClientMode::Read,
        }
    }
}

/// A client submission before sequencing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMessage {
    /// Per-connection counter starting at 1
    pub client_sequence_number: u64,
    /// Last sequence number the client had processed when submitting
    pub reference_sequence_number: SequenceNumber,
    /// Opaque payload; `Null` when the contents travel as fragments
    pub contents: Value,
    /// Contents were uploaded as [`ContentFragment`]s
    #[serde(default)]
    pub detached_contents: bool,
}

/// The unit replicated across clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Originating connection
    pub client_id: ClientId,
    /// Position in the document's total order
    pub sequence_number: SequenceNumber,
    /// Watermark at the time this operation was sequenced
    pub minimum_sequence_number: SequenceNumber,
    /// Originator's per-connection counter
    pub client_sequence_number: u64,
    /// Last sequence number the originator had processed
    pub reference_sequence_number: SequenceNumber,
    /// Opaque payload
    pub contents: Value,
    /// Contents must be rejoined from fragments before apply
    #[serde(default)]
    pub detached_contents: bool,
    /// Set on the receiving side when the operation originated from this
    /// client; never transmitted
    #[serde(skip)]
    pub local: bool,
}

impl Operation {
    /// Message type of an operation
    pub fn message_type(&self) -> MessageType {
        MessageType::Operation
    }
}

impl Sequenced for Operation {
    fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }
}

/// One chunk of the serialized contents of an oversized operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentFragment {
    /// Originating connection
    pub client_id: ClientId,
    /// Client sequence number of the operation these contents belong to
    pub client_sequence_number: u64,
    /// Zero-based index of this chunk
    pub chunk_index: u32,
    /// Total number of chunks
    pub chunk_count: u32,
    /// Slice of the JSON-serialized contents
    pub data: String,
}

/// Unsequenced broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    /// Sender, `None` for service-originated signals
    pub client_id: Option<ClientId>,
    /// Opaque payload
    pub contents: Value,
}

/// Item on a client's delivery stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum InboundMessage {
    /// Sequenced operation
    Operation(Operation),
    /// Detached contents
    Content(ContentFragment),
    /// Transient signal
    Signal(Signal),
}

impl InboundMessage {
    /// Message type of this item
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Operation(_) => MessageType::Operation,
            Self::Content(_) => MessageType::Content,
            Self::Signal(_) => MessageType::Signal,
        }
    }
}

/// Service acknowledgement of accepted submissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAck {
    /// Sequence number assigned to the last accepted message
    pub sequence_number: SequenceNumber,
    /// Watermark after sequencing
    pub minimum_sequence_number: SequenceNumber,
}
