//! Connect handshake result

use crate::messages::{ContentFragment, InboundMessage, Operation, Signal};
use serde::{Deserialize, Serialize};
use tandem_core::{ClientId, DocumentId, SequenceNumber, TenantId};
use tokio::sync::mpsc;

/// Everything a client needs to reach a consistent state without further
/// round trips. Immutable once issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Tenant the document belongs to
    pub tenant_id: TenantId,
    /// Document the session is bound to
    pub document_id: DocumentId,
    /// Identity for this connection epoch
    pub client_id: ClientId,
    /// Whether the document had been opened, or had any history, before
    /// this connect
    pub existing: bool,
    /// Document this one was branched from, if any
    pub parent_branch: Option<String>,
    /// Largest inline operation payload in bytes
    pub max_message_size: usize,
    /// Sequenced operations after the last acknowledged snapshot
    pub backlog_operations: Vec<Operation>,
    /// Fragments for detached operations in the backlog
    pub backlog_content: Vec<ContentFragment>,
    /// Recently buffered signals
    pub backlog_signals: Vec<Signal>,
    /// Watermark at connect time
    pub minimum_sequence_number: SequenceNumber,
    /// Head of the document's total order at connect time
    pub sequence_number: SequenceNumber,
}

impl Session {
    /// Sequence number of the last backlog operation, or of the head
    pub fn last_backlog_sequence_number(&self) -> SequenceNumber {
        self.backlog_operations
            .last()
            .map_or(self.sequence_number, |op| op.sequence_number)
    }
}

/// A live connection: the handshake result plus the delivery stream
#[derive(Debug)]
pub struct Connection {
    /// Handshake result
    pub session: Session,
    /// Operations, content and signals in delivery order
    pub inbound: mpsc::UnboundedReceiver<InboundMessage>,
}
