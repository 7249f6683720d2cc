//! Per-document runtime context
//!
//! One [`RuntimeContext`] exists per open container. It is handed to every
//! shared object explicitly and carries the connection epoch (client id and
//! client sequence counter), the last processed sequence number and the
//! outbound queue. Objects never look up connection state anywhere else.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tandem_core::{
    ClientId, DocumentId, Result, RuntimeConfig, SequenceNumber, TandemError, TenantId,
};
use tokio::sync::mpsc;

/// A submission waiting to be transmitted to the ordering service
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    /// Context-wide submission order, stable across reconnects
    pub local_seq: u64,
    /// Connection epoch the submission was stamped for
    pub client_id: ClientId,
    /// Position in that epoch's submission order
    pub client_sequence_number: u64,
    /// Last sequence number processed when stamped
    pub reference_sequence_number: SequenceNumber,
    /// Enveloped payload
    pub contents: Value,
}

#[derive(Debug, Default)]
struct ContextState {
    client_id: Option<ClientId>,
    read_only: bool,
    next_client_sequence_number: u64,
    next_local_seq: u64,
    reference_sequence_number: SequenceNumber,
    minimum_sequence_number: SequenceNumber,
    own_clients: HashSet<ClientId>,
}

/// Connection-scoped state shared by a container and its objects
#[derive(Debug)]
pub struct RuntimeContext {
    tenant_id: TenantId,
    document_id: DocumentId,
    max_pending_local_ops: usize,
    state: Mutex<ContextState>,
    outbox: mpsc::UnboundedSender<Submission>,
}

impl RuntimeContext {
    /// Create a disconnected context and the receiving end of its outbox
    pub fn new(
        tenant_id: TenantId,
        document_id: DocumentId,
        config: &RuntimeConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Submission>) {
        let (outbox, outbound) = mpsc::unbounded_channel();
        let context = Arc::new(Self {
            tenant_id,
            document_id,
            max_pending_local_ops: config.max_pending_local_ops,
            state: Mutex::new(ContextState::default()),
            outbox,
        });
        (context, outbound)
    }

    /// Tenant of the document
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// Document this context is bound to
    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    /// Pending queue bound per object
    pub fn max_pending_local_ops(&self) -> usize {
        self.max_pending_local_ops
    }

    /// Begin a new connection epoch. Client sequence numbers restart at 1.
    pub fn connect(&self, client_id: ClientId, read_only: bool) {
        let mut state = self.state.lock();
        state.own_clients.insert(client_id.clone());
        state.client_id = Some(client_id);
        state.read_only = read_only;
        state.next_client_sequence_number = 1;
    }

    /// End the current epoch. Later submissions are queued untransmitted.
    pub fn disconnect(&self) {
        let mut state = self.state.lock();
        state.client_id = None;
    }

    /// Current connection epoch, `None` while disconnected
    pub fn client_id(&self) -> Option<ClientId> {
        self.state.lock().client_id.clone()
    }

    /// Whether a connection epoch is active
    pub fn is_connected(&self) -> bool {
        self.state.lock().client_id.is_some()
    }

    /// Whether the current or last epoch is read-only
    pub fn is_read_only(&self) -> bool {
        self.state.lock().read_only
    }

    /// Whether `client_id` is one of this context's epochs, past or present
    pub fn is_own_client(&self, client_id: &ClientId) -> bool {
        self.state.lock().own_clients.contains(client_id)
    }

    /// Reserve the next context-wide submission slot
    pub fn next_local_seq(&self) -> u64 {
        let mut state = self.state.lock();
        state.next_local_seq += 1;
        state.next_local_seq
    }

    /// Refuse local mutation on read-only connections
    pub fn ensure_writable(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(TandemError::invalid_state(format!(
                "document {} is open read-only",
                self.document_id
            )));
        }
        Ok(())
    }

    /// Stamp `contents` for the current epoch and queue it for transmission.
    ///
    /// Returns the `(client_id, client_sequence_number)` it was stamped with,
    /// or `None` while disconnected (the caller keeps it pending for resend).
    pub fn transmit(&self, local_seq: u64, contents: Value) -> Result<Option<(ClientId, u64)>> {
        let mut state = self.state.lock();
        if state.read_only {
            return Err(TandemError::invalid_state(format!(
                "document {} is open read-only",
                self.document_id
            )));
        }
        let Some(client_id) = state.client_id.clone() else {
            return Ok(None);
        };
        let client_sequence_number = state.next_client_sequence_number;
        state.next_client_sequence_number += 1;

        let submission = Submission {
            local_seq,
            client_id: client_id.clone(),
            client_sequence_number,
            reference_sequence_number: state.reference_sequence_number,
            contents,
        };
        // Queue under the lock so outbox order matches stamp order
        if self.outbox.send(submission).is_err() {
            return Err(TandemError::disconnected("outbound queue closed"));
        }
        Ok(Some((client_id, client_sequence_number)))
    }

    /// Record that everything up to `sequence_number` has been processed
    pub fn observe(&self, sequence_number: SequenceNumber, minimum_sequence_number: SequenceNumber) {
        let mut state = self.state.lock();
        state.reference_sequence_number = state.reference_sequence_number.max(sequence_number);
        state.minimum_sequence_number = state.minimum_sequence_number.max(minimum_sequence_number);
    }

    /// Last processed sequence number
    pub fn reference_sequence_number(&self) -> SequenceNumber {
        self.state.lock().reference_sequence_number
    }

    /// Last observed watermark
    pub fn minimum_sequence_number(&self) -> SequenceNumber {
        self.state.lock().minimum_sequence_number
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> (Arc<RuntimeContext>, mpsc::UnboundedReceiver<Submission>) {
        RuntimeContext::new(
            TenantId::new("acme"),
            DocumentId::new("board"),
            &RuntimeConfig::default(),
        )
    }

    #[test]
    fn test_disconnected_transmit_is_deferred() {
        let (context, mut outbound) = context();
        assert_eq!(context.transmit(1, json!(1)).unwrap(), None);
        assert!(outbound.try_recv().is_err());
    }

    #[test]
    fn test_epochs_restart_client_sequence_numbers() {
        let (context, mut outbound) = context();
        let first = ClientId::new("c1");
        context.connect(first.clone(), false);
        context.observe(4, 2);

        let stamp = context.transmit(1, json!("a")).unwrap();
        assert_eq!(stamp, Some((first.clone(), 1)));
        let submission = outbound.try_recv().unwrap();
        assert_eq!(submission.reference_sequence_number, 4);

        context.disconnect();
        let second = ClientId::new("c2");
        context.connect(second.clone(), false);
        assert_eq!(context.transmit(2, json!("b")).unwrap(), Some((second, 1)));

        assert!(context.is_own_client(&first));
        assert!(!context.is_own_client(&ClientId::new("someone")));
    }

    #[test]
    fn test_read_only_refuses_transmit() {
        let (context, _outbound) = context();
        context.connect(ClientId::new("viewer"), true);
        assert!(context.ensure_writable().is_err());
        assert!(context.transmit(1, json!(null)).is_err());
    }

    #[test]
    fn test_observe_is_monotonic() {
        let (context, _outbound) = context();
        context.observe(10, 5);
        context.observe(8, 3);
        assert_eq!(context.reference_sequence_number(), 10);
        assert_eq!(context.minimum_sequence_number(), 5);
    }
}
