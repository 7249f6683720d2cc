//! Shared object state machine
//!
//! A [`SharedObject`] wraps one [`SharedModel`] and drives it through
//! `Uninitialized -> Loading -> Ready`. Once ready it accepts:
//!
//! - **local submissions**: applied to the model immediately, queued as
//!   pending and handed to the [`RuntimeContext`] for transmission
//! - **remote operations**: delivered through the object's inbox channel in
//!   sequence order. Echoes of this client's own submissions only retire the
//!   front of the pending queue; everything else goes to the model
//!
//! Any ordering violation or uninterpretable remote payload poisons the
//! object: peers have already applied the operation, so continuing would
//! diverge silently.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tandem_core::{ClientId, ObjectId, Result, SequenceNumber, TandemError};
use tandem_protocol::Operation;
use tandem_snapshot::SnapshotTree;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::context::RuntimeContext;
use crate::envelope::ContainerMessage;
use crate::model::SharedModel;

/// Lifecycle of a shared object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Constructed, nothing loaded
    Uninitialized,
    /// Snapshot being read; remote operations queue in the inbox
    Loading,
    /// Accepting local and remote operations
    Ready,
}

/// A local operation awaiting its sequenced echo
#[derive(Debug, Clone, PartialEq)]
struct PendingOp {
    local_seq: u64,
    sent_as: Option<(ClientId, u64)>,
    contents: Value,
}

#[derive(Debug)]
struct ObjectCore {
    state: ObjectState,
    model: Box<dyn SharedModel>,
    pending: VecDeque<PendingOp>,
    last_applied: SequenceNumber,
    halted: Option<TandemError>,
}

impl ObjectCore {
    fn check_halted(&self) -> Result<()> {
        match &self.halted {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn check_ready(&self, id: &ObjectId) -> Result<()> {
        self.check_halted()?;
        if self.state != ObjectState::Ready {
            return Err(TandemError::invalid_state(format!(
                "object {id} is {:?}, not ready",
                self.state
            )));
        }
        Ok(())
    }
}

/// One replicated data object inside a container
#[derive(Debug)]
pub struct SharedObject {
    id: ObjectId,
    type_tag: String,
    context: Arc<RuntimeContext>,
    core: Mutex<ObjectCore>,
    inbox: Mutex<mpsc::UnboundedReceiver<Operation>>,
}

impl SharedObject {
    /// Create an uninitialized object and the sender feeding its inbox
    pub fn new(
        id: ObjectId,
        type_tag: impl Into<String>,
        model: Box<dyn SharedModel>,
        context: Arc<RuntimeContext>,
    ) -> (Arc<Self>, mpsc::UnboundedSender<Operation>) {
        let (sender, inbox) = mpsc::unbounded_channel();
        let object = Arc::new(Self {
            id,
            type_tag: type_tag.into(),
            context,
            core: Mutex::new(ObjectCore {
                state: ObjectState::Uninitialized,
                model,
                pending: VecDeque::new(),
                last_applied: 0,
                halted: None,
            }),
            inbox: Mutex::new(inbox),
        });
        (object, sender)
    }

    /// Object id, unique within its container
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    /// Registry type tag
    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    /// Current lifecycle state
    pub fn state(&self) -> ObjectState {
        self.core.lock().state
    }

    /// Number of local operations not yet sequenced
    pub fn pending_len(&self) -> usize {
        self.core.lock().pending.len()
    }

    /// Sequence number of the last operation applied or acknowledged
    pub fn last_applied_sequence_number(&self) -> SequenceNumber {
        self.core.lock().last_applied
    }

    /// Error that poisoned this object, if any
    pub fn halted(&self) -> Option<TandemError> {
        self.core.lock().halted.clone()
    }

    /// `Uninitialized -> Loading`
    pub fn begin_load(&self) -> Result<()> {
        let mut core = self.core.lock();
        core.check_halted()?;
        if core.state != ObjectState::Uninitialized {
            return Err(TandemError::invalid_state(format!(
                "object {} is already {:?}",
                self.id, core.state
            )));
        }
        core.state = ObjectState::Loading;
        Ok(())
    }

    /// Finish loading and become `Ready`.
    ///
    /// `snapshot` is the object's stored subtree, `None` for a fresh object
    /// that starts from its empty default. `sequence_number` is the point the
    /// state corresponds to. Operations that queued in the inbox meanwhile
    /// are applied before returning; the count is returned.
    pub fn initialize(
        &self,
        snapshot: Option<&SnapshotTree>,
        sequence_number: SequenceNumber,
    ) -> Result<usize> {
        {
            let mut core = self.core.lock();
            core.check_halted()?;
            if core.state == ObjectState::Ready {
                return Err(TandemError::invalid_state(format!(
                    "object {} is already ready",
                    self.id
                )));
            }
            core.state = ObjectState::Loading;
            if let Some(tree) = snapshot {
                if let Err(err) = core.model.load(tree) {
                    error!(object_id = %self.id, error = %err, "snapshot load failed");
                    core.halted = Some(err.clone());
                    return Err(err);
                }
            }
            core.last_applied = sequence_number;
            core.state = ObjectState::Ready;
        }
        debug!(object_id = %self.id, sequence_number, "object ready");
        self.drain_inbox()
    }

    /// Apply every operation waiting in the inbox. Does nothing until ready.
    pub fn drain_inbox(&self) -> Result<usize> {
        if self.state() != ObjectState::Ready {
            return Ok(0);
        }
        let mut inbox = self.inbox.lock();
        let mut applied = 0;
        while let Ok(operation) = inbox.try_recv() {
            self.apply_remote(&operation)?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Apply a local operation optimistically and queue it for transmission
    pub fn submit_local(&self, contents: Value) -> Result<()> {
        let mut core = self.core.lock();
        self.prepare_submit(&core)?;
        core.model.apply_local(&contents)?;
        self.enqueue(&mut core, contents)
    }

    /// Like [`Self::submit_local`], building the payload from the typed model.
    ///
    /// The payload is computed and applied under one lock so it cannot race
    /// another submission on the same object.
    pub fn submit_local_with<M, F>(&self, build: F) -> Result<()>
    where
        M: SharedModel,
        F: FnOnce(&M) -> Result<Value>,
    {
        let mut core = self.core.lock();
        self.prepare_submit(&core)?;
        let contents = {
            let model = downcast_ref::<M>(&self.id, core.model.as_ref())?;
            build(model)?
        };
        core.model.apply_local(&contents)?;
        self.enqueue(&mut core, contents)
    }

    fn prepare_submit(&self, core: &ObjectCore) -> Result<()> {
        core.check_ready(&self.id)?;
        self.context.ensure_writable()?;
        if core.pending.len() >= self.context.max_pending_local_ops() {
            return Err(TandemError::invalid_state(format!(
                "object {} has {} unsequenced local operations",
                self.id,
                core.pending.len()
            )));
        }
        Ok(())
    }

    fn enqueue(&self, core: &mut ObjectCore, contents: Value) -> Result<()> {
        let local_seq = self.context.next_local_seq();
        let sent_as = self
            .context
            .transmit(local_seq, self.envelope(&contents)?)?;
        core.pending.push_back(PendingOp {
            local_seq,
            sent_as,
            contents,
        });
        Ok(())
    }

    fn envelope(&self, contents: &Value) -> Result<Value> {
        ContainerMessage::Operation {
            address: self.id.clone(),
            contents: contents.clone(),
        }
        .to_value()
    }

    /// Apply one sequenced operation addressed to this object.
    ///
    /// `operation.contents` is the domain payload with the container
    /// envelope already removed.
    pub fn apply_remote(&self, operation: &Operation) -> Result<()> {
        let mut core = self.core.lock();
        core.check_ready(&self.id)?;
        match self.apply_sequenced(&mut core, operation) {
            Ok(()) => {
                core.last_applied = operation.sequence_number;
                Ok(())
            }
            Err(err) => {
                error!(
                    object_id = %self.id,
                    sequence_number = operation.sequence_number,
                    client_id = %operation.client_id,
                    error = %err,
                    "object halted"
                );
                core.halted = Some(err.clone());
                Err(err)
            }
        }
    }

    fn apply_sequenced(&self, core: &mut ObjectCore, operation: &Operation) -> Result<()> {
        if operation.sequence_number <= core.last_applied {
            return Err(TandemError::protocol_order(format!(
                "object {} received sequence number {} after {}",
                self.id, operation.sequence_number, core.last_applied
            )));
        }

        let is_echo = operation.local || self.context.is_own_client(&operation.client_id);
        if !is_echo {
            debug!(
                object_id = %self.id,
                sequence_number = operation.sequence_number,
                client_id = %operation.client_id,
                "applying remote operation"
            );
            return core.model.apply_remote(&operation.contents, operation);
        }

        let stamp = (
            operation.client_id.clone(),
            operation.client_sequence_number,
        );
        let matches = core.pending.front().is_some_and(|pending| {
            pending.sent_as.as_ref() == Some(&stamp) && pending.contents == operation.contents
        });
        if !matches {
            return Err(TandemError::protocol_order(format!(
                "echo {}:{} at sequence number {} does not match the pending queue of object {}",
                operation.client_id,
                operation.client_sequence_number,
                operation.sequence_number,
                self.id
            )));
        }
        if let Some(pending) = core.pending.pop_front() {
            core.model.ack_local(&pending.contents)?;
        }
        debug!(
            object_id = %self.id,
            sequence_number = operation.sequence_number,
            "local operation acknowledged"
        );
        Ok(())
    }

    /// Context-wide submission slots of every unsequenced local operation
    pub fn pending_local_seqs(&self) -> Vec<u64> {
        self.core
            .lock()
            .pending
            .iter()
            .map(|pending| pending.local_seq)
            .collect()
    }

    /// Retransmit the pending operation in slot `local_seq` under the
    /// current connection epoch. State is not touched.
    pub fn resend(&self, local_seq: u64) -> Result<()> {
        let mut core = self.core.lock();
        core.check_halted()?;
        let Some(index) = core
            .pending
            .iter()
            .position(|pending| pending.local_seq == local_seq)
        else {
            return Err(TandemError::not_found(format!(
                "object {} has no pending operation {local_seq}",
                self.id
            )));
        };
        let envelope = self.envelope(&core.pending[index].contents)?;
        let sent_as = self.context.transmit(local_seq, envelope)?;
        core.pending[index].sent_as = sent_as;
        Ok(())
    }

    /// Move a ready object forward to a stored snapshot at `sequence_number`
    /// that reflects operations this object never saw.
    ///
    /// `model` is a fresh model the snapshot is loaded into. Pending
    /// operations that `sequenced` reports as already in the snapshot are
    /// retired; the rest are reapplied on top and stay pending. Returns the
    /// number retired.
    pub fn rebase(
        &self,
        mut model: Box<dyn SharedModel>,
        tree: &SnapshotTree,
        sequence_number: SequenceNumber,
        sequenced: impl Fn(&ClientId, u64) -> bool,
    ) -> Result<usize> {
        let mut core = self.core.lock();
        core.check_ready(&self.id)?;
        if let Err(err) = model.load(tree) {
            error!(object_id = %self.id, error = %err, "snapshot load failed");
            core.halted = Some(err.clone());
            return Err(err);
        }

        let before = core.pending.len();
        core.pending.retain(|pending| {
            !pending
                .sent_as
                .as_ref()
                .is_some_and(|(client, csn)| sequenced(client, *csn))
        });
        for pending in &core.pending {
            // The target may be gone from the newer state; peers ignore it too
            if let Err(err) = model.apply_local(&pending.contents) {
                debug!(object_id = %self.id, error = %err, "pending operation has no effect after rebase");
            }
        }
        core.model = model;
        core.last_applied = sequence_number;
        let retired = before - core.pending.len();
        debug!(
            object_id = %self.id,
            sequence_number,
            retired,
            pending = core.pending.len(),
            "object rebased onto snapshot"
        );
        Ok(retired)
    }

    /// Serialize sequenced state. Refused while local operations are pending.
    pub fn snapshot(&self) -> Result<SnapshotTree> {
        let core = self.core.lock();
        core.check_ready(&self.id)?;
        if !core.pending.is_empty() {
            return Err(TandemError::invalid_state(format!(
                "object {} has {} unsequenced local operations",
                self.id,
                core.pending.len()
            )));
        }
        core.model.snapshot()
    }

    /// Read the typed model
    pub fn with_model<M, R>(&self, read: impl FnOnce(&M) -> R) -> Result<R>
    where
        M: SharedModel,
    {
        let core = self.core.lock();
        core.check_ready(&self.id)?;
        let model = downcast_ref::<M>(&self.id, core.model.as_ref())?;
        Ok(read(model))
    }
}

fn downcast_ref<'a, M: SharedModel>(id: &ObjectId, model: &'a dyn SharedModel) -> Result<&'a M> {
    model.as_any().downcast_ref::<M>().ok_or_else(|| {
        TandemError::invalid_state(format!(
            "object {id} is not a {}",
            std::any::type_name::<M>()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Submission;
    use crate::map::MapModel;
    use serde_json::json;
    use tandem_core::{DocumentId, RuntimeConfig, TenantId};

    struct Harness {
        context: Arc<RuntimeContext>,
        outbound: mpsc::UnboundedReceiver<Submission>,
        object: Arc<SharedObject>,
        inbox: mpsc::UnboundedSender<Operation>,
    }

    fn harness(max_pending_local_ops: usize) -> Harness {
        let config = RuntimeConfig {
            max_pending_local_ops,
        };
        let (context, outbound) =
            RuntimeContext::new(TenantId::new("t"), DocumentId::new("d"), &config);
        context.connect(ClientId::new("me"), false);
        let (object, inbox) = SharedObject::new(
            ObjectId::new("root"),
            "tandem/map",
            Box::<MapModel>::default(),
            context.clone(),
        );
        Harness {
            context,
            outbound,
            object,
            inbox,
        }
    }

    fn sequenced(submission: &Submission, sequence_number: SequenceNumber) -> Operation {
        let message = ContainerMessage::from_value(submission.contents.clone()).unwrap();
        let ContainerMessage::Operation { contents, .. } = message else {
            panic!("expected operation envelope");
        };
        Operation {
            client_id: submission.client_id.clone(),
            sequence_number,
            minimum_sequence_number: 0,
            client_sequence_number: submission.client_sequence_number,
            reference_sequence_number: submission.reference_sequence_number,
            contents,
            detached_contents: false,
            local: false,
        }
    }

    fn remote(sequence_number: SequenceNumber, contents: Value) -> Operation {
        Operation {
            client_id: ClientId::new("peer"),
            sequence_number,
            minimum_sequence_number: 0,
            client_sequence_number: sequence_number,
            reference_sequence_number: 0,
            contents,
            detached_contents: false,
            local: false,
        }
    }

    fn value_of(object: &SharedObject, key: &str) -> Option<Value> {
        object
            .with_model::<MapModel, _>(|model| model.get(key).cloned())
            .unwrap()
    }

    #[test]
    fn test_lifecycle_states() {
        let h = harness(10);
        assert_eq!(h.object.state(), ObjectState::Uninitialized);
        h.object.begin_load().unwrap();
        assert_eq!(h.object.state(), ObjectState::Loading);
        assert!(h.object.submit_local(json!({"type": "clear"})).is_err());
        h.object.initialize(None, 3).unwrap();
        assert_eq!(h.object.state(), ObjectState::Ready);
        assert_eq!(h.object.last_applied_sequence_number(), 3);
        assert!(h.object.begin_load().is_err());
    }

    #[test]
    fn test_inbox_queues_until_ready() {
        let h = harness(10);
        h.inbox
            .send(remote(1, json!({"type": "set", "key": "a", "value": 1})))
            .unwrap();
        assert_eq!(h.object.drain_inbox().unwrap(), 0);
        assert_eq!(h.object.initialize(None, 0).unwrap(), 1);
        assert_eq!(value_of(&h.object, "a"), Some(json!(1)));
    }

    #[test]
    fn test_echo_does_not_reapply() {
        let mut h = harness(10);
        h.object.initialize(None, 0).unwrap();
        h.object
            .submit_local(json!({"type": "set", "key": "k", "value": "mine"}))
            .unwrap();
        assert_eq!(value_of(&h.object, "k"), Some(json!("mine")));
        assert_eq!(h.object.pending_len(), 1);

        let submission = h.outbound.try_recv().unwrap();
        // A remote write sequenced first must not clobber the pending local one
        h.object
            .apply_remote(&remote(4, json!({"type": "set", "key": "k", "value": "theirs"})))
            .unwrap();
        assert_eq!(value_of(&h.object, "k"), Some(json!("mine")));

        h.object.apply_remote(&sequenced(&submission, 5)).unwrap();
        assert_eq!(h.object.pending_len(), 0);
        assert_eq!(h.object.last_applied_sequence_number(), 5);
        assert_eq!(value_of(&h.object, "k"), Some(json!("mine")));
    }

    #[test]
    fn test_out_of_order_poisons_object() {
        let h = harness(10);
        h.object.initialize(None, 0).unwrap();
        h.object
            .apply_remote(&remote(2, json!({"type": "clear"})))
            .unwrap();
        let err = h
            .object
            .apply_remote(&remote(2, json!({"type": "clear"})))
            .unwrap_err();
        assert!(matches!(err, TandemError::ProtocolOrder { .. }));

        // Every later call reports the original failure
        assert_eq!(h.object.halted(), Some(err.clone()));
        assert_eq!(
            h.object.submit_local(json!({"type": "clear"})).unwrap_err(),
            err
        );
    }

    #[test]
    fn test_uninterpretable_payload_is_fatal() {
        let h = harness(10);
        h.object.initialize(None, 0).unwrap();
        let err = h
            .object
            .apply_remote(&remote(1, json!({"type": "explode"})))
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(h.object.halted().is_some());
    }

    #[test]
    fn test_mismatched_echo_is_protocol_error() {
        let h = harness(10);
        h.object.initialize(None, 0).unwrap();
        let mut echo = remote(1, json!({"type": "clear"}));
        echo.client_id = h.context.client_id().unwrap();
        let err = h.object.apply_remote(&echo).unwrap_err();
        assert!(matches!(err, TandemError::ProtocolOrder { .. }));
    }

    #[test]
    fn test_pending_queue_is_bounded() {
        let h = harness(2);
        h.object.initialize(None, 0).unwrap();
        h.object.submit_local(json!({"type": "clear"})).unwrap();
        h.object.submit_local(json!({"type": "clear"})).unwrap();
        let err = h.object.submit_local(json!({"type": "clear"})).unwrap_err();
        assert!(matches!(err, TandemError::InvalidState { .. }));
    }

    #[test]
    fn test_resend_restamps_without_reapplying() {
        let mut h = harness(10);
        h.object.initialize(None, 0).unwrap();
        h.context.disconnect();
        h.object
            .submit_local(json!({"type": "set", "key": "k", "value": 1}))
            .unwrap();
        assert!(h.outbound.try_recv().is_err());

        h.context.connect(ClientId::new("me-2"), false);
        for local_seq in h.object.pending_local_seqs() {
            h.object.resend(local_seq).unwrap();
        }
        let submission = h.outbound.try_recv().unwrap();
        assert_eq!(submission.client_id, ClientId::new("me-2"));
        assert_eq!(submission.client_sequence_number, 1);

        h.object.apply_remote(&sequenced(&submission, 1)).unwrap();
        assert_eq!(h.object.pending_len(), 0);
        assert_eq!(value_of(&h.object, "k"), Some(json!(1)));
    }

    #[test]
    fn test_snapshot_refused_while_pending() {
        let h = harness(10);
        h.object.initialize(None, 0).unwrap();
        h.object.submit_local(json!({"type": "clear"})).unwrap();
        assert!(h.object.snapshot().is_err());
    }

    #[test]
    fn test_rebase_retires_sequenced_and_reapplies_the_rest() {
        let h = harness(10);
        h.object.initialize(None, 0).unwrap();
        h.object
            .submit_local(json!({"type": "set", "key": "sent", "value": 1}))
            .unwrap();
        h.context.disconnect();
        h.object
            .submit_local(json!({"type": "set", "key": "offline", "value": 2}))
            .unwrap();

        // The snapshot already holds the first edit plus a peer's write
        let mut tree = SnapshotTree::new();
        tree.insert_blob(
            crate::model::HEADER_ENTRY,
            tandem_snapshot::SnapshotBlob::json(&json!({"sent": 1, "peer": 3})).unwrap(),
        )
        .unwrap();
        let retired = h
            .object
            .rebase(Box::<MapModel>::default(), &tree, 7, |client, csn| {
                client == &ClientId::new("me") && csn <= 1
            })
            .unwrap();

        assert_eq!(retired, 1);
        assert_eq!(h.object.pending_len(), 1);
        assert_eq!(h.object.last_applied_sequence_number(), 7);
        assert_eq!(value_of(&h.object, "sent"), Some(json!(1)));
        assert_eq!(value_of(&h.object, "peer"), Some(json!(3)));
        assert_eq!(value_of(&h.object, "offline"), Some(json!(2)));

        // The reapplied edit still shields its key from remote writes
        h.object
            .apply_remote(&remote(8, json!({"type": "set", "key": "offline", "value": 0})))
            .unwrap();
        assert_eq!(value_of(&h.object, "offline"), Some(json!(2)));
    }
}
