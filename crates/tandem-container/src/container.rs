//! Collaborative container
//!
//! A [`Container`] is one open document: the connection to the ordering
//! service, the inbound [`OperationLog`], and every data object in the
//! document. It routes sequenced operations to objects, transmits their
//! local submissions, and owns the create/load/summarize/reconnect flows.
//!
//! ## Snapshot layout
//!
//! ```text
//! .attributes   {"sequenceNumber": .., "minimumSequenceNumber": ..}
//! .objects      [{"id": .., "typeTag": ..}, ...]   in attach order
//! .clients      {clientId: last sequenced clientSequenceNumber, ...}
//! {id}/header   per-object state, one subtree per data object
//! ```
//!
//! Objects listed in a loaded snapshot are realized lazily on first lookup.
//! Operations addressed to them meanwhile queue in their inbox.
//!
//! A client that reconnects after a peer summarized history it never saw
//! cannot catch up from the session backlog alone. It fast-forwards to the
//! stored snapshot instead: objects are rebased onto it, and `.clients`
//! tells which of its in-flight operations the snapshot already contains.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tandem_core::{
    ClientId, DocumentId, ObjectId, Result, SequenceNumber, TandemConfig, TandemError, TenantId,
};
use tandem_protocol::{
    exceeds_limit, split_contents, ClientDescriptor, ClientMode, Connection, DocumentMessage,
    InboundMessage, Operation, OperationLog, OrderingService, Session, Signal,
};
use tandem_shared::{ContainerMessage, ObjectHandle, RuntimeContext, SharedObject, Submission};
use tandem_snapshot::{
    DocumentAttributes, SnapshotBlob, SnapshotManifest, SnapshotStore, SnapshotTree,
};
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info, warn};

use crate::loader::ScopeGuard;
use crate::registry::{is_valid_object_id, Registry};
use crate::request::RequestPath;

/// Snapshot entry listing every data object
pub const OBJECTS_ENTRY: &str = ".objects";

/// Snapshot entry recording the last sequenced submission of every client
pub const CLIENTS_ENTRY: &str = ".clients";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectEntry {
    id: ObjectId,
    type_tag: String,
}

struct ObjectSlot {
    object: Arc<SharedObject>,
    inbox: mpsc::UnboundedSender<Operation>,
    ready: Arc<OnceCell<()>>,
    stored: Option<SnapshotTree>,
    base: SequenceNumber,
}

#[derive(Debug)]
struct PendingAttach {
    local_seq: u64,
    id: ObjectId,
    type_tag: String,
}

struct ContainerState {
    log: OperationLog,
    objects: HashMap<ObjectId, ObjectSlot>,
    /// Sequenced objects in attach order
    order: Vec<ObjectId>,
    pending_attaches: VecDeque<PendingAttach>,
    signals: VecDeque<Signal>,
    /// Last sequenced client sequence number per client
    client_progress: BTreeMap<ClientId, u64>,
    /// Sequence number of the snapshot this client loaded or last wrote
    summarized_at: SequenceNumber,
    max_message_size: usize,
    halted: Option<TandemError>,
}

impl ContainerState {
    fn check_halted(&self) -> Result<()> {
        match &self.halted {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

enum Resend {
    Attach(ObjectId, String),
    Object(Arc<SharedObject>),
}

/// Everything a container needs from the [`crate::Loader`] that opens it
pub(crate) struct ContainerParts {
    pub tenant_id: TenantId,
    pub document_id: DocumentId,
    pub token: String,
    pub descriptor: ClientDescriptor,
    pub service: Arc<dyn OrderingService>,
    pub store: SnapshotStore,
    pub registry: Arc<Registry>,
    pub config: TandemConfig,
    pub scope: ScopeGuard,
}

/// One open collaborative document
pub struct Container {
    tenant_id: TenantId,
    document_id: DocumentId,
    token: String,
    descriptor: ClientDescriptor,
    service: Arc<dyn OrderingService>,
    store: SnapshotStore,
    registry: Arc<Registry>,
    config: TandemConfig,
    parent_branch: Option<String>,
    context: Arc<RuntimeContext>,
    outbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Submission>>,
    inbound: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
    state: Mutex<ContainerState>,
    _scope: ScopeGuard,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("tenant_id", &self.tenant_id)
            .field("document_id", &self.document_id)
            .field("client_id", &self.context.client_id())
            .finish_non_exhaustive()
    }
}

impl Container {
    /// Wire up a container from a fresh connection and an optional stored
    /// snapshot, then catch up on the session backlog.
    pub(crate) async fn open(
        parts: ContainerParts,
        connection: Connection,
        snapshot: Option<SnapshotTree>,
    ) -> Result<Self> {
        let ContainerParts {
            tenant_id,
            document_id,
            token,
            descriptor,
            service,
            store,
            registry,
            config,
            scope,
        } = parts;

        let attributes = match &snapshot {
            Some(tree) => DocumentAttributes::from_tree(tree)?,
            None => DocumentAttributes::default(),
        };
        let (context, outbound) =
            RuntimeContext::new(tenant_id.clone(), document_id.clone(), &config.runtime);
        context.observe(
            attributes.sequence_number,
            attributes.minimum_sequence_number,
        );

        let mut state = ContainerState {
            log: OperationLog::new(
                attributes.sequence_number,
                attributes.minimum_sequence_number,
            ),
            objects: HashMap::new(),
            order: Vec::new(),
            pending_attaches: VecDeque::new(),
            signals: VecDeque::new(),
            client_progress: BTreeMap::new(),
            summarized_at: attributes.sequence_number,
            max_message_size: connection.session.max_message_size,
            halted: None,
        };

        if let Some(tree) = &snapshot {
            let entries: Vec<ObjectEntry> = tree.require_blob(OBJECTS_ENTRY)?.to_json()?;
            for entry in entries {
                let model = registry.factory(&entry.type_tag)?.create();
                let (object, inbox) = SharedObject::new(
                    entry.id.clone(),
                    entry.type_tag,
                    model,
                    context.clone(),
                );
                state.objects.insert(
                    entry.id.clone(),
                    ObjectSlot {
                        object,
                        inbox,
                        ready: Arc::new(OnceCell::new()),
                        stored: Some(tree.require_tree(entry.id.as_str())?.clone()),
                        base: attributes.sequence_number,
                    },
                );
                state.order.push(entry.id);
            }
            state.client_progress = read_client_progress(tree)?;
        }

        let container = Self {
            tenant_id,
            document_id,
            token,
            descriptor,
            service,
            store,
            registry,
            config,
            parent_branch: connection.session.parent_branch.clone(),
            context,
            outbound: tokio::sync::Mutex::new(outbound),
            inbound: tokio::sync::Mutex::new(None),
            state: Mutex::new(state),
            _scope: scope,
        };
        if let Some(err) = container.attach_connection(connection).await? {
            return Err(err);
        }
        Ok(container)
    }

    /// Adopt a new connection epoch and process its backlog. Echoes of
    /// operations sent under earlier epochs are acknowledged here.
    ///
    /// Container-level failures are returned as `Err`. A failure confined to
    /// one data object is returned as `Ok(Some(..))` once everything else has
    /// caught up.
    async fn attach_connection(&self, connection: Connection) -> Result<Option<TandemError>> {
        let Connection { session, inbound } = connection;
        self.context.connect(
            session.client_id.clone(),
            self.descriptor.mode == ClientMode::Read,
        );
        // The receiver is only swapped while no other task holds it
        match self.inbound.try_lock() {
            Ok(mut slot) => *slot = Some(inbound),
            Err(_) => {
                return Err(TandemError::invalid_state(
                    "connection replaced while inbound messages are being processed",
                ))
            }
        }

        let base = backlog_base(&session);
        let mut object_error = None;
        if self.sequence_number() < base {
            object_error = self.fast_forward(base).await?;
        }
        let backlog_error = self.process_session(&session)?;
        Ok(object_error.or(backlog_error))
    }

    /// Jump to the latest stored snapshot. Needed when the session backlog
    /// starts past this client's head because a peer summarized and the
    /// service compacted the operations in between.
    async fn fast_forward(&self, base: SequenceNumber) -> Result<Option<TandemError>> {
        let head = self.sequence_number();
        let gap = || {
            TandemError::protocol_order(format!(
                "backlog resumes after {base} but this client stopped at {head} \
                 and no stored snapshot covers the gap"
            ))
        };
        let Some(tree) = self.store.read(&self.tenant_id, &self.document_id).await? else {
            return Err(gap());
        };
        let attributes = DocumentAttributes::from_tree(&tree)?;
        if attributes.sequence_number < base {
            return Err(gap());
        }
        let entries: Vec<ObjectEntry> = tree.require_blob(OBJECTS_ENTRY)?.to_json()?;
        let progress = read_client_progress(&tree)?;
        let sequenced = |client: &ClientId, csn: u64| {
            progress.get(client).is_some_and(|last| csn <= *last)
        };

        let mut state = self.state.lock();
        state.check_halted()?;
        // Attaches the snapshot already lists were sequenced while away
        state.pending_attaches.retain(|pending| {
            !entries
                .iter()
                .any(|entry| entry.id == pending.id && entry.type_tag == pending.type_tag)
        });

        let mut first_error = None;
        let mut retired = 0;
        for entry in &entries {
            let subtree = tree.require_tree(entry.id.as_str())?;
            let existing = state.objects.get(&entry.id).map(|slot| {
                (
                    slot.object.type_tag() == entry.type_tag,
                    slot.ready.initialized().then(|| slot.object.clone()),
                )
            });
            match existing {
                Some((false, _)) => {
                    let err = TandemError::duplicate_object(entry.id.as_str());
                    return Err(self.halt(&mut state, err));
                }
                Some((true, Some(object))) => {
                    if object.halted().is_some() {
                        continue;
                    }
                    let model = self.registry.factory(&entry.type_tag)?.create();
                    match object.rebase(model, subtree, attributes.sequence_number, sequenced) {
                        Ok(count) => retired += count,
                        Err(err) => {
                            first_error.get_or_insert(err);
                        }
                    }
                }
                // Never realized here: load lazily from the newer snapshot
                Some((true, None)) | None => {
                    let model = self.registry.factory(&entry.type_tag)?.create();
                    let (object, inbox) = SharedObject::new(
                        entry.id.clone(),
                        entry.type_tag.clone(),
                        model,
                        self.context.clone(),
                    );
                    state.objects.insert(
                        entry.id.clone(),
                        ObjectSlot {
                            object,
                            inbox,
                            ready: Arc::new(OnceCell::new()),
                            stored: Some(subtree.clone()),
                            base: attributes.sequence_number,
                        },
                    );
                }
            }
        }

        state.order = entries.into_iter().map(|entry| entry.id).collect();
        state.log = OperationLog::new(
            attributes.sequence_number,
            attributes.minimum_sequence_number,
        );
        state.client_progress = progress;
        state.summarized_at = attributes.sequence_number;
        self.context.observe(
            attributes.sequence_number,
            attributes.minimum_sequence_number,
        );
        info!(
            document = %self.document_id,
            from = head,
            to = attributes.sequence_number,
            retired,
            "Container fast-forwarded to snapshot"
        );
        Ok(first_error)
    }

    fn process_session(&self, session: &Session) -> Result<Option<TandemError>> {
        let mut state = self.state.lock();
        state.max_message_size = session.max_message_size;

        let head = state.log.last_processed_sequence_number();
        let base = backlog_base(session);
        if head < base {
            return Err(TandemError::protocol_order(format!(
                "backlog resumes after {base} but this client has only processed up to {head}"
            )));
        }

        for fragment in &session.backlog_content {
            state.log.insert_content(fragment.clone())?;
        }
        // A poisoned object must not stop the rest of the backlog
        let mut first_error = None;
        for op in &session.backlog_operations {
            if let Err(err) = self.admit(&mut state, op.clone()) {
                if state.halted.is_some() {
                    return Err(err);
                }
                first_error.get_or_insert(err);
            }
        }
        for signal in &session.backlog_signals {
            self.record_signal(&mut state, signal.clone());
        }
        info!(
            tenant = %self.tenant_id,
            document = %self.document_id,
            client_id = %session.client_id,
            backlog = session.backlog_operations.len(),
            sequence_number = state.log.last_processed_sequence_number(),
            "Container connected"
        );
        Ok(first_error)
    }

    /// Run the eager-initialization list. Only the create path calls this.
    pub(crate) fn create_root_objects(&self) -> Result<()> {
        for root in self.registry.root_objects() {
            self.create_local(&root.type_tag, root.id.clone())?;
        }
        Ok(())
    }

    /// Tenant of the document
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// Document id
    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    /// Current connection epoch, `None` while disconnected
    pub fn client_id(&self) -> Option<ClientId> {
        self.context.client_id()
    }

    /// Whether a connection epoch is active
    pub fn is_connected(&self) -> bool {
        self.context.is_connected()
    }

    /// Document this one was branched from, if any
    pub fn parent_branch(&self) -> Option<&str> {
        self.parent_branch.as_deref()
    }

    /// Runtime context shared with every data object
    pub fn context(&self) -> &Arc<RuntimeContext> {
        &self.context
    }

    /// Configuration the container was opened with
    pub fn config(&self) -> &TandemConfig {
        &self.config
    }

    /// Last sequence number processed
    pub fn sequence_number(&self) -> SequenceNumber {
        self.state.lock().log.last_processed_sequence_number()
    }

    /// Watermark carried by the last processed operation
    pub fn minimum_sequence_number(&self) -> SequenceNumber {
        self.state.lock().log.minimum_sequence_number()
    }

    /// Whether enough operations were sequenced since the last snapshot this
    /// client loaded or wrote to warrant a new [`Self::summarize`]
    pub fn should_summarize(&self) -> bool {
        let state = self.state.lock();
        let since = state
            .log
            .last_processed_sequence_number()
            .saturating_sub(state.summarized_at);
        since >= self.config.compaction.summary_interval_ops
    }

    /// Ids of every sequenced data object in attach order
    pub fn object_ids(&self) -> Vec<ObjectId> {
        self.state.lock().order.clone()
    }

    /// Number of local operations and attaches not yet sequenced
    pub fn pending_len(&self) -> usize {
        let state = self.state.lock();
        state.pending_attaches.len()
            + state
                .objects
                .values()
                .map(|slot| slot.object.pending_len())
                .sum::<usize>()
    }

    /// Signals received so far, oldest first, up to the configured buffer
    pub fn signals(&self) -> Vec<Signal> {
        self.state.lock().signals.iter().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Creation and lookup
    // ------------------------------------------------------------------

    /// Resolve a request path: `/create/{typeTag}/{id}` creates, `/{id}`
    /// looks up.
    pub async fn request(&self, path: &str) -> Result<Arc<SharedObject>> {
        match path.parse::<RequestPath>()? {
            RequestPath::Create { type_tag, id } => self.create_local(&type_tag, id),
            RequestPath::Lookup { id } => self.get_data_object(&id).await,
        }
    }

    /// Create data object `id` of `type_tag` and announce it to every client.
    ///
    /// Fails with `UnregisteredType` for an unknown tag and `DuplicateObject`
    /// if the id is taken; neither creates an instance.
    pub async fn create_data_object(
        &self,
        type_tag: &str,
        id: impl Into<ObjectId>,
    ) -> Result<Arc<SharedObject>> {
        let path = RequestPath::create(type_tag, id);
        self.request(&path.to_string()).await
    }

    /// Typed [`Self::create_data_object`]
    pub async fn create<H: ObjectHandle>(&self, id: impl Into<ObjectId>) -> Result<H> {
        H::from_object(self.create_data_object(H::TYPE_TAG, id).await?)
    }

    /// Resolve data object `id`, waiting for it to finish loading
    pub async fn get_data_object(&self, id: &ObjectId) -> Result<Arc<SharedObject>> {
        let (object, ready, stored, base) = {
            let state = self.state.lock();
            state.check_halted()?;
            let slot = state
                .objects
                .get(id)
                .ok_or_else(|| TandemError::not_found(format!("data object {id}")))?;
            (
                slot.object.clone(),
                slot.ready.clone(),
                slot.stored.clone(),
                slot.base,
            )
        };

        // Concurrent lookups share one load
        ready
            .get_or_try_init(|| async {
                object.begin_load()?;
                let drained = object.initialize(stored.as_ref(), base)?;
                debug!(object_id = %id, drained, "Data object realized");
                Ok::<(), TandemError>(())
            })
            .await?;
        Ok(object)
    }

    /// Typed [`Self::get_data_object`]
    pub async fn get<H: ObjectHandle>(&self, id: &ObjectId) -> Result<H> {
        H::from_object(self.get_data_object(id).await?)
    }

    fn create_local(&self, type_tag: &str, id: ObjectId) -> Result<Arc<SharedObject>> {
        if !is_valid_object_id(&id) {
            return Err(TandemError::invalid_state(format!(
                "invalid data object id {:?}",
                id.as_str()
            )));
        }
        let factory = self.registry.factory(type_tag)?;
        self.context.ensure_writable()?;

        let mut state = self.state.lock();
        state.check_halted()?;
        if state.objects.contains_key(&id) {
            return Err(TandemError::duplicate_object(id.as_str()));
        }

        let local_seq = self.context.next_local_seq();
        let message = ContainerMessage::Attach {
            id: id.clone(),
            type_tag: type_tag.to_string(),
        };
        self.context.transmit(local_seq, message.to_value()?)?;

        let (object, inbox) =
            SharedObject::new(id.clone(), type_tag, factory.create(), self.context.clone());
        object.initialize(None, self.context.reference_sequence_number())?;
        state.objects.insert(
            id.clone(),
            ObjectSlot {
                object: object.clone(),
                inbox,
                ready: Arc::new(OnceCell::new_with(Some(()))),
                stored: None,
                base: 0,
            },
        );
        state.pending_attaches.push_back(PendingAttach {
            local_seq,
            id: id.clone(),
            type_tag: type_tag.to_string(),
        });
        info!(
            document = %self.document_id,
            object_id = %id,
            type_tag,
            "Data object created"
        );
        Ok(object)
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Process every message delivered so far. Returns the number of
    /// sequenced operations applied.
    pub async fn process_incoming(&self) -> Result<usize> {
        let mut inbound = self.inbound.lock().await;
        let Some(receiver) = inbound.as_mut() else {
            return Err(TandemError::disconnected("container is not connected"));
        };

        let mut processed = 0;
        let mut closed = false;
        loop {
            match receiver.try_recv() {
                Ok(message) => processed += self.handle(message)?,
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    closed = true;
                    break;
                }
            }
        }
        drop(inbound);

        if processed > 0 {
            self.report_progress().await?;
        }
        if closed {
            warn!(document = %self.document_id, "Delivery stream closed");
            return Err(TandemError::disconnected("delivery stream closed"));
        }
        Ok(processed)
    }

    /// Wait until every operation up to `sequence_number` has been applied
    pub async fn process_until(&self, sequence_number: SequenceNumber) -> Result<usize> {
        let mut processed = 0;
        let mut inbound = self.inbound.lock().await;
        while self.sequence_number() < sequence_number {
            let Some(receiver) = inbound.as_mut() else {
                return Err(TandemError::disconnected("container is not connected"));
            };
            let Some(message) = receiver.recv().await else {
                return Err(TandemError::disconnected("delivery stream closed"));
            };
            processed += self.handle(message)?;
        }
        drop(inbound);

        if processed > 0 {
            self.report_progress().await?;
        }
        Ok(processed)
    }

    async fn report_progress(&self) -> Result<()> {
        let Some(client) = self.context.client_id() else {
            return Ok(());
        };
        self.service
            .update_reference(&client, self.sequence_number())
            .await
    }

    fn handle(&self, message: InboundMessage) -> Result<usize> {
        let mut state = self.state.lock();
        state.check_halted()?;
        match message {
            InboundMessage::Operation(op) => self.admit(&mut state, op),
            InboundMessage::Content(fragment) => {
                state.log.insert_content(fragment)?;
                Ok(0)
            }
            InboundMessage::Signal(signal) => {
                self.record_signal(&mut state, signal);
                Ok(0)
            }
        }
    }

    fn record_signal(&self, state: &mut ContainerState, signal: Signal) {
        if state.signals.len() >= self.config.protocol.signal_buffer {
            state.signals.pop_front();
            warn!(document = %self.document_id, "Signal buffer full, dropping oldest");
        }
        state.signals.push_back(signal);
    }

    fn admit(&self, state: &mut ContainerState, op: Operation) -> Result<usize> {
        let admitted = match state.log.admit(op) {
            Ok(admitted) => admitted,
            Err(err) => return Err(self.halt(state, err)),
        };
        let Some(op) = admitted else {
            return Ok(0);
        };
        state
            .client_progress
            .insert(op.client_id.clone(), op.client_sequence_number);
        self.context
            .observe(op.sequence_number, op.minimum_sequence_number);
        self.dispatch(state, op)?;
        Ok(1)
    }

    fn halt(&self, state: &mut ContainerState, err: TandemError) -> TandemError {
        tracing::error!(document = %self.document_id, error = %err, "Container halted");
        state.halted = Some(err.clone());
        err
    }

    fn dispatch(&self, state: &mut ContainerState, mut op: Operation) -> Result<()> {
        op.local = self.context.is_own_client(&op.client_id);
        let message = match ContainerMessage::from_value(op.contents.clone()) {
            Ok(message) => message,
            Err(err) => {
                let err = TandemError::protocol_order(format!(
                    "uninterpretable container message at {}: {err}",
                    op.sequence_number
                ));
                return Err(self.halt(state, err));
            }
        };

        match message {
            ContainerMessage::Attach { id, type_tag } => {
                let result = self.apply_attach(state, &op, id, type_tag);
                result.map_err(|err| self.halt(state, err))
            }
            ContainerMessage::Operation { address, contents } => {
                let Some(slot) = state.objects.get(&address) else {
                    let err = TandemError::protocol_order(format!(
                        "operation {} addressed to unknown object {address}",
                        op.sequence_number
                    ));
                    return Err(self.halt(state, err));
                };
                if slot.object.halted().is_some() {
                    debug!(
                        object_id = %address,
                        sequence_number = op.sequence_number,
                        "Dropping operation for halted object"
                    );
                    return Ok(());
                }
                op.contents = contents;
                if slot.inbox.send(op).is_err() {
                    return Err(TandemError::invalid_state(format!(
                        "inbox of object {address} is closed"
                    )));
                }
                slot.object.drain_inbox().map(|_| ())
            }
        }
    }

    fn apply_attach(
        &self,
        state: &mut ContainerState,
        op: &Operation,
        id: ObjectId,
        type_tag: String,
    ) -> Result<()> {
        if op.local {
            let matches = state
                .pending_attaches
                .front()
                .is_some_and(|pending| pending.id == id && pending.type_tag == type_tag);
            if !matches {
                return Err(TandemError::protocol_order(format!(
                    "attach echo for {id} does not match the pending queue"
                )));
            }
            state.pending_attaches.pop_front();
            state.order.push(id);
            return Ok(());
        }

        // Concurrent creation of one id by two clients
        if state.objects.contains_key(&id) {
            return Err(TandemError::duplicate_object(id.as_str()));
        }
        let model = self.registry.factory(&type_tag)?.create();
        let (object, inbox) =
            SharedObject::new(id.clone(), type_tag.as_str(), model, self.context.clone());
        object.initialize(None, op.sequence_number)?;
        state.objects.insert(
            id.clone(),
            ObjectSlot {
                object,
                inbox,
                ready: Arc::new(OnceCell::new_with(Some(()))),
                stored: None,
                base: op.sequence_number,
            },
        );
        state.order.push(id.clone());
        info!(
            document = %self.document_id,
            object_id = %id,
            type_tag = %type_tag,
            sequence_number = op.sequence_number,
            "Remote data object attached"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Transmit every queued local submission. Oversized contents are
    /// uploaded as fragments first. Returns the number of operations sent.
    pub async fn flush(&self) -> Result<usize> {
        let mut outbound = self.outbound.lock().await;
        let mut batch = Vec::new();
        while let Ok(submission) = outbound.try_recv() {
            batch.push(submission);
        }
        let Some(client) = self.context.client_id() else {
            return Ok(0);
        };
        // Stamped for an ended epoch; reconnect restamps them
        batch.retain(|submission| submission.client_id == client);
        if batch.is_empty() {
            return Ok(0);
        }

        let max_message_size = self.state.lock().max_message_size;
        let mut fragments = Vec::new();
        let mut messages = Vec::with_capacity(batch.len());
        for submission in batch {
            let detached = exceeds_limit(&submission.contents, max_message_size)?;
            if detached {
                fragments.extend(split_contents(
                    &client,
                    submission.client_sequence_number,
                    &submission.contents,
                    max_message_size,
                )?);
            }
            messages.push(DocumentMessage {
                client_sequence_number: submission.client_sequence_number,
                reference_sequence_number: submission.reference_sequence_number,
                contents: if detached {
                    Value::Null
                } else {
                    submission.contents
                },
                detached_contents: detached,
            });
        }

        if !fragments.is_empty() {
            self.service.submit_content(&client, fragments).await?;
        }
        let count = messages.len();
        let ack = self.service.submit(&client, messages).await?;
        debug!(
            client_id = %client,
            count,
            sequence_number = ack.sequence_number,
            "Submitted local operations"
        );
        Ok(count)
    }

    /// Broadcast an unsequenced signal
    pub async fn submit_signal(&self, contents: Value) -> Result<()> {
        let client = self
            .context
            .client_id()
            .ok_or_else(|| TandemError::disconnected("container is not connected"))?;
        self.service.submit_signal(&client, contents).await
    }

    // ------------------------------------------------------------------
    // Connection epochs
    // ------------------------------------------------------------------

    /// End the current connection epoch. Pending local operations are kept.
    pub async fn disconnect(&self) -> Result<()> {
        let Some(client) = self.context.client_id() else {
            return Ok(());
        };
        self.context.disconnect();
        *self.inbound.lock().await = None;
        let mut outbound = self.outbound.lock().await;
        while outbound.try_recv().is_ok() {}
        drop(outbound);

        info!(document = %self.document_id, client_id = %client, "Container disconnected");
        self.service.disconnect(&client).await
    }

    /// Start a new connection epoch: process the new backlog, then resend
    /// every still-pending local operation in original submission order.
    pub async fn reconnect(&self) -> Result<usize> {
        self.disconnect().await?;
        let connection = self
            .service
            .connect(
                &self.tenant_id,
                &self.document_id,
                &self.token,
                self.descriptor.clone(),
            )
            .await?;
        // A poisoned object must not hold back edits to healthy ones
        let object_error = self.attach_connection(connection).await?;

        let mut resends = self.pending_resends();
        resends.sort_by_key(|(local_seq, _)| *local_seq);
        let count = resends.len();
        for (local_seq, resend) in resends {
            match resend {
                Resend::Attach(id, type_tag) => {
                    let message = ContainerMessage::Attach { id, type_tag };
                    self.context.transmit(local_seq, message.to_value()?)?;
                }
                Resend::Object(object) => object.resend(local_seq)?,
            }
        }
        info!(
            document = %self.document_id,
            client_id = ?self.context.client_id(),
            resent = count,
            "Container reconnected"
        );
        self.flush().await?;
        match object_error {
            Some(err) => {
                warn!(
                    document = %self.document_id,
                    error = %err,
                    "Reconnected with a halted data object"
                );
                Err(err)
            }
            None => Ok(count),
        }
    }

    fn pending_resends(&self) -> Vec<(u64, Resend)> {
        let state = self.state.lock();
        let attaches = state.pending_attaches.iter().map(|pending| {
            (
                pending.local_seq,
                Resend::Attach(pending.id.clone(), pending.type_tag.clone()),
            )
        });
        let objects = state
            .objects
            .values()
            .filter(|slot| slot.object.halted().is_none())
            .flat_map(|slot| {
                slot.object
                    .pending_local_seqs()
                    .into_iter()
                    .map(move |local_seq| (local_seq, Resend::Object(slot.object.clone())))
            });
        attaches.chain(objects).collect()
    }

    // ------------------------------------------------------------------
    // Summaries
    // ------------------------------------------------------------------

    /// Store a snapshot of every data object at the last processed sequence
    /// number and acknowledge it to the ordering service.
    ///
    /// Refused with `InvalidState` while local operations are pending: a
    /// snapshot holds sequenced state only.
    pub async fn summarize(&self) -> Result<SnapshotManifest> {
        for id in self.object_ids() {
            self.get_data_object(&id).await?;
        }
        let (tree, attributes) = self.build_snapshot()?;
        let manifest = self
            .store
            .write(&self.tenant_id, &self.document_id, &tree)
            .await?;
        self.service
            .acknowledge_snapshot(
                &self.tenant_id,
                &self.document_id,
                attributes.sequence_number,
            )
            .await?;
        self.state.lock().summarized_at = attributes.sequence_number;
        info!(
            document = %self.document_id,
            sequence_number = attributes.sequence_number,
            minimum_sequence_number = attributes.minimum_sequence_number,
            objects = self.object_ids().len(),
            "Container summarized"
        );
        Ok(manifest)
    }

    fn build_snapshot(&self) -> Result<(SnapshotTree, DocumentAttributes)> {
        let state = self.state.lock();
        state.check_halted()?;
        if !state.pending_attaches.is_empty() {
            return Err(TandemError::invalid_state(format!(
                "{} data objects are not yet attached",
                state.pending_attaches.len()
            )));
        }

        let attributes = DocumentAttributes {
            sequence_number: state.log.last_processed_sequence_number(),
            minimum_sequence_number: state.log.minimum_sequence_number(),
        };
        let mut tree = SnapshotTree::new();
        attributes.write_to(&mut tree)?;

        let mut entries = Vec::with_capacity(state.order.len());
        for id in &state.order {
            let slot = state
                .objects
                .get(id)
                .ok_or_else(|| TandemError::not_found(format!("data object {id}")))?;
            tree.insert_tree(id.as_str(), slot.object.snapshot()?)?;
            entries.push(ObjectEntry {
                id: id.clone(),
                type_tag: slot.object.type_tag().to_string(),
            });
        }
        tree.insert_blob(OBJECTS_ENTRY, SnapshotBlob::json(&entries)?)?;
        tree.insert_blob(CLIENTS_ENTRY, SnapshotBlob::json(&state.client_progress)?)?;
        Ok((tree, attributes))
    }
}

/// Head a client must have reached for `session`'s backlog to take it the
/// rest of the way
fn backlog_base(session: &Session) -> SequenceNumber {
    session
        .backlog_operations
        .first()
        .map_or(session.sequence_number, |op| {
            op.sequence_number.saturating_sub(1)
        })
}

fn read_client_progress(tree: &SnapshotTree) -> Result<BTreeMap<ClientId, u64>> {
    match tree.blob(CLIENTS_ENTRY) {
        Some(blob) => blob.to_json(),
        None => Ok(BTreeMap::new()),
    }
}
