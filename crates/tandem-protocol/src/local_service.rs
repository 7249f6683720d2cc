//! In-memory ordering service
//!
//! A complete single-process implementation of [`OrderingService`]: tenants
//! with shared-secret tokens, per-document sequencing, watermark tracking,
//! signal buffering and replay-log compaction. Delivery streams are unbounded
//! tokio channels, one per connection.

use crate::messages::{
    ClientDescriptor, ClientMode, ContentFragment, DocumentMessage, InboundMessage, Operation,
    Signal, SubmitAck,
};
use crate::ordering::OrderingService;
use crate::session::{Connection, Session};
use crate::watermark::WatermarkTracker;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tandem_core::{
    ClientId, CompactionConfig, DocumentId, ProtocolConfig, Result, SequenceNumber, TandemConfig,
    TandemError, TenantId,
};
use tandem_snapshot::ReplayLog;
use tokio::sync::mpsc;

type DocumentKey = (TenantId, DocumentId);

struct ConnectedClient {
    sender: mpsc::UnboundedSender<InboundMessage>,
    descriptor: ClientDescriptor,
    next_client_sequence_number: u64,
}

#[derive(Default)]
struct DocumentState {
    sequence_number: SequenceNumber,
    snapshot_sequence_number: SequenceNumber,
    /// Some client has connected before
    opened: bool,
    parent_branch: Option<String>,
    watermark: WatermarkTracker,
    log: ReplayLog<Operation>,
    fragments: BTreeMap<(ClientId, u64), Vec<ContentFragment>>,
    signals: VecDeque<Signal>,
    clients: HashMap<ClientId, ConnectedClient>,
}

impl DocumentState {
    fn existing(&self) -> bool {
        self.opened || self.sequence_number > 0 || self.snapshot_sequence_number > 0
    }

    /// Deliver to every connected client. Clients whose stream is gone are
    /// dropped from the session.
    fn broadcast(&mut self, message: &InboundMessage) {
        let mut dead = Vec::new();
        for (client_id, client) in &self.clients {
            if client.sender.send(message.clone()).is_err() {
                dead.push(client_id.clone());
            }
        }
        for client_id in dead {
            tracing::warn!(client_id = %client_id, "Delivery stream closed, dropping client");
            self.clients.remove(&client_id);
            self.watermark.leave(&client_id);
        }
    }

    fn compact(&mut self, config: &CompactionConfig) -> usize {
        if config.retain_below_watermark {
            return 0;
        }
        let horizon = self
            .snapshot_sequence_number
            .min(self.watermark.minimum());
        let retired: Vec<(ClientId, u64)> = self
            .log
            .iter()
            .take_while(|op| op.sequence_number <= horizon)
            .filter(|op| op.detached_contents)
            .map(|op| (op.client_id.clone(), op.client_sequence_number))
            .collect();
        for key in &retired {
            self.fragments.remove(key);
        }
        self.log.compact(horizon)
    }
}

#[derive(Default)]
struct ServiceState {
    tenants: HashMap<TenantId, String>,
    documents: HashMap<DocumentKey, DocumentState>,
    connections: HashMap<ClientId, DocumentKey>,
}

impl ServiceState {
    fn authorize(&self, tenant: &TenantId, token: &str) -> Result<()> {
        let key = self
            .tenants
            .get(tenant)
            .ok_or_else(|| TandemError::not_found(format!("tenant {tenant}")))?;
        if token.is_empty() || token != key {
            return Err(TandemError::auth(format!("token rejected for tenant {tenant}")));
        }
        Ok(())
    }

    fn document_of(&mut self, client: &ClientId) -> Result<&mut DocumentState> {
        let key = self
            .connections
            .get(client)
            .ok_or_else(|| TandemError::disconnected(format!("client {client} is not connected")))?;
        self.documents
            .get_mut(key)
            .ok_or_else(|| TandemError::not_found(format!("document {}", key.1)))
    }
}

/// Single-process ordering service
#[derive(Clone)]
pub struct LocalOrderingService {
    state: Arc<Mutex<ServiceState>>,
    protocol: ProtocolConfig,
    compaction: CompactionConfig,
}

impl Default for LocalOrderingService {
    fn default() -> Self {
        Self::new(&TandemConfig::default())
    }
}

impl LocalOrderingService {
    /// Service configured from `config`
    pub fn new(config: &TandemConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(ServiceState::default())),
            protocol: config.protocol.clone(),
            compaction: config.compaction.clone(),
        }
    }

    /// Register a tenant whose clients authenticate with `key`
    pub fn add_tenant(&self, tenant: impl Into<TenantId>, key: impl Into<String>) {
        let mut state = self.state.lock();
        state.tenants.insert(tenant.into(), key.into());
    }

    /// Fork `parent` into a new document that starts with the parent's full
    /// history. Only possible while the parent has not been compacted.
    pub fn create_branch(
        &self,
        tenant: &TenantId,
        parent: &DocumentId,
        branch: &DocumentId,
        token: &str,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.authorize(tenant, token)?;
        let branch_key = (tenant.clone(), branch.clone());
        if state.documents.contains_key(&branch_key) {
            return Err(TandemError::invalid_state(format!(
                "document {branch} already exists"
            )));
        }
        let source = state
            .documents
            .get(&(tenant.clone(), parent.clone()))
            .ok_or_else(|| TandemError::not_found(format!("document {parent}")))?;
        if source.log.horizon() > 0 {
            return Err(TandemError::invalid_state(format!(
                "document {parent} history is compacted up to {}",
                source.log.horizon()
            )));
        }
        let mut watermark = WatermarkTracker::new();
        watermark.advance(source.sequence_number);
        let forked = DocumentState {
            sequence_number: source.sequence_number,
            parent_branch: Some(parent.to_string()),
            watermark,
            log: source.log.clone(),
            fragments: source.fragments.clone(),
            ..DocumentState::default()
        };
        state.documents.insert(branch_key, forked);
        tracing::info!(tenant = %tenant, parent = %parent, branch = %branch, "Branch created");
        Ok(())
    }

    fn with_document<T>(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
        f: impl FnOnce(&DocumentState) -> T,
    ) -> Result<T> {
        let state = self.state.lock();
        let doc = state
            .documents
            .get(&(tenant.clone(), document.clone()))
            .ok_or_else(|| TandemError::not_found(format!("document {document}")))?;
        Ok(f(doc))
    }

    /// Head of the document's total order
    pub fn sequence_number(&self, tenant: &TenantId, document: &DocumentId) -> Result<SequenceNumber> {
        self.with_document(tenant, document, |doc| doc.sequence_number)
    }

    /// Current watermark of the document
    pub fn minimum_sequence_number(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
    ) -> Result<SequenceNumber> {
        self.with_document(tenant, document, |doc| doc.watermark.minimum())
    }

    /// Number of operations still held for replay
    pub fn retained_operations(&self, tenant: &TenantId, document: &DocumentId) -> Result<usize> {
        self.with_document(tenant, document, |doc| doc.log.len())
    }

    /// Number of live connections to the document
    pub fn connected_clients(&self, tenant: &TenantId, document: &DocumentId) -> Result<usize> {
        self.with_document(tenant, document, |doc| doc.clients.len())
    }
}

#[async_trait]
impl OrderingService for LocalOrderingService {
    async fn create_document(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
        token: &str,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.authorize(tenant, token)?;
        let key = (tenant.clone(), document.clone());
        if state.documents.contains_key(&key) {
            return Err(TandemError::invalid_state(format!(
                "document {document} already exists"
            )));
        }
        state.documents.insert(key, DocumentState::default());
        tracing::info!(tenant = %tenant, document = %document, "Document created");
        Ok(())
    }

    async fn connect(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
        token: &str,
        client: ClientDescriptor,
    ) -> Result<Connection> {
        let mut state = self.state.lock();
        state.authorize(tenant, token)?;
        let key = (tenant.clone(), document.clone());
        let client_id = ClientId::random();
        let doc = state
            .documents
            .get_mut(&key)
            .ok_or_else(|| TandemError::not_found(format!("document {document}")))?;

        let backlog_operations = doc.log.since(doc.snapshot_sequence_number)?;
        let backlog_content = backlog_operations
            .iter()
            .filter(|op| op.detached_contents)
            .filter_map(|op| {
                doc.fragments
                    .get(&(op.client_id.clone(), op.client_sequence_number))
            })
            .flatten()
            .cloned()
            .collect();

        if client.mode == ClientMode::Write {
            doc.watermark
                .join(client_id.clone(), doc.snapshot_sequence_number);
        }
        let minimum_sequence_number = doc.watermark.advance(doc.sequence_number);

        let (sender, inbound) = mpsc::unbounded_channel();
        let session = Session {
            tenant_id: tenant.clone(),
            document_id: document.clone(),
            client_id: client_id.clone(),
            existing: doc.existing(),
            parent_branch: doc.parent_branch.clone(),
            max_message_size: self.protocol.max_message_size,
            backlog_operations,
            backlog_content,
            backlog_signals: doc.signals.iter().cloned().collect(),
            minimum_sequence_number,
            sequence_number: doc.sequence_number,
        };
        doc.opened = true;
        doc.clients.insert(
            client_id.clone(),
            ConnectedClient {
                sender,
                descriptor: client,
                next_client_sequence_number: 1,
            },
        );
        state.connections.insert(client_id.clone(), key);

        tracing::info!(
            tenant = %tenant,
            document = %document,
            client_id = %client_id,
            existing = session.existing,
            backlog = session.backlog_operations.len(),
            "Client connected"
        );
        Ok(Connection { session, inbound })
    }

    async fn submit(&self, client: &ClientId, messages: Vec<DocumentMessage>) -> Result<SubmitAck> {
        let mut state = self.state.lock();
        let doc = state.document_of(client)?;

        let mut ack = SubmitAck {
            sequence_number: doc.sequence_number,
            minimum_sequence_number: doc.watermark.minimum(),
        };
        for message in messages {
            let connected = doc.clients.get_mut(client).ok_or_else(|| {
                TandemError::disconnected(format!("client {client} is not connected"))
            })?;
            if connected.descriptor.mode == ClientMode::Read {
                return Err(TandemError::invalid_state(format!(
                    "client {client} connected read-only"
                )));
            }
            if message.client_sequence_number != connected.next_client_sequence_number {
                return Err(TandemError::protocol_order(format!(
                    "client {client} sent client sequence number {}, expected {}",
                    message.client_sequence_number, connected.next_client_sequence_number
                )));
            }
            if message.reference_sequence_number > doc.sequence_number {
                return Err(TandemError::protocol_order(format!(
                    "client {client} references unsequenced {}",
                    message.reference_sequence_number
                )));
            }
            if message.detached_contents
                && !doc
                    .fragments
                    .contains_key(&(client.clone(), message.client_sequence_number))
            {
                return Err(TandemError::protocol_order(format!(
                    "detached contents for {client}#{} were never uploaded",
                    message.client_sequence_number
                )));
            }
            connected.next_client_sequence_number += 1;

            doc.sequence_number += 1;
            doc.watermark
                .update(client, message.reference_sequence_number)?;
            let minimum_sequence_number = doc.watermark.advance(doc.sequence_number - 1);

            let op = Operation {
                client_id: client.clone(),
                sequence_number: doc.sequence_number,
                minimum_sequence_number,
                client_sequence_number: message.client_sequence_number,
                reference_sequence_number: message.reference_sequence_number,
                contents: message.contents,
                detached_contents: message.detached_contents,
                local: false,
            };
            doc.log.append(op.clone())?;
            tracing::debug!(
                client_id = %client,
                sequence_number = op.sequence_number,
                minimum_sequence_number,
                "Operation sequenced"
            );
            doc.broadcast(&InboundMessage::Operation(op));

            ack = SubmitAck {
                sequence_number: doc.sequence_number,
                minimum_sequence_number,
            };
        }
        doc.compact(&self.compaction);
        Ok(ack)
    }

    async fn submit_content(
        &self,
        client: &ClientId,
        fragments: Vec<ContentFragment>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let doc = state.document_of(client)?;
        for fragment in fragments {
            if &fragment.client_id != client {
                return Err(TandemError::protocol_order(format!(
                    "client {client} uploaded content for {}",
                    fragment.client_id
                )));
            }
            doc.fragments
                .entry((fragment.client_id.clone(), fragment.client_sequence_number))
                .or_default()
                .push(fragment.clone());
            doc.broadcast(&InboundMessage::Content(fragment));
        }
        Ok(())
    }

    async fn submit_signal(&self, client: &ClientId, contents: Value) -> Result<()> {
        let capacity = self.protocol.signal_buffer;
        let mut state = self.state.lock();
        let doc = state.document_of(client)?;
        let signal = Signal {
            client_id: Some(client.clone()),
            contents,
        };
        if capacity > 0 {
            if doc.signals.len() >= capacity {
                doc.signals.pop_front();
            }
            doc.signals.push_back(signal.clone());
        }
        doc.broadcast(&InboundMessage::Signal(signal));
        Ok(())
    }

    async fn update_reference(&self, client: &ClientId, reference: SequenceNumber) -> Result<()> {
        let mut state = self.state.lock();
        let doc = state.document_of(client)?;
        if reference > doc.sequence_number {
            return Err(TandemError::protocol_order(format!(
                "client {client} references unsequenced {reference}"
            )));
        }
        // Readers are not part of the watermark
        if doc.watermark.update(client, reference).is_ok() {
            doc.watermark.advance(doc.sequence_number);
            doc.compact(&self.compaction);
        }
        Ok(())
    }

    async fn acknowledge_snapshot(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
        sequence_number: SequenceNumber,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let doc = state
            .documents
            .get_mut(&(tenant.clone(), document.clone()))
            .ok_or_else(|| TandemError::not_found(format!("document {document}")))?;
        if sequence_number > doc.sequence_number {
            return Err(TandemError::invalid_state(format!(
                "snapshot at {sequence_number} is ahead of head {}",
                doc.sequence_number
            )));
        }
        doc.snapshot_sequence_number = doc.snapshot_sequence_number.max(sequence_number);
        let removed = doc.compact(&self.compaction);
        tracing::info!(
            tenant = %tenant,
            document = %document,
            sequence_number,
            compacted = removed,
            "Snapshot acknowledged"
        );
        Ok(())
    }

    /// Unknown clients are treated as already disconnected.
    async fn disconnect(&self, client: &ClientId) -> Result<()> {
        let mut state = self.state.lock();
        let Some(key) = state.connections.remove(client) else {
            tracing::debug!(client_id = %client, "Disconnect for unknown client");
            return Ok(());
        };
        if let Some(doc) = state.documents.get_mut(&key) {
            doc.clients.remove(client);
            doc.watermark.leave(client);
            doc.watermark.advance(doc.sequence_number);
            doc.compact(&self.compaction);
        }
        tracing::info!(client_id = %client, document = %key.1, "Client disconnected");
        Ok(())
    }
}
