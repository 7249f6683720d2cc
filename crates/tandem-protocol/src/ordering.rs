//! Ordering service boundary
//!
//! The ordering service is the single source of truth for sequence numbers.
//! It never reorders submissions from one client relative to each other and
//! broadcasts every accepted operation to all connected clients, including
//! the one that submitted it.

use crate::messages::{ClientDescriptor, ContentFragment, DocumentMessage, SubmitAck};
use crate::session::Connection;
use async_trait::async_trait;
use serde_json::Value;
use tandem_core::{ClientId, DocumentId, Result, SequenceNumber, TenantId};

/// Contract every ordering service implementation obeys
#[async_trait]
pub trait OrderingService: Send + Sync {
    /// Create an empty document. Fails if it already exists.
    async fn create_document(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
        token: &str,
    ) -> Result<()>;

    /// Connect handshake.
    ///
    /// Fails with `Auth` for a bad token and `NotFound` for an unknown tenant
    /// or document.
    async fn connect(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
        token: &str,
        client: ClientDescriptor,
    ) -> Result<Connection>;

    /// Sequence and broadcast a batch of submissions, in order
    async fn submit(&self, client: &ClientId, messages: Vec<DocumentMessage>) -> Result<SubmitAck>;

    /// Upload and broadcast detached contents ahead of their operation
    async fn submit_content(&self, client: &ClientId, fragments: Vec<ContentFragment>)
        -> Result<()>;

    /// Broadcast an unsequenced signal
    async fn submit_signal(&self, client: &ClientId, contents: Value) -> Result<()>;

    /// Report that `client` has processed everything up to `reference`
    async fn update_reference(&self, client: &ClientId, reference: SequenceNumber) -> Result<()>;

    /// Tell the service a snapshot at `sequence_number` is durably stored
    async fn acknowledge_snapshot(
        &self,
        tenant: &TenantId,
        document: &DocumentId,
        sequence_number: SequenceNumber,
    ) -> Result<()>;

    /// End a connection epoch
    async fn disconnect(&self, client: &ClientId) -> Result<()>;
}
