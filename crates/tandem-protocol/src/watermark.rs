//! Minimum sequence number tracking
//!
//! The watermark is the lowest reference sequence number across connected
//! clients. It only moves forward: a client joining with an old reference
//! cannot pull it back, because everything below it may already be compacted.

use std::collections::BTreeMap;
use tandem_core::{ClientId, Result, SequenceNumber, TandemError};

/// Per-document watermark state held by the ordering service
#[derive(Debug, Clone, Default)]
pub struct WatermarkTracker {
    references: BTreeMap<ClientId, SequenceNumber>,
    minimum: SequenceNumber,
}

impl WatermarkTracker {
    /// Tracker with nothing observed
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a client that has observed up to `reference`
    pub fn join(&mut self, client: ClientId, reference: SequenceNumber) {
        self.references
            .insert(client, reference.max(self.minimum));
    }

    /// Stop tracking a client
    pub fn leave(&mut self, client: &ClientId) -> bool {
        self.references.remove(client).is_some()
    }

    /// Record that `client` has processed everything up to `reference`.
    ///
    /// References never move backwards; a stale update is ignored.
    pub fn update(&mut self, client: &ClientId, reference: SequenceNumber) -> Result<()> {
        let current = self.references.get_mut(client).ok_or_else(|| {
            TandemError::not_found(format!("client {client} is not connected"))
        })?;
        *current = (*current).max(reference);
        Ok(())
    }

    /// Recompute the watermark given the current head of the total order.
    ///
    /// With no connected clients every sequenced operation is trivially
    /// observed, so the watermark catches up to `head`.
    pub fn advance(&mut self, head: SequenceNumber) -> SequenceNumber {
        let candidate = self
            .references
            .values()
            .copied()
            .min()
            .unwrap_or(head)
            .min(head);
        self.minimum = self.minimum.max(candidate);
        self.minimum
    }

    /// Current watermark
    pub fn minimum(&self) -> SequenceNumber {
        self.minimum
    }

    /// Number of tracked clients
    pub fn client_count(&self) -> usize {
        self.references.len()
    }
}
