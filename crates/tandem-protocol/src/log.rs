//! Client-side inbound operation log
//!
//! Every sequenced operation passes through [`OperationLog::admit`] before any
//! shared object sees it. The log enforces the total order: sequence numbers
//! must arrive as exactly `last + 1`. Anything at or below `last` is a replay
//! (a backlog overlapping operations already processed before a reconnect) and
//! is skipped; anything further ahead is a gap and is fatal.

use crate::content::ContentCache;
use crate::messages::{ContentFragment, Operation};
use tandem_core::{Result, SequenceNumber, TandemError};

/// Ordering guard and content rejoiner for one client's delivery stream
#[derive(Debug, Default)]
pub struct OperationLog {
    last_processed: SequenceNumber,
    minimum_sequence_number: SequenceNumber,
    content: ContentCache,
}

impl OperationLog {
    /// Log that has processed everything up to `start` (the snapshot point)
    pub fn new(start: SequenceNumber, minimum_sequence_number: SequenceNumber) -> Self {
        Self {
            last_processed: start,
            minimum_sequence_number,
            content: ContentCache::new(),
        }
    }

    /// Buffer detached contents
    pub fn insert_content(&mut self, fragment: ContentFragment) -> Result<()> {
        self.content.insert(fragment)
    }

    /// Validate ordering and rejoin detached contents.
    ///
    /// Returns `Ok(None)` for an already processed operation.
    pub fn admit(&mut self, mut op: Operation) -> Result<Option<Operation>> {
        if op.sequence_number <= self.last_processed {
            tracing::trace!(
                sequence_number = op.sequence_number,
                last_processed = self.last_processed,
                "Skipping already processed operation"
            );
            return Ok(None);
        }
        let expected = self.last_processed + 1;
        if op.sequence_number != expected {
            return Err(TandemError::protocol_order(format!(
                "expected sequence number {expected}, received {}",
                op.sequence_number
            )));
        }
        if op.minimum_sequence_number < self.minimum_sequence_number {
            return Err(TandemError::protocol_order(format!(
                "watermark regressed from {} to {} at {}",
                self.minimum_sequence_number, op.minimum_sequence_number, op.sequence_number
            )));
        }
        if op.detached_contents {
            let contents = self
                .content
                .take(&op.client_id, op.client_sequence_number)?
                .ok_or_else(|| {
                    TandemError::protocol_order(format!(
                        "contents for {}#{} not received before operation {}",
                        op.client_id, op.client_sequence_number, op.sequence_number
                    ))
                })?;
            op.contents = contents;
            op.detached_contents = false;
        }

        self.last_processed = op.sequence_number;
        self.minimum_sequence_number = op.minimum_sequence_number;
        Ok(Some(op))
    }

    /// Last sequence number handed out by `admit`
    pub fn last_processed_sequence_number(&self) -> SequenceNumber {
        self.last_processed
    }

    /// Watermark carried by the last admitted operation
    pub fn minimum_sequence_number(&self) -> SequenceNumber {
        self.minimum_sequence_number
    }
}
