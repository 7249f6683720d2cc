//! Replay log compaction
//!
//! The ordering service keeps every sequenced operation a joining client might
//! still need. Once a snapshot covers a prefix of history and every connected
//! client has observed it (the watermark), that prefix is retired.

use std::collections::VecDeque;
use tandem_core::{Result, SequenceNumber, TandemError};

/// Anything with a position in the document's total order
pub trait Sequenced {
    /// Ordering-service assigned sequence number
    fn sequence_number(&self) -> SequenceNumber;
}

/// Ordered history with a compaction horizon
///
/// Entries are strictly increasing by sequence number. Everything at or below
/// `horizon` has been discarded.
#[derive(Debug, Clone)]
pub struct ReplayLog<T> {
    entries: VecDeque<T>,
    horizon: SequenceNumber,
}

impl<T> Default for ReplayLog<T> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
            horizon: 0,
        }
    }
}

impl<T: Sequenced + Clone> ReplayLog<T> {
    /// Empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next entry. Sequence numbers must strictly increase and
    /// lie above the horizon.
    pub fn append(&mut self, entry: T) -> Result<()> {
        let seq = entry.sequence_number();
        let floor = self.head_sequence_number();
        if seq <= floor {
            return Err(TandemError::protocol_order(format!(
                "replay log append of {seq} at or below {floor}"
            )));
        }
        self.entries.push_back(entry);
        Ok(())
    }

    /// Entries strictly after `from`.
    ///
    /// Fails with `NotFound` if any of them were already compacted away.
    pub fn since(&self, from: SequenceNumber) -> Result<Vec<T>> {
        if from < self.horizon {
            return Err(TandemError::not_found(format!(
                "history after {from} was compacted up to {}",
                self.horizon
            )));
        }
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.sequence_number() > from)
            .cloned()
            .collect())
    }

    /// Discard entries at or below `horizon`, returning how many were removed.
    /// The horizon never moves backwards.
    pub fn compact(&mut self, horizon: SequenceNumber) -> usize {
        if horizon <= self.horizon {
            return 0;
        }
        let mut removed = 0;
        while self
            .entries
            .front()
            .is_some_and(|entry| entry.sequence_number() <= horizon)
        {
            self.entries.pop_front();
            removed += 1;
        }
        self.horizon = horizon;
        removed
    }

    /// Highest discarded sequence number
    pub fn horizon(&self) -> SequenceNumber {
        self.horizon
    }

    /// Highest sequence number held or discarded
    pub fn head_sequence_number(&self) -> SequenceNumber {
        self.entries
            .back()
            .map_or(self.horizon, Sequenced::sequence_number)
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is retained
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Retained entries in order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }
}
