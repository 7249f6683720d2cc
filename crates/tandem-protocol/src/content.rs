//! Detached operation contents
//!
//! Contents whose JSON form exceeds the session's `max_message_size` are sent
//! as a run of [`ContentFragment`]s ahead of an operation whose `contents` is
//! `Null`. Receivers buffer fragments in a [`ContentCache`] keyed by
//! `(client_id, client_sequence_number)` and rejoin them when the operation
//! arrives.

use crate::messages::ContentFragment;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tandem_core::{ClientId, Result, TandemError};

/// Whether `contents` must travel detached
pub fn exceeds_limit(contents: &Value, max_message_size: usize) -> Result<bool> {
    Ok(serde_json::to_vec(contents)?.len() > max_message_size)
}

/// Split serialized `contents` into fragments of at most `max_message_size`
/// bytes, cutting only on character boundaries
pub fn split_contents(
    client_id: &ClientId,
    client_sequence_number: u64,
    contents: &Value,
    max_message_size: usize,
) -> Result<Vec<ContentFragment>> {
    if max_message_size == 0 {
        return Err(TandemError::configuration("max_message_size must be non-zero"));
    }
    let serialized = serde_json::to_string(contents)?;
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < serialized.len() {
        let mut end = (start + max_message_size).min(serialized.len());
        while !serialized.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            // A single character wider than the limit still has to go out
            end = start
                + serialized[start..]
                    .chars()
                    .next()
                    .map_or(1, char::len_utf8);
        }
        chunks.push(serialized[start..end].to_string());
        start = end;
    }

    let chunk_count = u32::try_from(chunks.len())
        .map_err(|_| TandemError::invalid_state("operation contents too large to fragment"))?;
    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(index, data)| ContentFragment {
            client_id: client_id.clone(),
            client_sequence_number,
            chunk_index: index as u32,
            chunk_count,
            data,
        })
        .collect())
}

#[derive(Debug, Default)]
struct PartialContent {
    chunk_count: u32,
    chunks: BTreeMap<u32, String>,
}

/// Buffer of fragments awaiting their operation
#[derive(Debug, Default)]
pub struct ContentCache {
    pending: HashMap<(ClientId, u64), PartialContent>,
}

impl ContentCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a fragment
    pub fn insert(&mut self, fragment: ContentFragment) -> Result<()> {
        if fragment.chunk_index >= fragment.chunk_count {
            return Err(TandemError::protocol_order(format!(
                "fragment {} of {} from {}",
                fragment.chunk_index, fragment.chunk_count, fragment.client_id
            )));
        }
        let key = (fragment.client_id, fragment.client_sequence_number);
        let partial = self.pending.entry(key).or_insert_with(|| PartialContent {
            chunk_count: fragment.chunk_count,
            chunks: BTreeMap::new(),
        });
        if partial.chunk_count != fragment.chunk_count {
            return Err(TandemError::protocol_order(
                "fragments disagree on chunk count",
            ));
        }
        partial.chunks.insert(fragment.chunk_index, fragment.data);
        Ok(())
    }

    /// Remove and decode the contents for an operation.
    ///
    /// `Ok(None)` when some fragments have not arrived yet.
    pub fn take(&mut self, client_id: &ClientId, client_sequence_number: u64) -> Result<Option<Value>> {
        let key = (client_id.clone(), client_sequence_number);
        let complete = self
            .pending
            .get(&key)
            .is_some_and(|p| p.chunks.len() == p.chunk_count as usize);
        if !complete {
            return Ok(None);
        }
        let Some(partial) = self.pending.remove(&key) else {
            return Ok(None);
        };
        let joined: String = partial.chunks.into_values().collect();
        Ok(Some(serde_json::from_str(&joined)?))
    }

    /// Number of operations with buffered fragments
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
