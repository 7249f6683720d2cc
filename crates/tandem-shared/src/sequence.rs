//! Replicated ordered sequence
//!
//! Every item carries a unique id. An insert names the item it follows
//! (`after`), a removal tombstones an item by id. Applied in sequence order,
//! an insert lands immediately after its anchor, so among concurrent inserts
//! at one anchor the later-sequenced one comes first.
//!
//! Local inserts are applied before they are sequenced. Any remote insert
//! that arrives meanwhile was sequenced earlier, so it is placed after the
//! run of pending local items that directly follows its anchor, which is
//! exactly where in-order application would have put it.

use std::any::Any;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tandem_core::{Result, TandemError};
use tandem_protocol::Operation;
use tandem_snapshot::{SnapshotBlob, SnapshotTree};
use uuid::Uuid;

use crate::model::{decode_op, expect_type_tag, ObjectHandle, SharedModel, HEADER_ENTRY};
use crate::object::SharedObject;

/// Registry type tag of [`SharedSequence`]
pub const SEQUENCE_TYPE: &str = "tandem/sequence";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
enum SequenceOp {
    Insert {
        id: String,
        after: Option<String>,
        value: Value,
    },
    Remove {
        id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SequenceItem {
    id: String,
    value: Value,
    #[serde(default)]
    removed: bool,
    #[serde(skip)]
    pending: bool,
}

/// State of a [`SharedSequence`], tombstones included
#[derive(Debug, Default, PartialEq)]
pub struct SequenceModel {
    items: Vec<SequenceItem>,
}

impl SequenceModel {
    /// Visible values in order
    pub fn values(&self) -> Vec<Value> {
        self.visible().map(|item| item.value.clone()).collect()
    }

    /// Number of visible items
    pub fn len(&self) -> usize {
        self.visible().count()
    }

    /// Whether no item is visible
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visible value at `index`
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.visible().nth(index).map(|item| &item.value)
    }

    fn visible(&self) -> impl Iterator<Item = &SequenceItem> {
        self.items.iter().filter(|item| !item.removed)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }

    fn anchor_position(&self, after: Option<&str>) -> Result<usize> {
        match after {
            None => Ok(0),
            Some(id) => self
                .position(id)
                .map(|index| index + 1)
                .ok_or_else(|| unknown_item(id)),
        }
    }

    fn insert_op(&self, index: usize, value: Value) -> Result<SequenceOp> {
        let len = self.len();
        if index > len {
            return Err(TandemError::invalid_state(format!(
                "insert index {index} beyond length {len}"
            )));
        }
        let after = match index {
            0 => None,
            _ => self.visible().nth(index - 1).map(|item| item.id.clone()),
        };
        Ok(SequenceOp::Insert {
            id: Uuid::new_v4().to_string(),
            after,
            value,
        })
    }

    fn remove_op(&self, index: usize) -> Result<SequenceOp> {
        let item = self.visible().nth(index).ok_or_else(|| {
            TandemError::invalid_state(format!(
                "remove index {index} beyond length {}",
                self.len()
            ))
        })?;
        Ok(SequenceOp::Remove {
            id: item.id.clone(),
        })
    }
}

fn unknown_item(id: &str) -> TandemError {
    TandemError::protocol_order(format!("sequence item {id} does not exist"))
}

impl SharedModel for SequenceModel {
    fn apply_local(&mut self, contents: &Value) -> Result<()> {
        match decode_op("sequence", contents)? {
            SequenceOp::Insert { id, after, value } => {
                let at = self.anchor_position(after.as_deref())?;
                self.items.insert(
                    at,
                    SequenceItem {
                        id,
                        value,
                        removed: false,
                        pending: true,
                    },
                );
            }
            SequenceOp::Remove { id } => {
                let at = self.position(&id).ok_or_else(|| unknown_item(&id))?;
                self.items[at].removed = true;
            }
        }
        Ok(())
    }

    fn apply_remote(&mut self, contents: &Value, _operation: &Operation) -> Result<()> {
        match decode_op("sequence", contents)? {
            SequenceOp::Insert { id, after, value } => {
                if self.position(&id).is_some() {
                    return Err(TandemError::protocol_order(format!(
                        "sequence item {id} inserted twice"
                    )));
                }
                let mut at = self.anchor_position(after.as_deref())?;
                while self.items.get(at).is_some_and(|item| item.pending) {
                    at += 1;
                }
                self.items.insert(
                    at,
                    SequenceItem {
                        id,
                        value,
                        removed: false,
                        pending: false,
                    },
                );
            }
            SequenceOp::Remove { id } => {
                let at = self.position(&id).ok_or_else(|| unknown_item(&id))?;
                self.items[at].removed = true;
            }
        }
        Ok(())
    }

    fn ack_local(&mut self, contents: &Value) -> Result<()> {
        if let SequenceOp::Insert { id, .. } = decode_op("sequence", contents)? {
            if let Some(at) = self.position(&id) {
                self.items[at].pending = false;
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<SnapshotTree> {
        let mut tree = SnapshotTree::new();
        tree.insert_blob(HEADER_ENTRY, SnapshotBlob::json(&self.items)?)?;
        Ok(tree)
    }

    fn load(&mut self, tree: &SnapshotTree) -> Result<()> {
        self.items = tree.require_blob(HEADER_ENTRY)?.to_json()?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Handle to a replicated sequence
#[derive(Debug, Clone)]
pub struct SharedSequence {
    object: Arc<SharedObject>,
}

impl SharedSequence {
    /// Insert `value` so it becomes visible at `index`
    pub fn insert(&self, index: usize, value: impl Serialize) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.object
            .submit_local_with::<SequenceModel, _>(|model| {
                Ok(serde_json::to_value(model.insert_op(index, value)?)?)
            })
    }

    /// Append `value`
    pub fn push(&self, value: impl Serialize) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.object
            .submit_local_with::<SequenceModel, _>(|model| {
                Ok(serde_json::to_value(model.insert_op(model.len(), value)?)?)
            })
    }

    /// Remove the visible item at `index`
    pub fn remove(&self, index: usize) -> Result<()> {
        self.object
            .submit_local_with::<SequenceModel, _>(|model| {
                Ok(serde_json::to_value(model.remove_op(index)?)?)
            })
    }

    /// Visible values in order
    pub fn items(&self) -> Result<Vec<Value>> {
        self.object.with_model::<SequenceModel, _>(SequenceModel::values)
    }

    /// Visible value at `index`
    pub fn get(&self, index: usize) -> Result<Option<Value>> {
        self.object
            .with_model::<SequenceModel, _>(|model| model.get(index).cloned())
    }

    /// Number of visible items
    pub fn len(&self) -> Result<usize> {
        self.object.with_model::<SequenceModel, _>(SequenceModel::len)
    }

    /// Whether no item is visible
    pub fn is_empty(&self) -> Result<bool> {
        self.object.with_model::<SequenceModel, _>(SequenceModel::is_empty)
    }
}

impl ObjectHandle for SharedSequence {
    type Model = SequenceModel;
    const TYPE_TAG: &'static str = SEQUENCE_TYPE;

    fn from_object(object: Arc<SharedObject>) -> Result<Self> {
        expect_type_tag(&object, SEQUENCE_TYPE)?;
        Ok(Self { object })
    }

    fn object(&self) -> &Arc<SharedObject> {
        &self.object
    }
}
