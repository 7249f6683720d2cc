//! Replicated key/value map
//!
//! Last sequenced writer wins per key. While this client has an unsequenced
//! write to a key, remote writes to that key are ignored: the local write is
//! sequenced after them and will overwrite them everywhere anyway. A pending
//! local clear likewise suppresses every remote write, and a remote clear
//! spares keys with pending local writes.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tandem_core::Result;
use tandem_protocol::Operation;
use tandem_snapshot::{SnapshotBlob, SnapshotTree};

use crate::model::{decode_op, expect_type_tag, ObjectHandle, SharedModel, HEADER_ENTRY};
use crate::object::SharedObject;

/// Registry type tag of [`SharedMap`]
pub const MAP_TYPE: &str = "tandem/map";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
enum MapOp {
    Set { key: String, value: Value },
    Delete { key: String },
    Clear,
}

/// State of a [`SharedMap`]
#[derive(Debug, Default, PartialEq)]
pub struct MapModel {
    entries: BTreeMap<String, Value>,
    pending_keys: HashMap<String, usize>,
    pending_clears: usize,
}

impl MapModel {
    /// Value stored under `key`
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Keys in sorted order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of all entries
    pub fn entries(&self) -> BTreeMap<String, Value> {
        self.entries.clone()
    }

    fn apply(&mut self, op: MapOp) {
        match op {
            MapOp::Set { key, value } => {
                self.entries.insert(key, value);
            }
            MapOp::Delete { key } => {
                self.entries.remove(&key);
            }
            MapOp::Clear => self.entries.clear(),
        }
    }
}

impl SharedModel for MapModel {
    fn apply_local(&mut self, contents: &Value) -> Result<()> {
        let op: MapOp = decode_op("map", contents)?;
        match &op {
            MapOp::Set { key, .. } | MapOp::Delete { key } => {
                *self.pending_keys.entry(key.clone()).or_default() += 1;
            }
            MapOp::Clear => self.pending_clears += 1,
        }
        self.apply(op);
        Ok(())
    }

    fn apply_remote(&mut self, contents: &Value, _operation: &Operation) -> Result<()> {
        let op: MapOp = decode_op("map", contents)?;
        if self.pending_clears > 0 {
            return Ok(());
        }
        match op {
            MapOp::Set { ref key, .. } | MapOp::Delete { ref key }
                if self.pending_keys.contains_key(key) => {}
            MapOp::Clear => {
                let pending = &self.pending_keys;
                self.entries.retain(|key, _| pending.contains_key(key));
            }
            op => self.apply(op),
        }
        Ok(())
    }

    fn ack_local(&mut self, contents: &Value) -> Result<()> {
        match decode_op::<MapOp>("map", contents)? {
            MapOp::Set { key, .. } | MapOp::Delete { key } => {
                if let Some(count) = self.pending_keys.get_mut(&key) {
                    *count -= 1;
                    if *count == 0 {
                        self.pending_keys.remove(&key);
                    }
                }
            }
            MapOp::Clear => self.pending_clears = self.pending_clears.saturating_sub(1),
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<SnapshotTree> {
        let mut tree = SnapshotTree::new();
        tree.insert_blob(HEADER_ENTRY, SnapshotBlob::json(&self.entries)?)?;
        Ok(tree)
    }

    fn load(&mut self, tree: &SnapshotTree) -> Result<()> {
        self.entries = tree.require_blob(HEADER_ENTRY)?.to_json()?;
        self.pending_keys.clear();
        self.pending_clears = 0;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Handle to a replicated map
#[derive(Debug, Clone)]
pub struct SharedMap {
    object: Arc<SharedObject>,
}

impl SharedMap {
    /// Set `key` to `value`
    pub fn set(&self, key: impl Into<String>, value: impl Serialize) -> Result<()> {
        let op = MapOp::Set {
            key: key.into(),
            value: serde_json::to_value(value)?,
        };
        self.object.submit_local(serde_json::to_value(op)?)
    }

    /// Remove `key`
    pub fn delete(&self, key: impl Into<String>) -> Result<()> {
        let op = MapOp::Delete { key: key.into() };
        self.object.submit_local(serde_json::to_value(op)?)
    }

    /// Remove every key
    pub fn clear(&self) -> Result<()> {
        self.object.submit_local(serde_json::to_value(MapOp::Clear)?)
    }

    /// Value under `key`
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.object
            .with_model::<MapModel, _>(|model| model.get(key).cloned())
    }

    /// Sorted keys
    pub fn keys(&self) -> Result<Vec<String>> {
        self.object
            .with_model::<MapModel, _>(|model| model.keys().map(str::to_string).collect())
    }

    /// Number of entries
    pub fn len(&self) -> Result<usize> {
        self.object.with_model::<MapModel, _>(MapModel::len)
    }

    /// Whether the map is empty
    pub fn is_empty(&self) -> Result<bool> {
        self.object.with_model::<MapModel, _>(MapModel::is_empty)
    }

    /// All entries
    pub fn entries(&self) -> Result<BTreeMap<String, Value>> {
        self.object.with_model::<MapModel, _>(MapModel::entries)
    }
}

impl ObjectHandle for SharedMap {
    type Model = MapModel;
    const TYPE_TAG: &'static str = MAP_TYPE;

    fn from_object(object: Arc<SharedObject>) -> Result<Self> {
        expect_type_tag(&object, MAP_TYPE)?;
        Ok(Self { object })
    }

    fn object(&self) -> &Arc<SharedObject> {
        &self.object
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tandem_core::ClientId;

    fn meta() -> Operation {
        Operation {
            client_id: ClientId::new("peer"),
            sequence_number: 1,
            minimum_sequence_number: 0,
            client_sequence_number: 1,
            reference_sequence_number: 0,
            contents: Value::Null,
            detached_contents: false,
            local: false,
        }
    }

    #[test]
    fn test_remote_clear_spares_pending_keys() {
        let mut model = MapModel::default();
        model
            .apply_remote(&json!({"type": "set", "key": "a", "value": 1}), &meta())
            .unwrap();
        model
            .apply_local(&json!({"type": "set", "key": "b", "value": 2}))
            .unwrap();
        model.apply_remote(&json!({"type": "clear"}), &meta()).unwrap();

        assert_eq!(model.get("a"), None);
        assert_eq!(model.get("b"), Some(&json!(2)));
    }

    #[test]
    fn test_pending_clear_suppresses_remote_writes() {
        let mut model = MapModel::default();
        model.apply_local(&json!({"type": "clear"})).unwrap();
        model
            .apply_remote(&json!({"type": "set", "key": "a", "value": 1}), &meta())
            .unwrap();
        assert!(model.is_empty());

        model.ack_local(&json!({"type": "clear"})).unwrap();
        model
            .apply_remote(&json!({"type": "set", "key": "a", "value": 1}), &meta())
            .unwrap();
        assert_eq!(model.len(), 1);
    }

    #[test]
    fn test_ack_releases_key() {
        let mut model = MapModel::default();
        let set = json!({"type": "set", "key": "k", "value": "mine"});
        model.apply_local(&set).unwrap();
        model.apply_local(&set).unwrap();
        model.ack_local(&set).unwrap();
        model
            .apply_remote(&json!({"type": "delete", "key": "k"}), &meta())
            .unwrap();
        assert_eq!(model.get("k"), Some(&json!("mine")));

        model.ack_local(&set).unwrap();
        model
            .apply_remote(&json!({"type": "delete", "key": "k"}), &meta())
            .unwrap();
        assert_eq!(model.get("k"), None);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut model = MapModel::default();
        for (key, value) in [("x", json!(1)), ("y", json!({"nested": [1, 2]}))] {
            model
                .apply_remote(&json!({"type": "set", "key": key, "value": value}), &meta())
                .unwrap();
        }
        let tree = model.snapshot().unwrap();
        let mut loaded = MapModel::default();
        loaded.load(&tree).unwrap();
        assert_eq!(loaded, model);
    }

    #[test]
    fn test_corrupt_header_is_reported() {
        let mut tree = SnapshotTree::new();
        tree.insert_blob(HEADER_ENTRY, SnapshotBlob::text("not json"))
            .unwrap();
        let err = MapModel::default().load(&tree).unwrap_err();
        assert!(matches!(
            err,
            tandem_core::TandemError::SnapshotCorruption { .. }
        ));
    }
}
