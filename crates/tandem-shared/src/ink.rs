//! Replicated freehand ink layer
//!
//! Strokes are kept in sequence order. Local strokes and points are drawn
//! immediately and stay at the tail until sequenced, so remote strokes and
//! points are slotted in before them. A pending local clear hides all remote
//! activity sequenced before it.

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

/// Registry type tag of [`Ink`]
pub const INK_TYPE: &str = "tandem/ink";

/// Pen a stroke is drawn with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pen {
    /// CSS-style color
    pub color: String,
    /// Line thickness in pixels
    pub thickness: f64,
}

/// One stylus sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InkPoint {
    /// Horizontal position
    pub x: f64,
    /// Vertical position
    pub y: f64,
    /// Stylus pressure in `0.0..=1.0`
    pub pressure: f64,
}

/// A stroke and the points drawn so far
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    /// Stroke id
    pub id: String,
    /// Pen used
    pub pen: Pen,
    /// Points in drawing order
    pub points: Vec<InkPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
enum InkOp {
    CreateStroke { id: String, pen: Pen },
    Stylus { id: String, point: InkPoint },
    Clear,
}

#[derive(Debug, Clone, PartialEq)]
struct StrokeEntry {
    stroke: Stroke,
    pending: bool,
    pending_points: usize,
}

/// State of an [`Ink`] layer
#[derive(Debug, Default, PartialEq)]
pub struct InkModel {
    strokes: Vec<StrokeEntry>,
    pending_clears: usize,
}

impl InkModel {
    /// Strokes in drawing order
    pub fn strokes(&self) -> Vec<Stroke> {
        self.strokes.iter().map(|entry| entry.stroke.clone()).collect()
    }

    /// Stroke by id
    pub fn stroke(&self, id: &str) -> Option<&Stroke> {
        self.entry(id).map(|entry| &entry.stroke)
    }

    fn entry(&self, id: &str) -> Option<&StrokeEntry> {
        self.strokes.iter().find(|entry| entry.stroke.id == id)
    }

    fn entry_mut(&mut self, id: &str) -> Option<&mut StrokeEntry> {
        self.strokes.iter_mut().find(|entry| entry.stroke.id == id)
    }
}

impl SharedModel for InkModel {
    fn apply_local(&mut self, contents: &Value) -> Result<()> {
        match decode_op("ink", contents)? {
            InkOp::CreateStroke { id, pen } => self.strokes.push(StrokeEntry {
                stroke: Stroke {
                    id,
                    pen,
                    points: Vec::new(),
                },
                pending: true,
                pending_points: 0,
            }),
            InkOp::Stylus { id, point } => {
                let entry = self.entry_mut(&id).ok_or_else(|| {
                    TandemError::not_found(format!("stroke {id} does not exist"))
                })?;
                entry.stroke.points.push(point);
                entry.pending_points += 1;
            }
            InkOp::Clear => {
                self.strokes.clear();
                self.pending_clears += 1;
            }
        }
        Ok(())
    }

    fn apply_remote(&mut self, contents: &Value, _operation: &Operation) -> Result<()> {
        let op: InkOp = decode_op("ink", contents)?;
        if self.pending_clears > 0 {
            return Ok(());
        }
        match op {
            InkOp::CreateStroke { id, pen } => {
                let at = self
                    .strokes
                    .iter()
                    .position(|entry| entry.pending)
                    .unwrap_or(self.strokes.len());
                self.strokes.insert(
                    at,
                    StrokeEntry {
                        stroke: Stroke {
                            id,
                            pen,
                            points: Vec::new(),
                        },
                        pending: false,
                        pending_points: 0,
                    },
                );
            }
            InkOp::Stylus { id, point } => {
                // The stroke may have been cleared by an earlier operation
                if let Some(entry) = self.entry_mut(&id) {
                    let at = entry.stroke.points.len().saturating_sub(entry.pending_points);
                    entry.stroke.points.insert(at, point);
                }
            }
            InkOp::Clear => self.strokes.retain(|entry| entry.pending),
        }
        Ok(())
    }

    fn ack_local(&mut self, contents: &Value) -> Result<()> {
        match decode_op("ink", contents)? {
            InkOp::CreateStroke { id, .. } => {
                if let Some(entry) = self.entry_mut(&id) {
                    entry.pending = false;
                }
            }
            InkOp::Stylus { id, .. } => {
                if let Some(entry) = self.entry_mut(&id) {
                    entry.pending_points = entry.pending_points.saturating_sub(1);
                }
            }
            InkOp::Clear => self.pending_clears = self.pending_clears.saturating_sub(1),
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<SnapshotTree> {
        let mut tree = SnapshotTree::new();
        tree.insert_blob(HEADER_ENTRY, SnapshotBlob::json(&self.strokes())?)?;
        Ok(tree)
    }

    fn load(&mut self, tree: &SnapshotTree) -> Result<()> {
        let strokes: Vec<Stroke> = tree.require_blob(HEADER_ENTRY)?.to_json()?;
        self.strokes = strokes
            .into_iter()
            .map(|stroke| StrokeEntry {
                stroke,
                pending: false,
                pending_points: 0,
            })
            .collect();
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

/// Handle to a replicated ink layer
#[derive(Debug, Clone)]
pub struct Ink {
    object: Arc<SharedObject>,
}

impl Ink {
    /// Start a stroke, returning its id
    pub fn create_stroke(&self, pen: Pen) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let op = InkOp::CreateStroke {
            id: id.clone(),
            pen,
        };
        self.object.submit_local(serde_json::to_value(op)?)?;
        Ok(id)
    }

    /// Extend stroke `id` with `point`
    pub fn append_point(&self, id: &str, point: InkPoint) -> Result<()> {
        let op = InkOp::Stylus {
            id: id.to_string(),
            point,
        };
        self.object.submit_local(serde_json::to_value(op)?)
    }

    /// Erase every stroke
    pub fn clear(&self) -> Result<()> {
        self.object.submit_local(serde_json::to_value(InkOp::Clear)?)
    }

    /// Strokes in drawing order
    pub fn strokes(&self) -> Result<Vec<Stroke>> {
        self.object.with_model::<InkModel, _>(InkModel::strokes)
    }

    /// Stroke by id
    pub fn stroke(&self, id: &str) -> Result<Option<Stroke>> {
        self.object
            .with_model::<InkModel, _>(|model| model.stroke(id).cloned())
    }
}

impl ObjectHandle for Ink {
    type Model = InkModel;
    const TYPE_TAG: &'static str = INK_TYPE;

    fn from_object(object: Arc<SharedObject>) -> Result<Self> {
        expect_type_tag(&object, INK_TYPE)?;
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

    fn stroke(id: &str) -> Value {
        json!({"type": "createStroke", "id": id, "pen": {"color": "red", "thickness": 2.0}})
    }

    fn point(id: &str, x: f64) -> Value {
        json!({"type": "stylus", "id": id, "point": {"x": x, "y": 0.0, "pressure": 0.5}})
    }

    fn ids(model: &InkModel) -> Vec<String> {
        model.strokes().into_iter().map(|stroke| stroke.id).collect()
    }

    #[test]
    fn test_remote_strokes_precede_pending_ones() {
        let mut model = InkModel::default();
        model.apply_local(&stroke("mine")).unwrap();
        model.apply_remote(&stroke("theirs"), &meta()).unwrap();
        assert_eq!(ids(&model), vec!["theirs", "mine"]);
    }

    #[test]
    fn test_remote_points_precede_pending_points() {
        let mut model = InkModel::default();
        model.apply_remote(&stroke("s"), &meta()).unwrap();
        model.apply_local(&point("s", 2.0)).unwrap();
        model.apply_remote(&point("s", 1.0), &meta()).unwrap();
        let xs: Vec<f64> = model.stroke("s").unwrap().points.iter().map(|p| p.x).collect();
        assert_eq!(xs, vec![1.0, 2.0]);
    }

    #[test]
    fn test_pending_clear_hides_remote_activity() {
        let mut model = InkModel::default();
        model.apply_remote(&stroke("old"), &meta()).unwrap();
        model.apply_local(&json!({"type": "clear"})).unwrap();
        model.apply_remote(&stroke("late"), &meta()).unwrap();
        assert!(model.strokes().is_empty());

        model.ack_local(&json!({"type": "clear"})).unwrap();
        model.apply_remote(&stroke("after"), &meta()).unwrap();
        assert_eq!(ids(&model), vec!["after"]);
    }

    #[test]
    fn test_remote_clear_keeps_pending_strokes() {
        let mut model = InkModel::default();
        model.apply_remote(&stroke("old"), &meta()).unwrap();
        model.apply_local(&stroke("mine")).unwrap();
        model.apply_remote(&json!({"type": "clear"}), &meta()).unwrap();
        assert_eq!(ids(&model), vec!["mine"]);
        // Points for strokes that no longer exist are dropped
        model.apply_remote(&point("old", 1.0), &meta()).unwrap();
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut model = InkModel::default();
        model.apply_remote(&stroke("a"), &meta()).unwrap();
        model.apply_remote(&point("a", 3.5), &meta()).unwrap();
        let mut loaded = InkModel::default();
        loaded.load(&model.snapshot().unwrap()).unwrap();
        assert_eq!(loaded, model);
    }
}
