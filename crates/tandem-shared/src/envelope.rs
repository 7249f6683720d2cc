//! Container-level message envelope
//!
//! Every operation a client submits is wrapped in a [`ContainerMessage`] so
//! the receiving container can route it: `attach` announces a new data object,
//! `operation` addresses one by id.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tandem_core::{ObjectId, Result};

/// Payload of every sequenced operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ContainerMessage {
    /// A data object was created and must be instantiated everywhere
    #[serde(rename_all = "camelCase")]
    Attach {
        /// New object's id
        id: ObjectId,
        /// Registry type tag of the object
        type_tag: String,
    },
    /// An operation addressed to one data object
    Operation {
        /// Target object
        address: ObjectId,
        /// Domain payload, opaque to the container
        contents: Value,
    },
}

impl ContainerMessage {
    /// Serialize for submission
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Parse a sequenced payload
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let attach = ContainerMessage::Attach {
            id: ObjectId::new("root"),
            type_tag: "tandem/map".to_string(),
        };
        assert_eq!(
            attach.to_value().unwrap(),
            json!({"type": "attach", "id": "root", "typeTag": "tandem/map"})
        );

        let op = ContainerMessage::from_value(json!({
            "type": "operation",
            "address": "root",
            "contents": {"type": "clear"}
        }))
        .unwrap();
        assert!(matches!(op, ContainerMessage::Operation { .. }));
    }

    #[test]
    fn test_unknown_message_rejected() {
        assert!(ContainerMessage::from_value(json!({"type": "detach"})).is_err());
    }
}
