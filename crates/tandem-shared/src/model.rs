//! Capability interface implemented by every replicated data type

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use serde_json::Value;
use tandem_core::{Result, TandemError};
use tandem_protocol::Operation;
use tandem_snapshot::SnapshotTree;

use crate::object::SharedObject;

/// Name of the blob every built-in model stores its state under
pub const HEADER_ENTRY: &str = "header";

/// Domain logic of a replicated data type.
///
/// The [`SharedObject`] state machine owns ordering, echo detection and
/// retransmission; a model only interprets payloads. Implementations must be
/// deterministic: two models fed the same remote operations in the same order
/// end in the same state.
pub trait SharedModel: Any + Debug + Send + Sync {
    /// Apply an operation this client just originated, before it is sequenced
    fn apply_local(&mut self, contents: &Value) -> Result<()>;

    /// Apply a sequenced operation originated by another client.
    ///
    /// An error here poisons the owning object.
    fn apply_remote(&mut self, contents: &Value, operation: &Operation) -> Result<()>;

    /// A locally originated operation came back sequenced. State already
    /// reflects it; only pending bookkeeping changes.
    fn ack_local(&mut self, contents: &Value) -> Result<()>;

    /// Serialize sequenced state
    fn snapshot(&self) -> Result<SnapshotTree>;

    /// Replace state with a stored snapshot
    fn load(&mut self, tree: &SnapshotTree) -> Result<()>;

    /// Downcast support
    fn as_any(&self) -> &dyn Any;

    /// Mutable downcast support
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Typed view over a [`SharedObject`] whose model is `Self::Model`
pub trait ObjectHandle: Sized {
    /// Model driving the object
    type Model: SharedModel + Default;

    /// Registry type tag
    const TYPE_TAG: &'static str;

    /// Wrap an object, which must carry [`Self::TYPE_TAG`]
    fn from_object(object: Arc<SharedObject>) -> Result<Self>;

    /// Underlying state machine
    fn object(&self) -> &Arc<SharedObject>;
}

/// Shared type check for [`ObjectHandle::from_object`]
pub(crate) fn expect_type_tag(object: &SharedObject, type_tag: &str) -> Result<()> {
    if object.type_tag() != type_tag {
        return Err(TandemError::invalid_state(format!(
            "object {} has type {}, not {}",
            object.id(),
            object.type_tag(),
            type_tag
        )));
    }
    Ok(())
}

/// Parse a payload into a model's operation type, reporting the object kind
pub(crate) fn decode_op<T: serde::de::DeserializeOwned>(kind: &str, contents: &Value) -> Result<T> {
    serde_json::from_value(contents.clone()).map_err(|err| {
        TandemError::protocol_order(format!("uninterpretable {kind} operation: {err}"))
    })
}
