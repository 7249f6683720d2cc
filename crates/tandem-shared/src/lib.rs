//! # Tandem Shared - Shared Object State Machine
//!
//! Generic optimistic-apply / remote-apply lifecycle reused by every
//! replicated data type, and the built-in types themselves.
//!
//! - [`SharedObject`]: `Uninitialized -> Loading -> Ready`, pending queue,
//!   echo detection, retransmission on reconnect
//! - [`SharedModel`]: capability interface a data type implements
//! - [`RuntimeContext`]: explicit per-document connection state handed to
//!   every object
//! - [`SharedMap`], [`SharedSequence`], [`Ink`]: built-in data types

#![forbid(unsafe_code)]

pub mod context;
pub mod envelope;
pub mod ink;
pub mod map;
pub mod model;
pub mod object;
pub mod sequence;

pub use context::{RuntimeContext, Submission};
pub use envelope::ContainerMessage;
pub use ink::{Ink, InkModel, InkPoint, Pen, Stroke, INK_TYPE};
pub use map::{MapModel, SharedMap, MAP_TYPE};
pub use model::{ObjectHandle, SharedModel, HEADER_ENTRY};
pub use object::{ObjectState, SharedObject};
pub use sequence::{SequenceModel, SharedSequence, SEQUENCE_TYPE};
