//! # Tandem Container - Registry & Creation Protocol
//!
//! The addressable collection of data objects composing one collaborative
//! document.
//!
//! - [`Registry`]: immutable `typeTag -> factory` map plus the root objects
//!   created the first time a container is created
//! - [`Loader`]: per-client context that creates or loads [`Container`]s
//! - [`Container`]: routes sequenced operations to data objects, creates and
//!   resolves them by request path, summarizes and reconnects
//!
//! ## Usage
//!
//! ```rust,ignore
//! let registry = Registry::builtin()?
//!     .with_root_objects([(ObjectId::new("root"), MAP_TYPE.to_string())])?;
//! let loader = Loader::new(service, store, registry, TandemConfig::default())?;
//! let container = loader
//!     .create_container(&tenant, &document, token, ClientDescriptor::writer("ada"))
//!     .await?;
//! let root: SharedMap = container.get(&ObjectId::new("root")).await?;
//! root.set("title", "minutes")?;
//! container.flush().await?;
//! ```

#![forbid(unsafe_code)]

pub mod container;
pub mod loader;
pub mod registry;
pub mod request;

pub use container::{Container, CLIENTS_ENTRY, OBJECTS_ENTRY};
pub use loader::Loader;
pub use registry::{factory, HandleFactory, ObjectFactory, Registry, RootObject};
pub use request::RequestPath;
