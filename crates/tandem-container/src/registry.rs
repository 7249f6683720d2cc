//! Data object type registry
//!
//! Maps type tags to factories. The type map is fixed at construction and
//! read-only afterwards; duplicate tags and empty registries are refused
//! immediately rather than on first use.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use tandem_core::{ObjectId, Result, TandemError};
use tandem_shared::{Ink, ObjectHandle, SharedMap, SharedModel, SharedSequence};

/// Creates empty models for one type tag
pub trait ObjectFactory: Send + Sync {
    /// Tag this factory is registered under
    fn type_tag(&self) -> &str;

    /// Fresh model in its empty default state
    fn create(&self) -> Box<dyn SharedModel>;
}

impl fmt::Debug for dyn ObjectFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectFactory")
            .field("type_tag", &self.type_tag())
            .finish()
    }
}

/// Factory for any [`ObjectHandle`] whose model has a default
pub struct HandleFactory<H>(PhantomData<fn() -> H>);

impl<H: ObjectHandle> ObjectFactory for HandleFactory<H> {
    fn type_tag(&self) -> &str {
        H::TYPE_TAG
    }

    fn create(&self) -> Box<dyn SharedModel> {
        Box::<H::Model>::default()
    }
}

/// Factory entry for handle type `H`
pub fn factory<H: ObjectHandle + 'static>() -> Arc<dyn ObjectFactory> {
    Arc::new(HandleFactory::<H>(PhantomData))
}

/// Data object ids are non-empty and never contain `/` or start with `.`:
/// both are reserved by request paths and the snapshot layout.
pub(crate) fn is_valid_object_id(id: &ObjectId) -> bool {
    let raw = id.as_str();
    !raw.is_empty() && !raw.contains('/') && !raw.starts_with('.')
}

/// Object created automatically the first time a container is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootObject {
    /// Object id
    pub id: ObjectId,
    /// Registered type tag
    pub type_tag: String,
}

/// Immutable type map plus the eager-initialization list
#[derive(Clone)]
pub struct Registry {
    factories: HashMap<String, Arc<dyn ObjectFactory>>,
    roots: Vec<RootObject>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        tags.sort_unstable();
        f.debug_struct("Registry")
            .field("types", &tags)
            .field("roots", &self.roots)
            .finish()
    }
}

impl Registry {
    /// Build a registry. Duplicate or empty type tags and empty registries
    /// are configuration errors.
    pub fn new(factories: impl IntoIterator<Item = Arc<dyn ObjectFactory>>) -> Result<Self> {
        let mut map = HashMap::new();
        for factory in factories {
            let tag = factory.type_tag().to_string();
            if tag.is_empty() {
                return Err(TandemError::configuration("empty type tag"));
            }
            if map.insert(tag.clone(), factory).is_some() {
                return Err(TandemError::configuration(format!(
                    "type tag {tag} registered twice"
                )));
            }
        }
        if map.is_empty() {
            return Err(TandemError::configuration("registry has no factories"));
        }
        Ok(Self {
            factories: map,
            roots: Vec::new(),
        })
    }

    /// Registry with the built-in map, sequence and ink types
    pub fn builtin() -> Result<Self> {
        Self::new([
            factory::<SharedMap>(),
            factory::<SharedSequence>(),
            factory::<Ink>(),
        ])
    }

    /// Add the eager-initialization list, instantiated in order the first
    /// time a container is created. Every type must be registered.
    pub fn with_root_objects(
        mut self,
        roots: impl IntoIterator<Item = (ObjectId, String)>,
    ) -> Result<Self> {
        for (id, type_tag) in roots {
            if !is_valid_object_id(&id) {
                return Err(TandemError::configuration(format!(
                    "root object id {:?} is not a valid data object id",
                    id.as_str()
                )));
            }
            if !self.factories.contains_key(&type_tag) {
                return Err(TandemError::unregistered_type(type_tag));
            }
            if self.roots.iter().any(|root| root.id == id) {
                return Err(TandemError::configuration(format!(
                    "root object {id} listed twice"
                )));
            }
            self.roots.push(RootObject { id, type_tag });
        }
        Ok(self)
    }

    /// Factory for `type_tag`
    pub fn factory(&self, type_tag: &str) -> Result<&Arc<dyn ObjectFactory>> {
        self.factories
            .get(type_tag)
            .ok_or_else(|| TandemError::unregistered_type(type_tag))
    }

    /// Whether `type_tag` has a factory
    pub fn contains(&self, type_tag: &str) -> bool {
        self.factories.contains_key(type_tag)
    }

    /// Eager-initialization list
    pub fn root_objects(&self) -> &[RootObject] {
        &self.roots
    }
}
