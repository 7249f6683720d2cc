//! Request path routing
//!
//! `/create/{typeTag}/{id}` asks the container to create a data object; any
//! other single-segment path (`/{id}` or `{id}`) looks one up. Type tags may
//! themselves contain `/`, so the id is always the last segment.

use std::fmt;
use std::str::FromStr;

use tandem_core::{ObjectId, TandemError};

const CREATE_PREFIX: &str = "create/";

/// A parsed container request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPath {
    /// Create object `id` of type `type_tag`
    Create {
        /// Registered type tag
        type_tag: String,
        /// New object id
        id: ObjectId,
    },
    /// Resolve existing object `id`
    Lookup {
        /// Object id
        id: ObjectId,
    },
}

impl RequestPath {
    /// Creation request
    pub fn create(type_tag: impl Into<String>, id: impl Into<ObjectId>) -> Self {
        Self::Create {
            type_tag: type_tag.into(),
            id: id.into(),
        }
    }

    /// Object the request addresses
    pub fn id(&self) -> &ObjectId {
        match self {
            Self::Create { id, .. } | Self::Lookup { id } => id,
        }
    }
}

fn malformed(path: &str) -> TandemError {
    TandemError::not_found(format!("malformed request path {path:?}"))
}

impl FromStr for RequestPath {
    type Err = TandemError;

    fn from_str(path: &str) -> Result<Self, Self::Err> {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        if let Some(rest) = trimmed.strip_prefix(CREATE_PREFIX) {
            let (type_tag, id) = rest.rsplit_once('/').ok_or_else(|| malformed(path))?;
            if type_tag.is_empty() || id.is_empty() {
                return Err(malformed(path));
            }
            return Ok(Self::create(type_tag, id));
        }
        if trimmed.is_empty() || trimmed.contains('/') || trimmed == "create" {
            return Err(malformed(path));
        }
        Ok(Self::Lookup {
            id: ObjectId::new(trimmed),
        })
    }
}

impl fmt::Display for RequestPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create { type_tag, id } => write!(f, "/{CREATE_PREFIX}{type_tag}/{id}"),
            Self::Lookup { id } => write!(f, "/{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_path_with_namespaced_tag() {
        let request: RequestPath = "/create/tandem/map/root".parse().unwrap();
        assert_eq!(request, RequestPath::create("tandem/map", "root"));
        assert_eq!(request.to_string(), "/create/tandem/map/root");
    }

    #[test]
    fn test_lookup_with_and_without_slash() {
        for path in ["/root", "root"] {
            let request: RequestPath = path.parse().unwrap();
            assert_eq!(
                request,
                RequestPath::Lookup {
                    id: ObjectId::new("root")
                }
            );
        }
    }

    #[test]
    fn test_malformed_paths() {
        for path in ["", "/", "/create", "/create/map", "/create//x", "/a/b", "/create/map/"] {
            let err = path.parse::<RequestPath>().unwrap_err();
            assert!(matches!(err, TandemError::NotFound { .. }), "{path}");
        }
    }
}
