//! Source and destination scopes and the name mapping between them.

use crate::models::object::ObjectRef;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A container plus a key prefix. An empty prefix means the whole container.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Scope {
    pub container: String,
    pub prefix: String,
}

impl Scope {
    /// Build a scope from a raw prefix, taken verbatim.
    pub fn new(container: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            prefix: prefix.into(),
        }
    }

    /// Build a scope from a folder name such as `source` or `a/b/`.
    ///
    /// The folder is normalised to a prefix ending in exactly one `/`, so
    /// `source` lists `source/x` but never `source-archive/x`.
    pub fn from_folder(container: impl Into<String>, folder: &str) -> Self {
        let trimmed = folder.trim_matches('/');
        let prefix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("{}/", trimmed)
        };
        Self::new(container, prefix)
    }

    /// True when `object` lives in this container under this prefix.
    pub fn contains(&self, object: &ObjectRef) -> bool {
        object.container == self.container && object.key.starts_with(&self.prefix)
    }

    /// True when every key of `other` would also be listed under `self`.
    pub fn encloses(&self, other: &Scope) -> bool {
        self.container == other.container && other.prefix.starts_with(&self.prefix)
    }

    /// Map a source object into `dest`: `dest.prefix + key[len(self.prefix)..]`.
    ///
    /// Returns `None` when the key does not start with this scope's prefix or
    /// lives in another container.
    pub fn map_into(&self, dest: &Scope, object: &ObjectRef) -> Option<ObjectRef> {
        if object.container != self.container {
            return None;
        }
        let rest = object.key.strip_prefix(self.prefix.as_str())?;
        Some(ObjectRef::new(
            dest.container.clone(),
            format!("{}{}", dest.prefix, rest),
        ))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.prefix)
    }
}
