//! Represents an object (blob) addressed inside a container.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{collections::BTreeMap, fmt};
use uuid::Uuid;

/// User metadata attached to an object.
///
/// Ordered so that two snapshots of the same state compare and print the same.
pub type Metadata = BTreeMap<String, String>;

/// Address of one object: a container plus a key inside it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    /// Container (bucket) holding the object.
    pub container: String,

    /// Object key (path-like identifier within the container).
    pub key: String,
}

impl ObjectRef {
    pub fn new(container: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            key: key.into(),
        }
    }

    /// Folder placeholders have no payload worth moving.
    pub fn is_directory_marker(&self) -> bool {
        self.key.ends_with('/')
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.key)
    }
}

/// Metadata read back together with the generation it was read at.
///
/// `generation` is `None` for backends without optimistic concurrency.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetadataSnapshot {
    pub values: Metadata,
    pub generation: Option<i64>,
}

/// Row describing a stored object in the local backend.
///
/// Payload bytes live on disk; this struct only carries bookkeeping.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ObjectRecord {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Foreign key linking to the parent container.
    pub container_id: Uuid,

    /// Object key.
    pub key: String,

    /// Content type (MIME type).
    pub content_type: Option<String>,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 of the payload, hex encoded.
    pub etag: Option<String>,

    /// Timestamp when object was last modified.
    pub last_modified: DateTime<Utc>,

    /// Bumped on every metadata write; used for conditional updates.
    pub metageneration: i64,

    /// Holder token of the native lease, if any.
    pub lease_id: Option<String>,

    /// Native lease expiry in unix milliseconds.
    pub lease_expires_ms: Option<i64>,
}
