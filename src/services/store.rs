//! src/services/store.rs
//!
//! ObjectStore — the capability surface the migration engine needs from a
//! blob backend: listing, metadata read/write, copy, delete and, for backends
//! that have them, native leases. Everything above this trait is
//! backend-agnostic.

use crate::models::{
    object::{Metadata, MetadataSnapshot, ObjectRef},
    scope::Scope,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::{fmt, io};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("container `{0}` not found")]
    ContainerNotFound(String),
    #[error("container `{0}` already exists")]
    ContainerAlreadyExists(String),
    #[error("container `{name}` invalid: {reason}")]
    InvalidContainerName { name: String, reason: String },
    #[error("object `{0}` not found")]
    ObjectNotFound(ObjectRef),
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),
    #[error("object `{0}` is already leased")]
    AlreadyLeased(ObjectRef),
    #[error("lease on `{0}` expired or is held by another token")]
    LeaseLost(ObjectRef),
    #[error("metadata of `{0}` changed since it was read")]
    Conflict(ObjectRef),
    #[error("lease TTL {0} is out of range")]
    InvalidLeaseTtl(Duration),
    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),
    #[error("backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Opaque holder token issued by a backend when a native lease is granted.
#[derive(Serialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct LeaseToken(pub String);

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short backend name for log lines.
    fn name(&self) -> &'static str;

    /// Whether `acquire_lease` / `release_lease` are implemented.
    fn supports_native_leases(&self) -> bool {
        false
    }

    /// Snapshot of the objects under `scope`, ordered by key.
    async fn list(&self, scope: &Scope) -> StoreResult<Vec<ObjectRef>>;

    async fn read_metadata(&self, object: &ObjectRef) -> StoreResult<MetadataSnapshot>;

    /// Replace the object's metadata.
    ///
    /// With `if_generation` set the write only lands when the stored
    /// generation still matches, otherwise it fails with `Conflict`.
    async fn write_metadata(
        &self,
        object: &ObjectRef,
        values: &Metadata,
        if_generation: Option<i64>,
    ) -> StoreResult<()>;

    /// Copy payload and metadata from `src` to `dst`, overwriting `dst`.
    ///
    /// Metadata keys listed in `drop_metadata` are not carried over.
    async fn copy(&self, src: &ObjectRef, dst: &ObjectRef, drop_metadata: &[&str])
    -> StoreResult<()>;

    /// Remove the object. A natively leased object requires its token.
    async fn delete(&self, object: &ObjectRef, lease: Option<&LeaseToken>) -> StoreResult<()>;

    /// Atomically take a lease for `ttl`; fails with `AlreadyLeased` if held.
    async fn acquire_lease(&self, _object: &ObjectRef, _ttl: Duration) -> StoreResult<LeaseToken> {
        Err(StoreError::Unsupported("native leasing"))
    }

    /// Give a lease back; fails with `LeaseLost` if it expired or was taken.
    async fn release_lease(&self, _object: &ObjectRef, _token: &LeaseToken) -> StoreResult<()> {
        Err(StoreError::Unsupported("native leasing"))
    }

    /// Expiry of the live native lease on `object`, if any.
    async fn lease_expiry(&self, _object: &ObjectRef) -> StoreResult<Option<DateTime<Utc>>> {
        Err(StoreError::Unsupported("native leasing"))
    }
}
