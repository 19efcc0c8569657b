//! Per-object mutual exclusion.
//!
//! A `LockStrategy` decides how a worker claims one object before moving it.
//! Two implementations exist: `NativeLease` uses the backend's atomic lease
//! primitive, `MetadataLease` writes an advisory `lease_expiration` field.
//! Contention is an ordinary outcome (`Acquisition::AlreadyHeld`), not an
//! error; `LockError` is reserved for calls that actually failed.

use crate::{
    models::object::ObjectRef,
    services::store::{LeaseToken, StoreError},
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use std::fmt::Debug;
use thiserror::Error;

/// Metadata key holding the advisory lease expiry.
pub const LEASE_FIELD: &str = "lease_expiration";

/// Wire format of `LEASE_FIELD`: UTC, second precision, no offset.
pub const LEASE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Error)]
pub enum LockError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("`{object}` carries an unreadable lease_expiration value `{value}`")]
    InvalidLeaseField { object: ObjectRef, value: String },
    #[error("a lease of {ttl} on `{object}` would end past the representable time range")]
    ExpiryOutOfRange { object: ObjectRef, ttl: Duration },
}

/// What the holder has to present to prove ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockProof {
    Native(LeaseToken),
    /// The exact `lease_expiration` value this worker wrote.
    Metadata(String),
}

/// A lock currently held on one object.
#[derive(Debug)]
pub struct LockHandle {
    pub object: ObjectRef,
    pub expires: DateTime<Utc>,
    pub proof: LockProof,
}

impl LockHandle {
    /// Token to pass along with mutating calls on a natively leased object.
    pub fn lease_token(&self) -> Option<&LeaseToken> {
        match &self.proof {
            LockProof::Native(token) => Some(token),
            LockProof::Metadata(_) => None,
        }
    }
}

#[derive(Debug)]
pub enum Acquisition {
    Acquired(LockHandle),
    /// Someone else owns the object right now; skip it this pass.
    AlreadyHeld { until: Option<DateTime<Utc>> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Released,
    /// Lease already expired, was taken over, or the object is gone.
    AlreadyGone,
}

#[async_trait]
pub trait LockStrategy: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// Metadata keys owned by the lock that must not follow a copy.
    fn reserved_metadata(&self) -> &'static [&'static str] {
        &[]
    }

    async fn acquire(&self, object: &ObjectRef) -> Result<Acquisition, LockError>;

    async fn release(&self, lock: LockHandle) -> Result<Release, LockError>;

    async fn is_locked(&self, object: &ObjectRef) -> Result<bool, LockError>;
}

/// `now + ttl`, or `ExpiryOutOfRange` when that overflows.
pub fn expiry_after(
    object: &ObjectRef,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Result<DateTime<Utc>, LockError> {
    now.checked_add_signed(ttl)
        .ok_or_else(|| LockError::ExpiryOutOfRange {
            object: object.clone(),
            ttl,
        })
}

/// Render an expiry in the `lease_expiration` wire format.
pub fn format_expiration(at: DateTime<Utc>) -> String {
    at.format(LEASE_TIME_FORMAT).to_string()
}

/// Parse a `lease_expiration` value, interpreting it as UTC.
pub fn parse_expiration(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, LEASE_TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}
