//! Locking emulated with a `lease_expiration` metadata field.
//!
//! For backends without a lease primitive. A worker reads the object's
//! metadata, backs off if the field holds a future time, and otherwise
//! writes `now + duration` into it. The read and the write are separate
//! calls: two workers that read before either writes will both believe they
//! hold the lock. The guarantee is advisory only.
//!
//! With `conditional` set, the write carries the metadata generation seen
//! by the read and a concurrent writer turns into a lost race
//! (`AlreadyHeld`) instead of a double claim. That closes the window on
//! backends with conditional metadata updates.
//!
//! A field left behind by a crashed worker is never cleaned up actively by
//! a pass; it stops blocking once its time has passed. `sweep_expired`
//! removes such leftovers on demand.

use crate::{
    models::{object::ObjectRef, report::SweepReport, scope::Scope},
    services::{
        clock::Clock,
        lock::{
            Acquisition, LEASE_FIELD, LockError, LockHandle, LockProof, LockStrategy, Release,
            expiry_after, format_expiration, parse_expiration,
        },
        store::{ObjectStore, StoreError},
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::{fmt, sync::Arc};
use tracing::{debug, info, warn};

pub struct MetadataLease {
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    duration: Duration,
    conditional: bool,
}

impl fmt::Debug for MetadataLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataLease")
            .field("store", &self.store.name())
            .field("duration", &self.duration)
            .field("conditional", &self.conditional)
            .finish()
    }
}

impl MetadataLease {
    pub fn new(store: Arc<dyn ObjectStore>, clock: Arc<dyn Clock>, duration: Duration) -> Self {
        Self {
            store,
            clock,
            duration,
            conditional: false,
        }
    }

    /// Guard the claiming write with the generation seen by the read.
    pub fn conditional(mut self, enabled: bool) -> Self {
        self.conditional = enabled;
        self
    }

    /// Current holder's expiry, if the field is set and still in the future.
    fn active_until(
        &self,
        object: &ObjectRef,
        raw: Option<&String>,
    ) -> Result<Option<DateTime<Utc>>, LockError> {
        let Some(raw) = raw else {
            return Ok(None);
        };
        let until = parse_expiration(raw).ok_or_else(|| LockError::InvalidLeaseField {
            object: object.clone(),
            value: raw.clone(),
        })?;
        Ok((until > self.clock.now()).then_some(until))
    }
}

#[async_trait]
impl LockStrategy for MetadataLease {
    fn name(&self) -> &'static str {
        "metadata"
    }

    fn reserved_metadata(&self) -> &'static [&'static str] {
        &[LEASE_FIELD]
    }

    async fn acquire(&self, object: &ObjectRef) -> Result<Acquisition, LockError> {
        let snapshot = self.store.read_metadata(object).await?;
        if let Some(until) = self.active_until(object, snapshot.values.get(LEASE_FIELD))? {
            return Ok(Acquisition::AlreadyHeld { until: Some(until) });
        }

        let written = format_expiration(expiry_after(object, self.clock.now(), self.duration)?);
        let expires = parse_expiration(&written).ok_or_else(|| LockError::InvalidLeaseField {
            object: object.clone(),
            value: written.clone(),
        })?;
        let mut values = snapshot.values;
        values.insert(LEASE_FIELD.to_string(), written.clone());

        let precondition = if self.conditional {
            snapshot.generation
        } else {
            None
        };
        match self
            .store
            .write_metadata(object, &values, precondition)
            .await
        {
            Ok(()) => Ok(Acquisition::Acquired(LockHandle {
                object: object.clone(),
                expires,
                proof: LockProof::Metadata(written),
            })),
            Err(StoreError::Conflict(_)) => {
                debug!("lost metadata race on {}", object);
                Ok(Acquisition::AlreadyHeld { until: None })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Clear the field, but only if it still holds the value this worker
    /// wrote; a field rewritten by someone else after our lease lapsed is
    /// theirs.
    async fn release(&self, lock: LockHandle) -> Result<Release, LockError> {
        let LockProof::Metadata(written) = &lock.proof else {
            return Ok(Release::AlreadyGone);
        };
        let snapshot = match self.store.read_metadata(&lock.object).await {
            Ok(snapshot) => snapshot,
            Err(StoreError::ObjectNotFound(_)) => return Ok(Release::AlreadyGone),
            Err(err) => return Err(err.into()),
        };
        if snapshot.values.get(LEASE_FIELD) != Some(written) {
            debug!("lease field on {} no longer ours", lock.object);
            return Ok(Release::AlreadyGone);
        }

        let mut values = snapshot.values;
        values.remove(LEASE_FIELD);
        let precondition = if self.conditional {
            snapshot.generation
        } else {
            None
        };
        match self
            .store
            .write_metadata(&lock.object, &values, precondition)
            .await
        {
            Ok(()) => Ok(Release::Released),
            Err(StoreError::ObjectNotFound(_)) => Ok(Release::AlreadyGone),
            Err(err) => Err(err.into()),
        }
    }

    async fn is_locked(&self, object: &ObjectRef) -> Result<bool, LockError> {
        let snapshot = self.store.read_metadata(object).await?;
        Ok(self
            .active_until(object, snapshot.values.get(LEASE_FIELD))?
            .is_some())
    }
}

/// Remove `lease_expiration` fields under `scope` whose time has passed.
///
/// Active fields are left alone. Each object is handled on its own; a
/// failure is counted and the sweep moves on. Only listing is fatal.
pub async fn sweep_expired(
    store: &dyn ObjectStore,
    clock: &dyn Clock,
    scope: &Scope,
) -> Result<SweepReport, StoreError> {
    let objects = store.list(scope).await?;
    let mut report = SweepReport::default();

    for object in objects {
        match sweep_one(store, clock, &object).await {
            Ok(SweepStep::Cleared(until)) => {
                info!("cleared expired lease on {} (expired {})", object, until);
                report.cleared += 1;
            }
            Ok(SweepStep::Active) => report.active += 1,
            Ok(SweepStep::Unleased) => {}
            Err(err) => {
                warn!("could not sweep {}: {}", object, err);
                report.failed += 1;
            }
        }
    }

    info!(
        "sweep of {} done: {} cleared, {} active, {} failed",
        scope, report.cleared, report.active, report.failed
    );
    Ok(report)
}

enum SweepStep {
    Cleared(String),
    Active,
    Unleased,
}

async fn sweep_one(
    store: &dyn ObjectStore,
    clock: &dyn Clock,
    object: &ObjectRef,
) -> Result<SweepStep, LockError> {
    let snapshot = store.read_metadata(object).await?;
    let Some(raw) = snapshot.values.get(LEASE_FIELD).cloned() else {
        return Ok(SweepStep::Unleased);
    };
    let until = parse_expiration(&raw).ok_or_else(|| LockError::InvalidLeaseField {
        object: object.clone(),
        value: raw.clone(),
    })?;
    if until > clock.now() {
        return Ok(SweepStep::Active);
    }

    let mut values = snapshot.values;
    values.remove(LEASE_FIELD);
    // Generation guard so a worker claiming the object meanwhile wins.
    store
        .write_metadata(object, &values, snapshot.generation)
        .await?;
    Ok(SweepStep::Cleared(raw))
}
