//! src/services/engine.rs
//!
//! MigrationEngine — one pass of lease-coordinated copy-then-delete from a
//! source scope to a destination scope.
//!
//! For every listed object the engine claims it locally, takes the remote
//! lock, copies, deletes the source and releases the lock. Every exit path
//! after a successful acquisition goes through `release`. Failures stay
//! scoped to their object; only listing aborts the pass. Nothing is retried:
//! skipped and failed objects are picked up by the next pass.

use crate::{
    errors::JobError,
    models::{
        object::ObjectRef,
        report::{FailureStage, ObjectOutcome, PlannedMove, Report, SkipReason},
        scope::Scope,
    },
    services::{
        lock::{Acquisition, LockError, LockHandle, LockStrategy, Release, format_expiration},
        store::{ObjectStore, StoreError},
    },
};
use futures::{StreamExt, stream};
use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::{debug, error, info, warn};

pub struct MigrationEngine {
    store: Arc<dyn ObjectStore>,
    lock: Arc<dyn LockStrategy>,
    claims: ClaimTable,
    concurrency: usize,
}

impl fmt::Debug for MigrationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationEngine")
            .field("store", &self.store.name())
            .field("lock", &self.lock)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

impl MigrationEngine {
    pub fn new(store: Arc<dyn ObjectStore>, lock: Arc<dyn LockStrategy>) -> Self {
        Self {
            store,
            lock,
            claims: ClaimTable::default(),
            concurrency: 1,
        }
    }

    /// Number of objects processed at once within this process.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Move everything under `source` into `dest` once.
    pub async fn run_pass(&self, source: &Scope, dest: &Scope) -> Result<Report, JobError> {
        ensure_disjoint(source, dest)?;
        let objects = self.store.list(source).await.map_err(|error| JobError::List {
            scope: source.clone(),
            error,
        })?;
        info!(
            "pass starting: {} objects under {} -> {} ({} lock, {} backend)",
            objects.len(),
            source,
            dest,
            self.lock.name(),
            self.store.name()
        );

        // `buffered` keeps results in listing order.
        let outcomes: Vec<(String, ObjectOutcome)> = stream::iter(objects)
            .map(|object| async move {
                let outcome = self.process(source, dest, &object).await;
                (object.key, outcome)
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut report = Report::default();
        for (key, outcome) in outcomes {
            report.record(key, outcome);
        }

        info!(
            "pass finished: {} processed, {} skipped, {} failed",
            report.processed, report.skipped, report.failed
        );
        let duplicates = report.duplicate_risk();
        if !duplicates.is_empty() {
            error!(
                "{} objects exist at both source and destination: {}",
                duplicates.len(),
                duplicates.join(", ")
            );
        }
        Ok(report)
    }

    /// Dry run: what `run_pass` would attempt, without touching anything.
    pub async fn plan(&self, source: &Scope, dest: &Scope) -> Result<Vec<PlannedMove>, JobError> {
        ensure_disjoint(source, dest)?;
        let objects = self.store.list(source).await.map_err(|error| JobError::List {
            scope: source.clone(),
            error,
        })?;

        let mut planned = Vec::with_capacity(objects.len());
        for object in objects {
            let destination = if object.is_directory_marker() {
                None
            } else {
                source.map_into(dest, &object).map(|dst| dst.key)
            };
            let locked = match self.lock.is_locked(&object).await {
                Ok(locked) => locked,
                Err(err) => {
                    warn!("could not read lock state of {}: {}", object, err);
                    true
                }
            };
            planned.push(PlannedMove {
                key: object.key,
                destination,
                locked,
            });
        }
        Ok(planned)
    }

    async fn process(&self, source: &Scope, dest: &Scope, object: &ObjectRef) -> ObjectOutcome {
        if object.is_directory_marker() {
            debug!("skipping folder marker {}", object);
            return ObjectOutcome::Skipped {
                reason: SkipReason::DirectoryMarker,
            };
        }

        let Some(target) = source.map_into(dest, object) else {
            warn!("skipping {}: key is outside source prefix `{}`", object, source.prefix);
            return ObjectOutcome::Skipped {
                reason: SkipReason::Malformed,
            };
        };

        let Some(_claim) = self.claims.try_claim(object) else {
            info!("skipping {}: already in flight in this process", object);
            return ObjectOutcome::Skipped {
                reason: SkipReason::InFlight,
            };
        };

        let handle = match self.lock.acquire(object).await {
            Ok(Acquisition::Acquired(handle)) => handle,
            Ok(Acquisition::AlreadyHeld { until }) => {
                let until = until.map(format_expiration);
                match &until {
                    Some(until) => info!("skipping {}: locked by another worker until {}", object, until),
                    None => info!("skipping {}: locked by another worker", object),
                }
                return ObjectOutcome::Skipped {
                    reason: SkipReason::LockedByOther { until },
                };
            }
            Err(LockError::Store(StoreError::ObjectNotFound(_))) => {
                info!("skipping {}: no longer present", object);
                return ObjectOutcome::Skipped {
                    reason: SkipReason::Gone,
                };
            }
            Err(err) => {
                warn!("could not lock {}: {}", object, err);
                return ObjectOutcome::Failed {
                    stage: FailureStage::Lock,
                    error: err.to_string(),
                    duplicate_risk: false,
                    lock_released: true,
                };
            }
        };
        debug!("locked {} until {}", object, format_expiration(handle.expires));

        if let Err(err) = self
            .store
            .copy(object, &target, self.lock.reserved_metadata())
            .await
        {
            let lock_released = self.release(handle).await;
            warn!(
                "error copying {} to {}: {}; source left in place, lock released: {}",
                object, target, err, lock_released
            );
            return ObjectOutcome::Failed {
                stage: FailureStage::Copy,
                error: err.to_string(),
                duplicate_risk: false,
                lock_released,
            };
        }

        if let Err(err) = self.store.delete(object, handle.lease_token()).await {
            let lock_released = self.release(handle).await;
            error!(
                "copied {} to {} but could not delete the source: {}; object now exists in both places (lock released: {})",
                object, target, err, lock_released
            );
            return ObjectOutcome::Failed {
                stage: FailureStage::Delete,
                error: err.to_string(),
                duplicate_risk: true,
                lock_released,
            };
        }

        if !self.release(handle).await {
            warn!("moved {} but its lock could not be released", object);
        }
        info!("moved {} to {}", object, target);
        ObjectOutcome::Moved {
            destination: target.key,
        }
    }

    /// Give the lock back. Returns false only when the lock may still be held.
    async fn release(&self, handle: LockHandle) -> bool {
        let object = handle.object.clone();
        match self.lock.release(handle).await {
            Ok(Release::Released) => {
                debug!("released lock on {}", object);
                true
            }
            Ok(Release::AlreadyGone) => true,
            Err(err) => {
                warn!("could not release lock on {}: {}", object, err);
                false
            }
        }
    }
}

fn ensure_disjoint(source: &Scope, dest: &Scope) -> Result<(), JobError> {
    if source.encloses(dest) {
        return Err(JobError::OverlappingScopes {
            from: source.clone(),
            to: dest.clone(),
        });
    }
    Ok(())
}

/// Names currently being processed by this process.
#[derive(Debug, Default, Clone)]
struct ClaimTable {
    active: Arc<Mutex<HashSet<ObjectRef>>>,
}

impl ClaimTable {
    fn try_claim(&self, object: &ObjectRef) -> Option<Claim> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(object.clone()) {
            return None;
        }
        Some(Claim {
            table: self.clone(),
            object: object.clone(),
        })
    }
}

struct Claim {
    table: ClaimTable,
    object: ObjectRef,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.table
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.object);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::object::Metadata,
        services::{
            clock::SystemClock, memory_store::MemoryStore, native_lease::NativeLease,
        },
    };
    use chrono::Duration;

    fn engine(store: Arc<MemoryStore>) -> MigrationEngine {
        let lock = NativeLease::new(store.clone(), Arc::new(SystemClock), Duration::seconds(60))
            .expect("native leases");
        MigrationEngine::new(store, Arc::new(lock))
    }

    #[test]
    fn claim_table_rejects_second_claim_until_drop() {
        let table = ClaimTable::default();
        let object = ObjectRef::new("c", "k");
        let first = table.try_claim(&object).expect("first claim");
        assert!(table.try_claim(&object).is_none());
        drop(first);
        assert!(table.try_claim(&object).is_some());
    }

    #[tokio::test]
    async fn refuses_overlapping_scopes() {
        let store = Arc::new(MemoryStore::new());
        store.put(ObjectRef::new("c", "src/a"), "x", Metadata::new());
        let engine = engine(store.clone());

        for dest in [Scope::new("c", "src/"), Scope::new("c", "src/done/")] {
            assert!(matches!(
                engine.run_pass(&Scope::new("c", "src/"), &dest).await,
                Err(JobError::OverlappingScopes { .. })
            ));
        }
        assert!(store.contains(&ObjectRef::new("c", "src/a")));
    }

    #[tokio::test]
    async fn plan_reports_mapping_and_lock_state() {
        let store = Arc::new(MemoryStore::new());
        for key in ["src/", "src/a", "src/b"] {
            store.put(ObjectRef::new("c", key), "x", Metadata::new());
        }
        store
            .acquire_lease(&ObjectRef::new("c", "src/b"), Duration::seconds(60))
            .await
            .expect("competitor lease");
        let engine = engine(store.clone());

        let plan = engine
            .plan(&Scope::new("c", "src/"), &Scope::new("c", "dst/"))
            .await
            .expect("plan");
        assert_eq!(
            plan,
            vec![
                PlannedMove {
                    key: "src/".into(),
                    destination: None,
                    locked: false
                },
                PlannedMove {
                    key: "src/a".into(),
                    destination: Some("dst/a".into()),
                    locked: false
                },
                PlannedMove {
                    key: "src/b".into(),
                    destination: Some("dst/b".into()),
                    locked: true
                },
            ]
        );
        assert_eq!(store.keys("c"), vec!["src/", "src/a", "src/b"]);
    }

    #[tokio::test]
    async fn concurrent_passes_in_one_process_move_each_object_once() {
        let store = Arc::new(MemoryStore::new().yielding());
        for i in 0..20 {
            store.put(ObjectRef::new("c", format!("src/{i:02}")), "x", Metadata::new());
        }
        let engine = engine(store.clone()).with_concurrency(4);
        let source = Scope::new("c", "src/");
        let dest = Scope::new("c", "dst/");

        let (a, b) = tokio::join!(engine.run_pass(&source, &dest), engine.run_pass(&source, &dest));
        let (a, b) = (a.expect("pass a"), b.expect("pass b"));

        assert_eq!(a.processed + b.processed, 20);
        assert_eq!(a.failed + b.failed, 0);
        assert_eq!(store.keys("c").len(), 20);
        assert!(store.keys("c").iter().all(|k| k.starts_with("dst/")));
    }
}
