//! Locking through the backend's own lease API.
//!
//! Acquisition is atomic on the backend, so two workers racing for the same
//! object cannot both win. Leases carry a TTL and lapse on their own if the
//! holder dies.

use crate::{
    models::object::ObjectRef,
    services::{
        clock::Clock,
        lock::{
            Acquisition, LockError, LockHandle, LockProof, LockStrategy, Release, expiry_after,
        },
        store::{ObjectStore, StoreError},
    },
};
use async_trait::async_trait;
use chrono::Duration;
use std::{fmt, sync::Arc};
use tracing::debug;

pub struct NativeLease {
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl fmt::Debug for NativeLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeLease")
            .field("store", &self.store.name())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl NativeLease {
    /// Fails when the backend has no lease primitive.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Result<Self, StoreError> {
        if !store.supports_native_leases() {
            return Err(StoreError::Unsupported("native leasing"));
        }
        Ok(Self { store, clock, ttl })
    }
}

#[async_trait]
impl LockStrategy for NativeLease {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn acquire(&self, object: &ObjectRef) -> Result<Acquisition, LockError> {
        let expires = expiry_after(object, self.clock.now(), self.ttl)?;
        match self.store.acquire_lease(object, self.ttl).await {
            Ok(token) => Ok(Acquisition::Acquired(LockHandle {
                object: object.clone(),
                expires,
                proof: LockProof::Native(token),
            })),
            Err(StoreError::AlreadyLeased(_)) => Ok(Acquisition::AlreadyHeld { until: None }),
            Err(err) => Err(err.into()),
        }
    }

    async fn release(&self, lock: LockHandle) -> Result<Release, LockError> {
        let LockProof::Native(token) = &lock.proof else {
            return Ok(Release::AlreadyGone);
        };
        match self.store.release_lease(&lock.object, token).await {
            Ok(()) => Ok(Release::Released),
            Err(StoreError::LeaseLost(_)) | Err(StoreError::ObjectNotFound(_)) => {
                debug!("lease on {} already gone", lock.object);
                Ok(Release::AlreadyGone)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn is_locked(&self, object: &ObjectRef) -> Result<bool, LockError> {
        Ok(self.store.lease_expiry(object).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::object::Metadata,
        services::{clock::SystemClock, memory_store::MemoryStore},
    };

    fn setup() -> (Arc<MemoryStore>, NativeLease) {
        let store = Arc::new(MemoryStore::new());
        store.put(ObjectRef::new("c", "k"), "x", Metadata::new());
        let lock = NativeLease::new(store.clone(), Arc::new(SystemClock), Duration::seconds(30))
            .expect("memory store leases natively");
        (store, lock)
    }

    #[tokio::test]
    async fn overlong_ttl_is_an_error_not_a_lease() {
        let store = Arc::new(MemoryStore::new());
        store.put(ObjectRef::new("c", "k"), "x", Metadata::new());
        let lock = NativeLease::new(
            store.clone(),
            Arc::new(SystemClock),
            Duration::seconds(i64::MAX / 1_000),
        )
        .expect("memory store leases natively");

        assert!(matches!(
            lock.acquire(&ObjectRef::new("c", "k")).await,
            Err(LockError::ExpiryOutOfRange { .. })
        ));
        assert_eq!(
            store
                .lease_expiry(&ObjectRef::new("c", "k"))
                .await
                .expect("lease state"),
            None
        );
    }

    #[tokio::test]
    async fn concurrent_acquire_has_one_winner() {
        let (_store, lock) = setup();
        let object = ObjectRef::new("c", "k");

        let (a, b) = tokio::join!(lock.acquire(&object), lock.acquire(&object));
        let outcomes = [a.expect("acquire a"), b.expect("acquire b")];
        let winners = outcomes
            .iter()
            .filter(|o| matches!(o, Acquisition::Acquired(_)))
            .count();
        let losers = outcomes
            .iter()
            .filter(|o| matches!(o, Acquisition::AlreadyHeld { .. }))
            .count();
        assert_eq!((winners, losers), (1, 1));
    }

    #[tokio::test]
    async fn release_unlocks_and_tolerates_deleted_object() {
        let (store, lock) = setup();
        let object = ObjectRef::new("c", "k");

        let Acquisition::Acquired(handle) = lock.acquire(&object).await.expect("acquire") else {
            panic!("fresh object should be free");
        };
        assert!(lock.is_locked(&object).await.expect("is_locked"));
        assert_eq!(lock.release(handle).await.expect("release"), Release::Released);
        assert!(!lock.is_locked(&object).await.expect("is_locked"));

        let Acquisition::Acquired(handle) = lock.acquire(&object).await.expect("acquire") else {
            panic!("released object should be free");
        };
        store
            .delete(&object, handle.lease_token())
            .await
            .expect("delete under lease");
        assert_eq!(lock.release(handle).await.expect("release"), Release::AlreadyGone);
    }

    #[test]
    fn refuses_backend_without_leases() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new().without_native_leases());
        assert!(NativeLease::new(store, Arc::new(SystemClock), Duration::seconds(30)).is_err());
    }
}
