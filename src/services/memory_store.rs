//! src/services/memory_store.rs
//!
//! MemoryStore — an in-process ObjectStore with native leases, metadata
//! generations and per-key fault injection. Useful for dry runs against a
//! seeded state and for exercising the engine's failure paths.

use crate::{
    models::{
        object::{Metadata, MetadataSnapshot, ObjectRef},
        scope::Scope,
    },
    services::{
        clock::{Clock, SystemClock},
        store::{LeaseToken, ObjectStore, StoreError, StoreResult},
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use uuid::Uuid;

/// Backend call that can be made to fail for a given key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    ReadMetadata,
    WriteMetadata,
    Copy,
    Delete,
    ReleaseLease,
}

#[derive(Debug, Clone)]
struct StoredObject {
    content: Bytes,
    metadata: Metadata,
    generation: i64,
    lease: Option<(LeaseToken, DateTime<Utc>)>,
}

#[derive(Debug)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<ObjectRef, StoredObject>>,
    /// Per key and call: successful calls still allowed before failing.
    faults: Mutex<HashMap<String, HashMap<Fault, usize>>>,
    clock: Arc<dyn Clock>,
    native_leases: bool,
    yielding: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            faults: Mutex::new(HashMap::new()),
            clock,
            native_leases: true,
            yielding: false,
        }
    }

    /// Behave like a backend that only offers metadata.
    pub fn without_native_leases(mut self) -> Self {
        self.native_leases = false;
        self
    }

    /// Yield to the scheduler at the start of every backend call, so
    /// concurrent callers interleave the way they would over a network.
    pub fn yielding(mut self) -> Self {
        self.yielding = true;
        self
    }

    async fn io_point(&self) {
        if self.yielding {
            tokio::task::yield_now().await;
        }
    }

    /// Create or overwrite an object.
    pub fn put(&self, object: ObjectRef, content: impl Into<Bytes>, metadata: Metadata) {
        let mut objects = self.objects();
        let generation = objects.get(&object).map_or(1, |o| o.generation + 1);
        objects.insert(
            object,
            StoredObject {
                content: content.into(),
                metadata,
                generation,
                lease: None,
            },
        );
    }

    /// Content and metadata of an object, if present.
    pub fn get(&self, object: &ObjectRef) -> Option<(Bytes, Metadata)> {
        self.objects()
            .get(object)
            .map(|o| (o.content.clone(), o.metadata.clone()))
    }

    pub fn contains(&self, object: &ObjectRef) -> bool {
        self.objects().contains_key(object)
    }

    /// Every object key in `container`, in order.
    pub fn keys(&self, container: &str) -> Vec<String> {
        self.objects()
            .keys()
            .filter(|o| o.container == container)
            .map(|o| o.key.clone())
            .collect()
    }

    /// Make every future `fault` call on `key` fail with a backend error.
    pub fn inject(&self, key: impl Into<String>, fault: Fault) {
        self.inject_after(key, fault, 0);
    }

    /// Let `successes` calls of kind `fault` on `key` through, then fail
    /// every later one.
    pub fn inject_after(&self, key: impl Into<String>, fault: Fault, successes: usize) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.into())
            .or_default()
            .insert(fault, successes);
    }

    pub fn clear_faults(&self) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn objects(&self) -> MutexGuard<'_, BTreeMap<ObjectRef, StoredObject>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_fault(&self, object: &ObjectRef, fault: Fault) -> StoreResult<()> {
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        match faults
            .get_mut(&object.key)
            .and_then(|armed| armed.get_mut(&fault))
        {
            None => Ok(()),
            Some(0) => Err(StoreError::Backend(format!(
                "injected {:?} failure for {}",
                fault, object
            ))),
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
        }
    }

    fn ensure_native(&self) -> StoreResult<()> {
        if self.native_leases {
            Ok(())
        } else {
            Err(StoreError::Unsupported("native leasing"))
        }
    }

    /// Holder of a lease that has not expired yet.
    fn live_lease(&self, stored: &StoredObject) -> Option<(LeaseToken, DateTime<Utc>)> {
        let now = self.clock.now();
        stored
            .lease
            .as_ref()
            .filter(|(_, expires)| *expires > now)
            .cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn supports_native_leases(&self) -> bool {
        self.native_leases
    }

    async fn list(&self, scope: &Scope) -> StoreResult<Vec<ObjectRef>> {
        self.io_point().await;
        Ok(self
            .objects()
            .keys()
            .filter(|o| scope.contains(o))
            .cloned()
            .collect())
    }

    async fn read_metadata(&self, object: &ObjectRef) -> StoreResult<MetadataSnapshot> {
        self.io_point().await;
        self.check_fault(object, Fault::ReadMetadata)?;
        let objects = self.objects();
        let stored = objects
            .get(object)
            .ok_or_else(|| StoreError::ObjectNotFound(object.clone()))?;
        Ok(MetadataSnapshot {
            values: stored.metadata.clone(),
            generation: Some(stored.generation),
        })
    }

    async fn write_metadata(
        &self,
        object: &ObjectRef,
        values: &Metadata,
        if_generation: Option<i64>,
    ) -> StoreResult<()> {
        self.io_point().await;
        self.check_fault(object, Fault::WriteMetadata)?;
        let mut objects = self.objects();
        let stored = objects
            .get_mut(object)
            .ok_or_else(|| StoreError::ObjectNotFound(object.clone()))?;
        if let Some(expected) = if_generation {
            if stored.generation != expected {
                return Err(StoreError::Conflict(object.clone()));
            }
        }
        stored.metadata = values.clone();
        stored.generation += 1;
        Ok(())
    }

    async fn copy(
        &self,
        src: &ObjectRef,
        dst: &ObjectRef,
        drop_metadata: &[&str],
    ) -> StoreResult<()> {
        self.io_point().await;
        self.check_fault(src, Fault::Copy)?;
        let mut objects = self.objects();
        let source = objects
            .get(src)
            .ok_or_else(|| StoreError::ObjectNotFound(src.clone()))?;
        let mut metadata = source.metadata.clone();
        metadata.retain(|key, _| !drop_metadata.contains(&key.as_str()));
        let content = source.content.clone();
        let generation = objects.get(dst).map_or(1, |o| o.generation + 1);
        objects.insert(
            dst.clone(),
            StoredObject {
                content,
                metadata,
                generation,
                lease: None,
            },
        );
        Ok(())
    }

    async fn delete(&self, object: &ObjectRef, lease: Option<&LeaseToken>) -> StoreResult<()> {
        self.io_point().await;
        self.check_fault(object, Fault::Delete)?;
        let mut objects = self.objects();
        let stored = objects
            .get(object)
            .ok_or_else(|| StoreError::ObjectNotFound(object.clone()))?;
        if let Some((holder, _)) = self.live_lease(stored) {
            if lease != Some(&holder) {
                return Err(StoreError::AlreadyLeased(object.clone()));
            }
        }
        objects.remove(object);
        Ok(())
    }

    async fn acquire_lease(&self, object: &ObjectRef, ttl: Duration) -> StoreResult<LeaseToken> {
        self.io_point().await;
        self.ensure_native()?;
        let expires = self
            .clock
            .now()
            .checked_add_signed(ttl)
            .ok_or(StoreError::InvalidLeaseTtl(ttl))?;
        let mut objects = self.objects();
        let stored = objects
            .get(object)
            .ok_or_else(|| StoreError::ObjectNotFound(object.clone()))?;
        if self.live_lease(stored).is_some() {
            return Err(StoreError::AlreadyLeased(object.clone()));
        }
        let token = LeaseToken(Uuid::new_v4().to_string());
        if let Some(stored) = objects.get_mut(object) {
            stored.lease = Some((token.clone(), expires));
        }
        Ok(token)
    }

    async fn release_lease(&self, object: &ObjectRef, token: &LeaseToken) -> StoreResult<()> {
        self.io_point().await;
        self.ensure_native()?;
        self.check_fault(object, Fault::ReleaseLease)?;
        let mut objects = self.objects();
        let stored = objects
            .get(object)
            .ok_or_else(|| StoreError::ObjectNotFound(object.clone()))?;
        match self.live_lease(stored) {
            Some((holder, _)) if &holder == token => {
                if let Some(stored) = objects.get_mut(object) {
                    stored.lease = None;
                }
                Ok(())
            }
            _ => Err(StoreError::LeaseLost(object.clone())),
        }
    }

    async fn lease_expiry(&self, object: &ObjectRef) -> StoreResult<Option<DateTime<Utc>>> {
        self.io_point().await;
        self.ensure_native()?;
        let objects = self.objects();
        let stored = objects
            .get(object)
            .ok_or_else(|| StoreError::ObjectNotFound(object.clone()))?;
        Ok(self.live_lease(stored).map(|(_, expires)| expires))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::ManualClock;
    use chrono::TimeZone;

    fn obj(key: &str) -> ObjectRef {
        ObjectRef::new("bucket", key)
    }

    #[tokio::test]
    async fn list_is_ordered_and_scoped() {
        let store = MemoryStore::new();
        for key in ["src/b", "dst/a", "src/a", "srcx/c"] {
            store.put(obj(key), "x", Metadata::new());
        }
        let listed = store
            .list(&Scope::new("bucket", "src/"))
            .await
            .expect("list");
        let keys: Vec<_> = listed.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["src/a", "src/b"]);
    }

    #[tokio::test]
    async fn lease_expires_with_clock() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        store.put(obj("a"), "x", Metadata::new());

        let first = store
            .acquire_lease(&obj("a"), Duration::seconds(30))
            .await
            .expect("first lease");
        assert!(matches!(
            store.acquire_lease(&obj("a"), Duration::seconds(30)).await,
            Err(StoreError::AlreadyLeased(_))
        ));

        clock.advance(Duration::seconds(31));
        let second = store
            .acquire_lease(&obj("a"), Duration::seconds(30))
            .await
            .expect("lease after expiry");
        assert_ne!(first, second);
        assert!(matches!(
            store.release_lease(&obj("a"), &first).await,
            Err(StoreError::LeaseLost(_))
        ));
        store
            .release_lease(&obj("a"), &second)
            .await
            .expect("holder releases");
    }

    #[tokio::test]
    async fn delete_requires_lease_token_when_leased() {
        let store = MemoryStore::new();
        store.put(obj("a"), "x", Metadata::new());
        let token = store
            .acquire_lease(&obj("a"), Duration::seconds(30))
            .await
            .expect("lease");

        assert!(matches!(
            store.delete(&obj("a"), None).await,
            Err(StoreError::AlreadyLeased(_))
        ));
        store.delete(&obj("a"), Some(&token)).await.expect("delete");
        assert!(!store.contains(&obj("a")));
    }

    #[tokio::test]
    async fn conditional_write_detects_interleaving() {
        let store = MemoryStore::new();
        store.put(obj("a"), "x", Metadata::new());
        let snapshot = store.read_metadata(&obj("a")).await.expect("read");

        let mut values = Metadata::new();
        values.insert("k".into(), "1".into());
        store
            .write_metadata(&obj("a"), &values, snapshot.generation)
            .await
            .expect("first write wins");
        assert!(matches!(
            store
                .write_metadata(&obj("a"), &values, snapshot.generation)
                .await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn copy_drops_requested_metadata() {
        let store = MemoryStore::new();
        let mut metadata = Metadata::new();
        metadata.insert("lease_expiration".into(), "2030-01-01T00:00:00".into());
        metadata.insert("owner".into(), "ops".into());
        store.put(obj("src/a"), "payload", metadata);

        store
            .copy(&obj("src/a"), &obj("dst/a"), &["lease_expiration"])
            .await
            .expect("copy");
        let (content, metadata) = store.get(&obj("dst/a")).expect("copied");
        assert_eq!(content, Bytes::from("payload"));
        assert_eq!(metadata.get("owner").map(String::as_str), Some("ops"));
        assert!(!metadata.contains_key("lease_expiration"));
        assert!(store.contains(&obj("src/a")));
    }
}
