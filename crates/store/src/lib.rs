//! Vicinity store: the contract the proximity pipeline needs from a key-range
//! store, plus an in-RAM adapter serving reads from swapped snapshots.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::debug;
use vicinity_core::{Entity, EntityId, Filter, GeoKey, StoreError};

pub mod ingest;

pub use ingest::{spawn_ingest, Coalescer, Delta, IngestHandle};

/// External store contract. Range queries must be safe to run concurrently.
#[async_trait::async_trait]
pub trait GeoStore: Send + Sync {
    /// Entities whose `location.hash` lies in `[lower, upper]` and that match every filter.
    async fn range_query(
        &self,
        lower: &str,
        upper: &str,
        filters: &[Filter],
        limit: Option<usize>,
    ) -> Result<Vec<Entity>, StoreError>;

    /// Compare-and-swap on the credit count. Fails with `Conflict` when the stored count is
    /// no longer `expected_credits`, and with `NotFound` when the entity is gone.
    async fn conditional_update(
        &self,
        id: &EntityId,
        expected_credits: u32,
        new_credits: u32,
        new_recency_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn get(&self, id: &EntityId) -> Result<Option<Entity>, StoreError>;

    /// Insert or replace a whole record.
    async fn put(&self, entity: Entity) -> Result<(), StoreError>;

    /// Move an entity; coordinate and hash are written together.
    async fn relocate(&self, id: &EntityId, location: GeoKey) -> Result<(), StoreError>;

    /// Returns whether something was removed.
    async fn remove(&self, id: &EntityId) -> Result<bool, StoreError>;

    /// Epoch bumped on every committed write.
    fn subscribe_epoch(&self) -> watch::Receiver<u64>;
}

/// Immutable view of the in-RAM store.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub epoch: u64,
    entities: FxHashMap<EntityId, Entity>,
    by_hash: BTreeMap<String, BTreeSet<EntityId>>,
}

impl StoreSnapshot {
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, id: &EntityId) -> Option<&Entity> {
        self.entities.get(id)
    }

    /// Entities in `[lower, upper]`, ordered by hash then id.
    pub fn range<'a>(&'a self, lower: &'a str, upper: &'a str) -> impl Iterator<Item = &'a Entity> + 'a {
        let keys = if lower <= upper {
            Some(self.by_hash.range::<str, _>((Bound::Included(lower), Bound::Included(upper))))
        } else {
            None
        };
        keys.into_iter()
            .flatten()
            .flat_map(|(_, ids)| ids.iter())
            .filter_map(move |id| self.entities.get(id))
    }

    fn unindex(&mut self, id: &EntityId) {
        let hash = self.entities.get(id).and_then(|e| e.location.as_ref()).map(|l| l.hash().to_string());
        if let Some(hash) = hash {
            if let Some(ids) = self.by_hash.get_mut(&hash) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_hash.remove(&hash);
                }
            }
        }
    }

    fn upsert(&mut self, entity: Entity) {
        self.unindex(&entity.id);
        if let Some(loc) = &entity.location {
            self.by_hash.entry(loc.hash().to_string()).or_default().insert(entity.id.clone());
        }
        self.entities.insert(entity.id.clone(), entity);
    }

    fn relocate(&mut self, id: &EntityId, location: GeoKey) -> bool {
        let Some(mut entity) = self.entities.get(id).cloned() else { return false };
        entity.location = Some(location);
        self.upsert(entity);
        true
    }

    fn delete(&mut self, id: &EntityId) -> Option<Entity> {
        self.unindex(id);
        self.entities.remove(id)
    }
}

/// In-RAM `GeoStore`. Reads are lock-free snapshot loads; writes are serialised and each
/// commit swaps in a new snapshot and bumps the epoch.
pub struct MemoryStore {
    snap: ArcSwap<StoreSnapshot>,
    write: Mutex<()>,
    epoch_tx: watch::Sender<u64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (epoch_tx, _rx) = watch::channel(0u64);
        Self { snap: ArcSwap::from_pointee(StoreSnapshot::default()), write: Mutex::new(()), epoch_tx }
    }

    pub fn with_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        let store = Self::new();
        let mut snap = StoreSnapshot::default();
        for e in entities {
            snap.upsert(e);
        }
        snap.epoch = 1;
        store.snap.store(Arc::new(snap));
        store.epoch_tx.send_replace(1);
        store
    }

    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.snap.load_full()
    }

    pub fn len(&self) -> usize {
        self.snap.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snap.load().is_empty()
    }

    fn writer(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.write.lock().map_err(|_| StoreError::Unavailable("memory store writer poisoned".into()))
    }

    /// Run `f` against a private copy of the current snapshot and publish it if `f` succeeds.
    fn commit<R>(&self, f: impl FnOnce(&mut StoreSnapshot) -> Result<R, StoreError>) -> Result<R, StoreError> {
        let _guard = self.writer()?;
        let mut next = StoreSnapshot::clone(&self.snap.load());
        let out = f(&mut next)?;
        self.publish(next);
        Ok(out)
    }

    /// Caller holds the writer lock.
    fn publish(&self, mut next: StoreSnapshot) {
        next.epoch = next.epoch.saturating_add(1);
        let epoch = next.epoch;
        let len = next.len();
        self.snap.store(Arc::new(next));
        self.epoch_tx.send_replace(epoch);
        metrics::gauge!("store_entities", len as f64);
    }

    /// Removing an absent id publishes nothing, so watchers are not woken.
    fn remove_present(&self, id: &EntityId) -> Result<bool, StoreError> {
        let _guard = self.writer()?;
        let current = self.snap.load_full();
        if current.get(id).is_none() {
            return Ok(false);
        }
        let mut next = StoreSnapshot::clone(&current);
        next.delete(id);
        self.publish(next);
        Ok(true)
    }

    /// Apply a coalesced ingest batch as one commit.
    pub fn apply_batch(&self, batch: Vec<Delta>) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.commit(|snap| {
            for d in batch {
                match d {
                    Delta::Located { id, location } => {
                        if !snap.relocate(&id, location.clone()) {
                            debug!(id = %id, "first location for entity; registering");
                            let mut e = Entity::new(id);
                            e.location = Some(location);
                            snap.upsert(e);
                        }
                    }
                    Delta::Removed(id) => {
                        snap.delete(&id);
                    }
                }
            }
            Ok(())
        })
    }
}

#[async_trait::async_trait]
impl GeoStore for MemoryStore {
    async fn range_query(
        &self,
        lower: &str,
        upper: &str,
        filters: &[Filter],
        limit: Option<usize>,
    ) -> Result<Vec<Entity>, StoreError> {
        let snap = self.snap.load();
        let hits = snap
            .range(lower, upper)
            .filter(|e| filters.iter().all(|f| f.matches(&e.attributes)))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(hits)
    }

    async fn conditional_update(
        &self,
        id: &EntityId,
        expected_credits: u32,
        new_credits: u32,
        new_recency_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.commit(|snap| {
            let entity = snap.entities.get_mut(id).ok_or(StoreError::NotFound)?;
            if entity.credits != expected_credits {
                return Err(StoreError::Conflict { expected: expected_credits, actual: entity.credits });
            }
            entity.credits = new_credits;
            entity.recency_at = new_recency_at;
            Ok(())
        })
    }

    async fn get(&self, id: &EntityId) -> Result<Option<Entity>, StoreError> {
        Ok(self.snap.load().get(id).cloned())
    }

    async fn put(&self, entity: Entity) -> Result<(), StoreError> {
        self.commit(|snap| {
            snap.upsert(entity);
            Ok(())
        })
    }

    async fn relocate(&self, id: &EntityId, location: GeoKey) -> Result<(), StoreError> {
        self.commit(|snap| if snap.relocate(id, location) { Ok(()) } else { Err(StoreError::NotFound) })
    }

    async fn remove(&self, id: &EntityId) -> Result<bool, StoreError> {
        self.remove_present(id)
    }

    fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vicinity_core::{Coordinate, Tier};

    fn id(s: &str) -> EntityId {
        EntityId::parse(s).unwrap()
    }

    fn at(name: &str, lat: f64, lng: f64) -> Entity {
        Entity::new(id(name)).with_location(Coordinate::new(lat, lng).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn range_query_uses_hash_order_and_filters() {
        let store = MemoryStore::with_entities([
            at("a", 52.5210, 13.4060).with_attr("gender", "f"),
            at("b", 52.5205, 13.4055).with_attr("gender", "m"),
            at("far", -33.86, 151.20).with_attr("gender", "f"),
            Entity::new(id("nowhere")).with_attr("gender", "f"),
        ]);
        let all = store.range_query("u33", "u33~", &[], None).await.unwrap();
        let ids: Vec<_> = all.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a") && ids.contains(&"b"));

        let f = Filter::equals("gender", "f").unwrap();
        let only_f = store.range_query("u33", "u33~", &[f], None).await.unwrap();
        assert_eq!(only_f.len(), 1);
        assert_eq!(only_f[0].id.as_str(), "a");

        let capped = store.range_query("0", "z~", &[], Some(1)).await.unwrap();
        assert_eq!(capped.len(), 1);

        assert!(store.range_query("z", "a", &[], None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn relocate_moves_index_entry() {
        let store = MemoryStore::with_entities([at("a", 52.52, 13.405)]);
        let sydney = GeoKey::new(Coordinate::new(-33.86, 151.20).unwrap()).unwrap();
        store.relocate(&id("a"), sydney.clone()).await.unwrap();
        assert!(store.range_query("u33", "u33~", &[], None).await.unwrap().is_empty());
        let moved = store.range_query("r", "r~", &[], None).await.unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].location.as_ref(), Some(&sydney));

        let err = store.relocate(&id("ghost"), sydney).await.unwrap_err();
        assert_eq!(err, StoreError::NotFound);
    }

    #[tokio::test]
    async fn conditional_update_is_compare_and_swap() {
        let store = MemoryStore::with_entities([at("a", 1.0, 1.0).with_credits(2).with_tier(Tier(1))]);
        let t = Utc::now();
        store.conditional_update(&id("a"), 2, 1, t).await.unwrap();
        let e = store.get(&id("a")).await.unwrap().unwrap();
        assert_eq!((e.credits, e.recency_at), (1, t));

        let err = store.conditional_update(&id("a"), 2, 1, t).await.unwrap_err();
        assert_eq!(err, StoreError::Conflict { expected: 2, actual: 1 });
        let err = store.conditional_update(&id("missing"), 1, 0, t).await.unwrap_err();
        assert_eq!(err, StoreError::NotFound);
    }

    #[tokio::test]
    async fn writes_bump_epoch_failed_writes_do_not() {
        let store = MemoryStore::new();
        let rx = store.subscribe_epoch();
        store.put(at("a", 0.0, 0.0)).await.unwrap();
        assert_eq!(*rx.borrow(), 1);
        let _ = store.conditional_update(&id("a"), 5, 4, Utc::now()).await;
        assert_eq!(*rx.borrow(), 1);
        assert!(store.remove(&id("a")).await.unwrap());
        assert_eq!(*rx.borrow(), 2);
        assert!(!store.remove(&id("a")).await.unwrap());
        assert!(!store.remove(&id("never-existed")).await.unwrap());
        assert_eq!(store.snapshot().epoch, 2);
        assert_eq!(*rx.borrow(), 2);
        assert!(store.is_empty());
    }
}
