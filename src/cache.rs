use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use time::OffsetDateTime;

use crate::key::{EntityKey, ResourceKey};

/// Metadata stored alongside a payload
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheMeta {
    /// When the upstream produced the data, if it said so
    pub generated_at: Option<OffsetDateTime>,
    /// Model that generated an analysis
    pub model: Option<String>,
    /// Lookback window the data was computed for
    pub window: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry<T> {
    pub key: ResourceKey,
    pub payload: T,
    pub meta: CacheMeta,
    pub stored_at: OffsetDateTime,
}

/// Last successful result per resource key
///
/// Entries are immutable once stored; a write replaces the whole `Arc`, so a
/// reader holding an older entry never sees a half-written one.
pub struct EntityCache<T> {
    inner: DashMap<ResourceKey, Arc<CacheEntry<T>>>,
    recency: DashMap<ResourceKey, u64>,
    tick: AtomicU64,
    capacity: Option<usize>,
}

impl<T> EntityCache<T> {
    /// Unbounded cache
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Cache that evicts the least recently used entry past `capacity`
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            inner: DashMap::new(),
            recency: DashMap::new(),
            tick: AtomicU64::new(0),
            capacity: capacity.map(|cap| cap.max(1)),
        }
    }

    pub fn get(&self, key: &ResourceKey) -> Option<Arc<CacheEntry<T>>> {
        let entry = self.inner.get(key).map(|r| Arc::clone(r.value()))?;
        self.touch(key);
        Some(entry)
    }

    pub fn has(&self, key: &ResourceKey) -> bool {
        self.inner.contains_key(key)
    }

    /// Store `payload` under `key`, replacing any previous entry
    pub fn set(&self, key: ResourceKey, payload: T, meta: CacheMeta) -> Arc<CacheEntry<T>> {
        let entry = Arc::new(CacheEntry {
            key: key.clone(),
            payload,
            meta,
            stored_at: OffsetDateTime::now_utc(),
        });
        self.inner.insert(key.clone(), Arc::clone(&entry));
        self.touch(&key);
        tracing::debug!(key = %key, entries = self.inner.len(), "缓存写入");
        self.evict_over_capacity(&key);
        entry
    }

    pub fn invalidate(&self, key: &ResourceKey) -> bool {
        self.recency.remove(key);
        let removed = self.inner.remove(key).is_some();
        if removed {
            tracing::debug!(key = %key, "缓存失效");
        }
        removed
    }

    /// Drop every facet cached for `entity`
    pub fn invalidate_entity(&self, entity: &EntityKey) -> usize {
        let keys: Vec<ResourceKey> = self
            .inner
            .iter()
            .filter(|r| r.key().entity() == entity)
            .map(|r| r.key().clone())
            .collect();
        keys.iter().filter(|key| self.invalidate(key)).count()
    }

    pub fn clear(&self) {
        self.inner.clear();
        self.recency.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn touch(&self, key: &ResourceKey) {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed) + 1;
        self.recency.insert(key.clone(), tick);
    }

    fn evict_over_capacity(&self, keep: &ResourceKey) {
        let Some(capacity) = self.capacity else {
            return;
        };
        while self.inner.len() > capacity {
            let oldest = self
                .recency
                .iter()
                .filter(|r| r.key() != keep)
                .min_by_key(|r| *r.value())
                .map(|r| r.key().clone());
            let Some(oldest) = oldest else {
                return;
            };
            tracing::debug!(key = %oldest, capacity, "缓存已满，淘汰最久未使用的条目");
            self.invalidate(&oldest);
        }
    }
}

impl<T> Default for EntityCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheMeta, EntityCache};
    use crate::key::EntityKey;
    use std::sync::Arc;

    #[test]
    fn set_then_get_returns_written_payload() {
        let cache = EntityCache::new();
        let key = EntityKey::stock("600519.SH").facet("trading");
        cache.set(key.clone(), vec![1, 2, 3], CacheMeta::default());

        let entry = cache.get(&key).expect("entry should exist");
        assert_eq!(entry.payload, vec![1, 2, 3]);
        assert_eq!(entry.key, key);
        assert!(cache.has(&key));
    }

    #[test]
    fn repeated_reads_are_equal() {
        let cache = EntityCache::new();
        let key = EntityKey::industry("Semiconductors").facet("integrated");
        cache.set(key.clone(), "report".to_string(), CacheMeta::default());

        let first = cache.get(&key).expect("first read");
        let second = cache.get(&key).expect("second read");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn write_replaces_entry_without_touching_old_readers() {
        let cache = EntityCache::new();
        let key = EntityKey::stock("AAPL.US").facet("analysis");
        cache.set(key.clone(), "v1", CacheMeta::default());
        let old = cache.get(&key).expect("v1");

        cache.set(key.clone(), "v2", CacheMeta::default());
        assert_eq!(old.payload, "v1");
        assert_eq!(cache.get(&key).expect("v2").payload, "v2");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = EntityCache::new();
        let key = EntityKey::stock("AAPL.US").facet("history");
        cache.set(key.clone(), 1, CacheMeta::default());
        assert!(cache.invalidate(&key));
        assert!(!cache.invalidate(&key));
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn invalidate_entity_drops_all_facets() {
        let cache = EntityCache::new();
        let aapl = EntityKey::stock("AAPL.US");
        let tsla = EntityKey::stock("TSLA.US");
        cache.set(aapl.facet("trading"), 1, CacheMeta::default());
        cache.set(aapl.facet("news"), 2, CacheMeta::default());
        cache.set(tsla.facet("trading"), 3, CacheMeta::default());

        assert_eq!(cache.invalidate_entity(&aapl), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.has(&tsla.facet("trading")));
    }

    #[test]
    fn evicts_least_recently_used_past_capacity() {
        let cache = EntityCache::with_capacity(Some(2));
        let a = EntityKey::stock("A").facet("trading");
        let b = EntityKey::stock("B").facet("trading");
        let c = EntityKey::stock("C").facet("trading");
        cache.set(a.clone(), 1, CacheMeta::default());
        cache.set(b.clone(), 2, CacheMeta::default());
        // reading `a` makes `b` the oldest
        assert!(cache.get(&a).is_some());
        cache.set(c.clone(), 3, CacheMeta::default());

        assert_eq!(cache.len(), 2);
        assert!(cache.has(&a));
        assert!(!cache.has(&b));
        assert!(cache.has(&c));
    }
}
