//! Client-side shard map cache (§4.3, I6): avoids a global-store round trip
//! on every lookup while guaranteeing a caller never observes a mapping
//! older than the version it already saw.

use dashmap::DashMap;
use meridian_core::{EncodedKey, ListMapping, RangeMapping, ShardMap};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// One shard map's cached mappings, versioned against the map's own
/// `version` field so a stale entry is detectable without a store call.
pub struct CachedMap {
    pub map: ShardMap,
    list_by_id: RwLock<std::collections::HashMap<Uuid, ListMapping>>,
    range_by_low: RwLock<BTreeMap<EncodedKey, RangeMapping>>,
}

impl CachedMap {
    fn new(map: ShardMap) -> Self {
        Self { map, list_by_id: RwLock::new(std::collections::HashMap::new()), range_by_low: RwLock::new(BTreeMap::new()) }
    }

    pub fn version(&self) -> u64 {
        self.map.version
    }

    pub fn list_mappings(&self) -> Vec<ListMapping> {
        self.list_by_id.read().values().cloned().collect()
    }

    pub fn range_mappings(&self) -> Vec<RangeMapping> {
        self.range_by_low.read().values().cloned().collect()
    }

    pub fn find_list_mapping(&self, key: &EncodedKey) -> Option<ListMapping> {
        self.list_by_id.read().values().find(|m| &m.key == key).cloned()
    }

    /// The mapping whose half-open range contains `key`, found by locating
    /// the greatest `low <= key` and checking it against `high`.
    pub fn find_range_mapping(&self, key: &EncodedKey) -> Option<RangeMapping> {
        self.range_by_low.read().range(..=key.clone()).next_back().map(|(_, m)| m.clone()).filter(|m| m.contains(key))
    }

    pub fn put_list_mapping(&self, mapping: ListMapping) {
        self.list_by_id.write().insert(mapping.id, mapping);
    }

    pub fn remove_list_mapping(&self, mapping_id: Uuid) {
        self.list_by_id.write().remove(&mapping_id);
    }

    pub fn put_range_mapping(&self, mapping: RangeMapping) {
        self.range_by_low.write().insert(mapping.low.clone(), mapping);
    }

    pub fn remove_range_mapping(&self, low: &EncodedKey) {
        self.range_by_low.write().remove(low);
    }

    pub fn replace_all_list(&self, mappings: Vec<ListMapping>) {
        let mut guard = self.list_by_id.write();
        guard.clear();
        for m in mappings {
            guard.insert(m.id, m);
        }
    }

    pub fn replace_all_range(&self, mappings: Vec<RangeMapping>) {
        let mut guard = self.range_by_low.write();
        guard.clear();
        for m in mappings {
            guard.insert(m.low.clone(), m);
        }
    }
}

/// Hit/miss/invalidation counters exposed for callers that want basic cache
/// observability without pulling in a metrics crate.
#[derive(Default)]
pub struct CatalogMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub invalidations: AtomicU64,
    pub version_mismatches: AtomicU64,
}

impl CatalogMetrics {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_version_mismatch(&self) {
        self.version_mismatches.fetch_add(1, Ordering::Relaxed);
    }
}

/// The per-catalog cache: one [`CachedMap`] per shard map name, invalidated
/// wholesale on delete and refreshed in place on every mutation the catalog
/// performs (I6).
#[derive(Default)]
pub struct ShardMapCache {
    by_name: DashMap<String, std::sync::Arc<CachedMap>>,
    by_id: DashMap<Uuid, std::sync::Arc<CachedMap>>,
    pub metrics: CatalogMetrics,
}

impl ShardMapCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_by_name(&self, name: &str) -> Option<std::sync::Arc<CachedMap>> {
        match self.by_name.get(name) {
            Some(entry) => {
                self.metrics.record_hit();
                Some(entry.clone())
            }
            None => {
                self.metrics.record_miss();
                None
            }
        }
    }

    pub fn get_by_id(&self, map_id: Uuid) -> Option<std::sync::Arc<CachedMap>> {
        match self.by_id.get(&map_id) {
            Some(entry) => {
                self.metrics.record_hit();
                Some(entry.clone())
            }
            None => {
                self.metrics.record_miss();
                None
            }
        }
    }

    pub fn all(&self) -> Vec<std::sync::Arc<CachedMap>> {
        self.by_name.iter().map(|e| e.value().clone()).collect()
    }

    /// Inserts or replaces the cached entry for `map`, discarding any
    /// previously cached mappings (the caller repopulates them).
    pub fn put(&self, map: ShardMap) -> std::sync::Arc<CachedMap> {
        let entry = std::sync::Arc::new(CachedMap::new(map.clone()));
        self.by_name.insert(map.name.clone(), entry.clone());
        self.by_id.insert(map.id, entry.clone());
        entry
    }

    pub fn invalidate(&self, map_id: Uuid) {
        if let Some((_, entry)) = self.by_id.remove(&map_id) {
            self.by_name.remove(&entry.map.name);
        }
        self.metrics.record_invalidation();
    }

    pub fn invalidate_all(&self) {
        self.by_name.clear();
        self.by_id.clear();
        self.metrics.record_invalidation();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::{ShardKeyType, ShardMapKind, Status};

    fn map(version: u64) -> ShardMap {
        ShardMap { id: Uuid::new_v4(), name: "orders".into(), kind: ShardMapKind::Range, key_type: ShardKeyType::Int32, version }
    }

    #[test]
    fn put_then_get_round_trips() {
        let cache = ShardMapCache::new();
        let m = map(1);
        let id = m.id;
        cache.put(m);
        assert!(cache.get_by_name("orders").is_some());
        assert!(cache.get_by_id(id).is_some());
    }

    #[test]
    fn invalidate_removes_both_indexes() {
        let cache = ShardMapCache::new();
        let m = map(1);
        let id = m.id;
        cache.put(m);
        cache.invalidate(id);
        assert!(cache.get_by_name("orders").is_none());
        assert!(cache.get_by_id(id).is_none());
    }

    #[test]
    fn range_lookup_finds_containing_mapping_not_a_neighbor() {
        let cached = CachedMap::new(map(1));
        cached.put_range_mapping(RangeMapping {
            id: Uuid::new_v4(),
            map_id: Uuid::nil(),
            shard_id: Uuid::nil(),
            low: EncodedKey::Finite(vec![0]),
            high: EncodedKey::Finite(vec![10]),
            status: Status::Online,
            lock_token: None,
            version: 1,
        });
        cached.put_range_mapping(RangeMapping {
            id: Uuid::new_v4(),
            map_id: Uuid::nil(),
            shard_id: Uuid::nil(),
            low: EncodedKey::Finite(vec![10]),
            high: EncodedKey::Finite(vec![20]),
            status: Status::Online,
            lock_token: None,
            version: 1,
        });
        let found = cached.find_range_mapping(&EncodedKey::Finite(vec![15])).unwrap();
        assert_eq!(found.low, EncodedKey::Finite(vec![10]));
        assert!(cached.find_range_mapping(&EncodedKey::Finite(vec![25])).is_none());
    }
}
