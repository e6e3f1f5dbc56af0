//! The shard map catalog (§4.3): the public surface for managing maps,
//! shards, and mappings, backed by the global/local store protocol and a
//! versioned client-side cache.

use crate::cache::{CachedMap, CatalogMetrics, ShardMapCache};
use crate::recovery::RecoveryManager;
use dashmap::DashMap;
use meridian_core::{
    CatalogError, CatalogResult, EncodedKey, ListMapping, LoadPolicy, RangeMapping, RetryPolicyConfig, Shard,
    ShardKeyType, ShardLocation, ShardMap, ShardMapKind, Status,
};
use meridian_retry::{DefaultTransientErrorDetector, RetryEngine};
use meridian_store::global::GlobalStore;
use meridian_store::local::{LocalStore, LocalStoreResolver};
use meridian_store::ops::{
    AddListMappingOperation, AddRangeMappingOperation, CreateMapOperation, CreateShardOperation,
    DeleteListMappingOperation, DeleteMapOperation, DeleteRangeMappingOperation, DeleteShardOperation,
    MergeRangeMappingsOperation, SetListMappingLockOperation, SetRangeMappingLockOperation,
    SplitRangeMappingOperation, UpdateListMappingStatusOperation, UpdateRangeMappingStatusOperation,
};
use meridian_store::schema::SchemaVersion;
use meridian_store::{run_store_operation, StoreOperation};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Resolves shard locations to their per-shard local store, backing the
/// store-operation runner's local reflection step.
#[derive(Default)]
struct LocalStores(DashMap<ShardLocation, Arc<dyn LocalStore>>);

impl LocalStoreResolver for LocalStores {
    fn resolve(&self, location: &ShardLocation) -> Option<Arc<dyn LocalStore>> {
        self.0.get(location).map(|e| e.clone())
    }
}

/// One `(location, schema version)` pair, returned by
/// [`Catalog::schema_info_collection`].
#[derive(Debug, Clone)]
pub struct SchemaInfo {
    pub location: ShardLocation,
    pub version: SchemaVersion,
}

/// The shard map catalog. Wraps the global store, the set of per-shard
/// local stores, the retry engine, and the client-side cache behind the
/// typed operation surface described in §4.3.
pub struct Catalog {
    global: Arc<dyn GlobalStore>,
    locals: Arc<LocalStores>,
    cache: ShardMapCache,
    retry: RetryEngine<DefaultTransientErrorDetector>,
    recovery: RecoveryManager,
    load_policy: LoadPolicy,
}

impl Catalog {
    pub fn new(global: Arc<dyn GlobalStore>, load_policy: LoadPolicy) -> Self {
        Self::with_retry_policy(global, load_policy, RetryPolicyConfig::default())
    }

    pub fn with_retry_policy(global: Arc<dyn GlobalStore>, load_policy: LoadPolicy, retry_policy: RetryPolicyConfig) -> Self {
        let recovery = RecoveryManager::new(global.clone());
        let catalog = Self {
            global,
            locals: Arc::new(LocalStores::default()),
            cache: ShardMapCache::new(),
            retry: RetryEngine::new(retry_policy, DefaultTransientErrorDetector),
            recovery,
            load_policy,
        };
        if catalog.load_policy == LoadPolicy::Eager {
            catalog.preload();
        }
        catalog
    }

    fn preload(&self) {
        for map in self.global.list_maps() {
            self.refresh_cache_entry(map);
        }
    }

    pub fn metrics(&self) -> &CatalogMetrics {
        &self.cache.metrics
    }

    pub fn recovery_manager(&self) -> &RecoveryManager {
        &self.recovery
    }

    /// Registers the local store for a shard location; the store-operation
    /// runner cannot reflect a mutation to a shard with no registered
    /// local store.
    pub fn register_local_store(&self, location: ShardLocation, store: Arc<dyn LocalStore>) {
        self.locals.0.insert(location, store);
    }

    // ---- schema ------------------------------------------------------

    pub fn upgrade_global(&self, target: SchemaVersion) {
        self.global.set_schema_version(target);
    }

    pub fn upgrade_local(&self, location: &ShardLocation, target: SchemaVersion) -> CatalogResult<SchemaVersion> {
        let local = self
            .locals
            .resolve(location)
            .ok_or_else(|| CatalogError::StorageOperationFailure { message: format!("no local store for {location}") })?;
        local.upgrade(target)
    }

    pub fn schema_info_collection(&self) -> Vec<SchemaInfo> {
        self.locals
            .0
            .iter()
            .map(|e| SchemaInfo { location: e.key().clone(), version: e.value().schema_version() })
            .collect()
    }

    // ---- maps ----------------------------------------------------------

    pub async fn create_map(&self, name: &str, kind: ShardMapKind, key_type: ShardKeyType) -> CatalogResult<ShardMap> {
        let op = CreateMapOperation { name: name.to_string(), kind, key_type };
        let map = self.run(op).await?;
        self.cache.put(map.clone());
        Ok(map)
    }

    pub async fn delete_map(&self, map: &ShardMap) -> CatalogResult<()> {
        let op = DeleteMapOperation { map_id: map.id };
        self.run(op).await?;
        self.cache.invalidate(map.id);
        Ok(())
    }

    /// Fetches a map by name, consulting the cache first (I6); a cache miss
    /// falls through to the global store and repopulates the cache.
    pub fn try_get_map(&self, name: &str) -> Option<ShardMap> {
        if let Some(cached) = self.cache.get_by_name(name) {
            return Some(cached.map.clone());
        }
        let map = self.global.get_map_by_name(name)?;
        Some(self.refresh_cache_entry(map).map)
    }

    pub fn get_map(&self, name: &str) -> CatalogResult<ShardMap> {
        self.try_get_map(name).ok_or_else(|| CatalogError::ShardMapDoesNotExist { name: name.to_string() })
    }

    pub fn list_maps(&self) -> Vec<ShardMap> {
        self.global.list_maps()
    }

    pub fn list_distinct_locations(&self) -> Vec<ShardLocation> {
        self.global.list_distinct_locations()
    }

    // ---- shards ----------------------------------------------------------

    pub async fn create_shard(&self, map: &ShardMap, location: ShardLocation) -> CatalogResult<Shard> {
        let op = CreateShardOperation { map_id: map.id, location };
        self.run(op).await
    }

    pub async fn delete_shard(&self, map: &ShardMap, shard_id: Uuid) -> CatalogResult<()> {
        let op = DeleteShardOperation { map_id: map.id, shard_id };
        self.run(op).await
    }

    pub fn list_shards(&self, map: &ShardMap) -> Vec<Shard> {
        self.global.list_shards(map.id)
    }

    // ---- list mappings ---------------------------------------------------

    pub async fn add_list_mapping(
        &self,
        map: &ShardMap,
        shard: &Shard,
        key: EncodedKey,
    ) -> CatalogResult<ListMapping> {
        let op = AddListMappingOperation {
            map_id: map.id,
            shard_id: shard.id,
            location: shard.location.clone(),
            key,
            schema_version: self.global.schema_version(),
        };
        let mapping = self.run(op).await?;
        self.cached_map(map.id).put_list_mapping(mapping.clone());
        Ok(mapping)
    }

    pub async fn delete_list_mapping(
        &self,
        map: &ShardMap,
        mapping: &ListMapping,
        location: ShardLocation,
        lock_token: Option<Uuid>,
    ) -> CatalogResult<()> {
        let op = DeleteListMappingOperation { map_id: map.id, mapping_id: mapping.id, location, lock_token };
        self.run(op).await?;
        self.cached_map(map.id).remove_list_mapping(mapping.id);
        Ok(())
    }

    pub async fn update_list_mapping_status(
        &self,
        map: &ShardMap,
        mapping: &ListMapping,
        location: ShardLocation,
        new_status: Status,
        lock_token: Option<Uuid>,
    ) -> CatalogResult<ListMapping> {
        let op = UpdateListMappingStatusOperation { map_id: map.id, mapping_id: mapping.id, location, new_status, lock_token };
        let updated = self.run(op).await?;
        self.cached_map(map.id).put_list_mapping(updated.clone());
        Ok(updated)
    }

    pub async fn lock_list_mapping(&self, map: &ShardMap, mapping: &ListMapping, token: Uuid) -> CatalogResult<ListMapping> {
        let op = SetListMappingLockOperation { map_id: map.id, mapping_id: mapping.id, new_token: Some(token), current_token: mapping.lock_token };
        let updated = self.run(op).await?;
        self.cached_map(map.id).put_list_mapping(updated.clone());
        Ok(updated)
    }

    pub async fn unlock_list_mapping(&self, map: &ShardMap, mapping: &ListMapping, token: Uuid) -> CatalogResult<ListMapping> {
        let op = SetListMappingLockOperation { map_id: map.id, mapping_id: mapping.id, new_token: None, current_token: Some(token) };
        let updated = self.run(op).await?;
        self.cached_map(map.id).put_list_mapping(updated.clone());
        Ok(updated)
    }

    // ---- range mappings --------------------------------------------------

    pub async fn add_range_mapping(
        &self,
        map: &ShardMap,
        shard: &Shard,
        low: EncodedKey,
        high: EncodedKey,
    ) -> CatalogResult<RangeMapping> {
        let op = AddRangeMappingOperation {
            map_id: map.id,
            shard_id: shard.id,
            location: shard.location.clone(),
            low,
            high,
            schema_version: self.global.schema_version(),
        };
        let mapping = self.run(op).await?;
        self.cached_map(map.id).put_range_mapping(mapping.clone());
        Ok(mapping)
    }

    pub async fn delete_range_mapping(
        &self,
        map: &ShardMap,
        mapping: &RangeMapping,
        location: ShardLocation,
        lock_token: Option<Uuid>,
    ) -> CatalogResult<()> {
        let op = DeleteRangeMappingOperation { map_id: map.id, mapping_id: mapping.id, location, lock_token };
        self.run(op).await?;
        self.cached_map(map.id).remove_range_mapping(&mapping.low);
        Ok(())
    }

    pub async fn split_mapping(
        &self,
        map: &ShardMap,
        mapping: &RangeMapping,
        location: ShardLocation,
        at: EncodedKey,
        lock_token: Option<Uuid>,
    ) -> CatalogResult<(RangeMapping, RangeMapping)> {
        let op = SplitRangeMappingOperation { map_id: map.id, mapping_id: mapping.id, location, at, lock_token };
        let (left, right) = self.run(op).await?;
        let cached = self.cached_map(map.id);
        cached.remove_range_mapping(&mapping.low);
        cached.put_range_mapping(left.clone());
        cached.put_range_mapping(right.clone());
        Ok((left, right))
    }

    pub async fn merge_mappings(
        &self,
        map: &ShardMap,
        left: &RangeMapping,
        right: &RangeMapping,
        location: ShardLocation,
        lock_token: Option<Uuid>,
    ) -> CatalogResult<RangeMapping> {
        let op = MergeRangeMappingsOperation { map_id: map.id, left_id: left.id, right_id: right.id, location, lock_token };
        let merged = self.run(op).await?;
        let cached = self.cached_map(map.id);
        cached.remove_range_mapping(&left.low);
        cached.remove_range_mapping(&right.low);
        cached.put_range_mapping(merged.clone());
        Ok(merged)
    }

    pub async fn update_range_mapping_status(
        &self,
        map: &ShardMap,
        mapping: &RangeMapping,
        location: ShardLocation,
        new_status: Status,
        lock_token: Option<Uuid>,
    ) -> CatalogResult<RangeMapping> {
        let op = UpdateRangeMappingStatusOperation { map_id: map.id, mapping_id: mapping.id, location, new_status, lock_token };
        let updated = self.run(op).await?;
        self.cached_map(map.id).put_range_mapping(updated.clone());
        Ok(updated)
    }

    pub async fn lock_range_mapping(&self, map: &ShardMap, mapping: &RangeMapping, token: Uuid) -> CatalogResult<RangeMapping> {
        let op = SetRangeMappingLockOperation { map_id: map.id, mapping_id: mapping.id, new_token: Some(token), current_token: mapping.lock_token };
        let updated = self.run(op).await?;
        self.cached_map(map.id).put_range_mapping(updated.clone());
        Ok(updated)
    }

    pub async fn unlock_range_mapping(&self, map: &ShardMap, mapping: &RangeMapping, token: Uuid) -> CatalogResult<RangeMapping> {
        let op = SetRangeMappingLockOperation { map_id: map.id, mapping_id: mapping.id, new_token: None, current_token: Some(token) };
        let updated = self.run(op).await?;
        self.cached_map(map.id).put_range_mapping(updated.clone());
        Ok(updated)
    }

    // ---- lookup ------------------------------------------------------

    /// Finds the mapping covering `key` in `map`, consulting the cache
    /// first and falling back to the store on miss or on a
    /// `GlobalStoreVersionMismatch`, per I6.
    pub fn find_mapping_for_key(&self, map: &ShardMap, key: &EncodedKey) -> CatalogResult<Uuid> {
        let cached = self.cached_map(map.id);
        let found = match map.kind {
            ShardMapKind::List => cached.find_list_mapping(key).map(|m| m.shard_id),
            ShardMapKind::Range => cached.find_range_mapping(key).map(|m| m.shard_id),
        };
        if let Some(shard_id) = found {
            return Ok(shard_id);
        }

        debug!(map = %map.name, "mapping cache miss, consulting store");
        let store_result = match map.kind {
            ShardMapKind::List => self.global.find_list_mapping(map.id, key).map(|m| {
                cached.put_list_mapping(m.clone());
                m.shard_id
            }),
            ShardMapKind::Range => self.global.find_range_mapping(map.id, key).map(|m| {
                cached.put_range_mapping(m.clone());
                m.shard_id
            }),
        };
        store_result.ok_or_else(|| CatalogError::MappingNotFoundForKey { map_name: map.name.clone() })
    }

    /// Every list mapping currently cached for `map`, populating the cache
    /// entry first if this is the first access since construction.
    pub fn list_list_mappings(&self, map: &ShardMap) -> Vec<ListMapping> {
        self.cached_map(map.id).list_mappings()
    }

    /// Every range mapping currently cached for `map`, in ascending `low`
    /// order (I2).
    pub fn list_range_mappings(&self, map: &ShardMap) -> Vec<RangeMapping> {
        self.cached_map(map.id).range_mappings()
    }

    // ---- internals ------------------------------------------------------

    fn cached_map(&self, map_id: Uuid) -> Arc<CachedMap> {
        if let Some(entry) = self.cache.get_by_id(map_id) {
            return entry;
        }
        let map = self.global.get_map_by_id(map_id).expect("map must exist to be cached");
        self.refresh_cache_entry(map)
    }

    fn refresh_cache_entry(&self, map: ShardMap) -> Arc<CachedMap> {
        let map_id = map.id;
        let entry = self.cache.put(map);
        entry.replace_all_list(self.global.list_list_mappings(map_id));
        entry.replace_all_range(self.global.list_range_mappings(map_id));
        entry
    }

    /// Runs a store operation under the retry engine, treating
    /// `GlobalStoreVersionMismatch` as a signal to invalidate the cache
    /// entry before the engine's next attempt (I6).
    async fn run<O: StoreOperation>(&self, op: O) -> CatalogResult<O::Output> {
        let locals = self.locals.clone();
        let global = self.global.clone();
        let cache_map_id = op.lock_key();
        self.retry
            .run(
                || {
                    let global = global.clone();
                    let locals = locals.clone();
                    let op = &op;
                    async move {
                        let result = run_store_operation(op, global.as_ref(), locals.as_ref());
                        if let Err(CatalogError::GlobalStoreVersionMismatch { .. }) = &result {
                            self.cache.invalidate(cache_map_id);
                            self.cache.metrics.record_version_mismatch();
                        }
                        result
                    }
                },
                |_event| {},
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_store::global::InMemoryGlobalStore;
    use meridian_store::local::InMemoryLocalStore;

    fn catalog() -> Catalog {
        Catalog::new(Arc::new(InMemoryGlobalStore::new()), LoadPolicy::Lazy)
    }

    #[tokio::test]
    async fn create_map_populates_cache() {
        let catalog = catalog();
        let map = catalog.create_map("orders", ShardMapKind::Range, ShardKeyType::Int32).await.unwrap();
        assert_eq!(catalog.try_get_map("orders").unwrap().id, map.id);
    }

    #[tokio::test]
    async fn find_mapping_for_key_hits_cache_after_store_round_trip() {
        let catalog = catalog();
        let map = catalog.create_map("orders", ShardMapKind::Range, ShardKeyType::Int32).await.unwrap();
        let location = ShardLocation::new("srv", "db1");
        catalog.register_local_store(location.clone(), Arc::new(InMemoryLocalStore::new()));
        let shard = catalog.create_shard(&map, location).await.unwrap();
        catalog
            .add_range_mapping(&map, &shard, EncodedKey::Finite(vec![100]), EncodedKey::Finite(vec![200]))
            .await
            .unwrap();

        let misses_before = catalog.metrics().misses.load(std::sync::atomic::Ordering::Relaxed);
        let found = catalog.find_mapping_for_key(&map, &EncodedKey::Finite(vec![150])).unwrap();
        assert_eq!(found, shard.id);
        let found_again = catalog.find_mapping_for_key(&map, &EncodedKey::Finite(vec![150])).unwrap();
        assert_eq!(found_again, shard.id);
        assert_eq!(catalog.metrics().misses.load(std::sync::atomic::Ordering::Relaxed), misses_before);
    }

    #[tokio::test]
    async fn delete_map_invalidates_cache() {
        let catalog = catalog();
        let map = catalog.create_map("orders", ShardMapKind::Range, ShardKeyType::Int32).await.unwrap();
        catalog.delete_map(&map).await.unwrap();
        assert!(catalog.try_get_map("orders").is_none());
    }
}
