//! The generic per-map handle (spec.md §6 "ShardMap<K>"): key lookup, shard
//! and mapping CRUD, and lock/unlock, scoped to a single map and typed by
//! its key so callers pass `i32`/`Uuid`/`String`/... instead of raw
//! [`EncodedKey`] bytes.

use meridian_catalog::Catalog;
use meridian_core::{
    CatalogError, CatalogResult, EncodedKey, ListMapping, RangeMapping, Shard, ShardKeyValue, ShardLocation,
    ShardMap as CoreShardMap, ShardMapKind, Status,
};
use std::marker::PhantomData;
use std::sync::Arc;
use uuid::Uuid;

/// A shard map scoped to key type `K`. `K` never appears in a stored field
/// (only in method signatures), so this handle is `Clone` regardless of
/// whether `K` is.
pub struct ShardMap<K> {
    catalog: Arc<Catalog>,
    map: CoreShardMap,
    _key: PhantomData<fn() -> K>,
}

impl<K> Clone for ShardMap<K> {
    fn clone(&self) -> Self {
        Self { catalog: self.catalog.clone(), map: self.map.clone(), _key: PhantomData }
    }
}

impl<K> ShardMap<K>
where
    K: Into<ShardKeyValue>,
{
    pub fn new(catalog: Arc<Catalog>, map: CoreShardMap) -> Self {
        Self { catalog, map, _key: PhantomData }
    }

    pub fn id(&self) -> Uuid {
        self.map.id
    }

    pub fn name(&self) -> &str {
        &self.map.name
    }

    pub fn kind(&self) -> ShardMapKind {
        self.map.kind
    }

    pub fn inner(&self) -> &CoreShardMap {
        &self.map
    }

    fn encode(&self, key: K) -> CatalogResult<EncodedKey> {
        key.into().encode(self.map.key_type)
    }

    /// Rejects list-mapping calls against a `Range` map and vice versa with
    /// `NotSupported`, rather than letting the store reject a mismatched
    /// operation with a less specific error.
    fn require_kind(&self, expected: ShardMapKind) -> CatalogResult<()> {
        if self.map.kind != expected {
            return Err(CatalogError::NotSupported {
                message: format!("this operation requires a {expected:?} shard map; {} is {:?}", self.map.name, self.map.kind),
            });
        }
        Ok(())
    }

    /// Resolves the shard owning `key` (§4.3 "Lookup").
    pub fn get_shard_for_key(&self, key: K) -> CatalogResult<Shard> {
        let encoded = self.encode(key)?;
        let shard_id = self.catalog.find_mapping_for_key(&self.map, &encoded)?;
        self.list_shards()
            .into_iter()
            .find(|s| s.id == shard_id)
            .ok_or_else(|| CatalogError::InternalError { message: "mapping points at an unlisted shard".into() })
    }

    pub async fn create_shard(&self, location: ShardLocation) -> CatalogResult<Shard> {
        self.catalog.create_shard(&self.map, location).await
    }

    pub async fn delete_shard(&self, shard_id: Uuid) -> CatalogResult<()> {
        self.catalog.delete_shard(&self.map, shard_id).await
    }

    pub fn list_shards(&self) -> Vec<Shard> {
        self.catalog.list_shards(&self.map)
    }

    pub fn list_list_mappings(&self) -> Vec<ListMapping> {
        self.catalog.list_list_mappings(&self.map)
    }

    pub fn list_range_mappings(&self) -> Vec<RangeMapping> {
        self.catalog.list_range_mappings(&self.map)
    }

    pub async fn add_list_mapping(&self, shard: &Shard, key: K) -> CatalogResult<ListMapping> {
        self.require_kind(ShardMapKind::List)?;
        let key = self.encode(key)?;
        self.catalog.add_list_mapping(&self.map, shard, key).await
    }

    pub async fn delete_list_mapping(
        &self,
        mapping: &ListMapping,
        location: ShardLocation,
        lock_token: Option<Uuid>,
    ) -> CatalogResult<()> {
        self.require_kind(ShardMapKind::List)?;
        self.catalog.delete_list_mapping(&self.map, mapping, location, lock_token).await
    }

    pub async fn update_list_mapping_status(
        &self,
        mapping: &ListMapping,
        location: ShardLocation,
        new_status: Status,
        lock_token: Option<Uuid>,
    ) -> CatalogResult<ListMapping> {
        self.require_kind(ShardMapKind::List)?;
        self.catalog.update_list_mapping_status(&self.map, mapping, location, new_status, lock_token).await
    }

    pub async fn lock_list_mapping(&self, mapping: &ListMapping, token: Uuid) -> CatalogResult<ListMapping> {
        self.require_kind(ShardMapKind::List)?;
        self.catalog.lock_list_mapping(&self.map, mapping, token).await
    }

    pub async fn unlock_list_mapping(&self, mapping: &ListMapping, token: Uuid) -> CatalogResult<ListMapping> {
        self.require_kind(ShardMapKind::List)?;
        self.catalog.unlock_list_mapping(&self.map, mapping, token).await
    }

    pub async fn add_range_mapping(&self, shard: &Shard, low: K, high: K) -> CatalogResult<RangeMapping> {
        self.require_kind(ShardMapKind::Range)?;
        let low = self.encode(low)?;
        let high = self.encode(high)?;
        self.catalog.add_range_mapping(&self.map, shard, low, high).await
    }

    pub async fn delete_range_mapping(
        &self,
        mapping: &RangeMapping,
        location: ShardLocation,
        lock_token: Option<Uuid>,
    ) -> CatalogResult<()> {
        self.require_kind(ShardMapKind::Range)?;
        self.catalog.delete_range_mapping(&self.map, mapping, location, lock_token).await
    }

    pub async fn split_mapping(
        &self,
        mapping: &RangeMapping,
        location: ShardLocation,
        at: K,
        lock_token: Option<Uuid>,
    ) -> CatalogResult<(RangeMapping, RangeMapping)> {
        self.require_kind(ShardMapKind::Range)?;
        let at = self.encode(at)?;
        self.catalog.split_mapping(&self.map, mapping, location, at, lock_token).await
    }

    pub async fn merge_mappings(
        &self,
        left: &RangeMapping,
        right: &RangeMapping,
        location: ShardLocation,
        lock_token: Option<Uuid>,
    ) -> CatalogResult<RangeMapping> {
        self.require_kind(ShardMapKind::Range)?;
        self.catalog.merge_mappings(&self.map, left, right, location, lock_token).await
    }

    pub async fn update_range_mapping_status(
        &self,
        mapping: &RangeMapping,
        location: ShardLocation,
        new_status: Status,
        lock_token: Option<Uuid>,
    ) -> CatalogResult<RangeMapping> {
        self.require_kind(ShardMapKind::Range)?;
        self.catalog.update_range_mapping_status(&self.map, mapping, location, new_status, lock_token).await
    }

    pub async fn lock_range_mapping(&self, mapping: &RangeMapping, token: Uuid) -> CatalogResult<RangeMapping> {
        self.require_kind(ShardMapKind::Range)?;
        self.catalog.lock_range_mapping(&self.map, mapping, token).await
    }

    pub async fn unlock_range_mapping(&self, mapping: &RangeMapping, token: Uuid) -> CatalogResult<RangeMapping> {
        self.require_kind(ShardMapKind::Range)?;
        self.catalog.unlock_range_mapping(&self.map, mapping, token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::{LoadPolicy, ShardKeyType};
    use meridian_store::global::InMemoryGlobalStore;
    use meridian_store::local::InMemoryLocalStore;

    async fn int_map(kind: ShardMapKind) -> (Arc<Catalog>, ShardMap<i32>) {
        let catalog = Arc::new(Catalog::new(Arc::new(InMemoryGlobalStore::new()), LoadPolicy::Lazy));
        let map = catalog.create_map("orders", kind, ShardKeyType::Int32).await.unwrap();
        (catalog.clone(), ShardMap::new(catalog, map))
    }

    #[tokio::test]
    async fn range_map_rejects_list_mapping_calls() {
        let (catalog, map) = int_map(ShardMapKind::Range).await;
        let location = ShardLocation::new("srv", "db0");
        catalog.register_local_store(location.clone(), Arc::new(InMemoryLocalStore::new()));
        let shard = map.create_shard(location).await.unwrap();
        let err = map.add_list_mapping(&shard, 1).await.unwrap_err();
        assert_eq!(err.kind(), meridian_core::ErrorKind::NotSupported);
    }

    #[tokio::test]
    async fn get_shard_for_key_resolves_through_range_mapping() {
        let (catalog, map) = int_map(ShardMapKind::Range).await;
        let location = ShardLocation::new("srv", "db0");
        catalog.register_local_store(location.clone(), Arc::new(InMemoryLocalStore::new()));
        let shard = map.create_shard(location).await.unwrap();
        map.add_range_mapping(&shard, 0, 100).await.unwrap();

        let found = map.get_shard_for_key(50).unwrap();
        assert_eq!(found.id, shard.id);
    }

    #[tokio::test]
    async fn list_map_add_and_lookup() {
        let (catalog, map) = int_map(ShardMapKind::List).await;
        let location = ShardLocation::new("srv", "db0");
        catalog.register_local_store(location.clone(), Arc::new(InMemoryLocalStore::new()));
        let shard = map.create_shard(location).await.unwrap();
        map.add_list_mapping(&shard, 42).await.unwrap();

        let found = map.get_shard_for_key(42).unwrap();
        assert_eq!(found.id, shard.id);
        assert_eq!(map.list_list_mappings().len(), 1);
    }
}
