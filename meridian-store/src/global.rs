//! The global store (GSM): the authoritative catalog database holding
//! shard maps, shards, mappings, the schema version, and the undo log
//! (§4.2, §6 "Catalog persistence").

use crate::schema::SchemaVersion;
use crate::undo::UndoLogEntry;
use meridian_core::{
    CatalogError, CatalogResult, EncodedKey, ListMapping, RangeMapping, Shard, ShardKeyType, ShardLocation,
    ShardMap, ShardMapKind,
};
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use uuid::Uuid;

/// Advisory, re-entrant per-map lock: the same `operation_id` may reacquire
/// without blocking; any other `operation_id` is refused until released.
pub struct MapLockGuard<'a> {
    store: &'a InMemoryGlobalStore,
    map_id: Uuid,
    reentered: bool,
}

impl Drop for MapLockGuard<'_> {
    fn drop(&mut self) {
        if !self.reentered {
            self.store.locks.lock().unwrap().remove(&self.map_id);
        }
    }
}

/// Primitive operations the catalog and the store-operation runner perform
/// against the authoritative store. A real implementation would issue the
/// stored-procedure calls described in §6; this trait is the substitution
/// point for that.
pub trait GlobalStore: Send + Sync {
    fn schema_version(&self) -> SchemaVersion;
    fn set_schema_version(&self, version: SchemaVersion);

    fn acquire_map_lock(&self, map_id: Uuid, operation_id: Uuid) -> CatalogResult<()>;
    fn release_map_lock(&self, map_id: Uuid, operation_id: Uuid);

    fn insert_map(&self, name: &str, kind: ShardMapKind, key_type: ShardKeyType) -> CatalogResult<ShardMap>;
    fn remove_map(&self, map_id: Uuid) -> CatalogResult<()>;
    fn get_map_by_name(&self, name: &str) -> Option<ShardMap>;
    fn get_map_by_id(&self, map_id: Uuid) -> Option<ShardMap>;
    fn list_maps(&self) -> Vec<ShardMap>;

    fn insert_shard(&self, map_id: Uuid, location: ShardLocation) -> CatalogResult<Shard>;
    fn remove_shard(&self, shard_id: Uuid) -> CatalogResult<()>;
    fn get_shard(&self, shard_id: Uuid) -> Option<Shard>;
    fn set_shard_status(&self, shard_id: Uuid, status: meridian_core::Status) -> CatalogResult<Shard>;
    fn list_shards(&self, map_id: Uuid) -> Vec<Shard>;
    fn list_distinct_locations(&self) -> Vec<ShardLocation>;

    fn insert_list_mapping(&self, mapping: ListMapping) -> CatalogResult<ListMapping>;
    fn remove_list_mapping(&self, mapping_id: Uuid) -> CatalogResult<ListMapping>;
    fn update_list_mapping(&self, mapping: ListMapping) -> CatalogResult<ListMapping>;
    fn list_list_mappings(&self, map_id: Uuid) -> Vec<ListMapping>;
    fn find_list_mapping(&self, map_id: Uuid, key: &EncodedKey) -> Option<ListMapping>;

    fn insert_range_mapping(&self, mapping: RangeMapping) -> CatalogResult<RangeMapping>;
    fn remove_range_mapping(&self, mapping_id: Uuid) -> CatalogResult<RangeMapping>;
    fn update_range_mapping(&self, mapping: RangeMapping) -> CatalogResult<RangeMapping>;
    fn list_range_mappings(&self, map_id: Uuid) -> Vec<RangeMapping>;
    fn find_range_mapping(&self, map_id: Uuid, key: &EncodedKey) -> Option<RangeMapping>;

    fn append_undo_entry(&self, entry: UndoLogEntry);
    fn finalize_undo_entry(&self, entry_id: Uuid);
    fn pending_undo_entries(&self) -> Vec<UndoLogEntry>;
}

#[derive(Default)]
struct GlobalState {
    schema_version: SchemaVersion,
    maps: HashMap<Uuid, ShardMap>,
    map_names: HashMap<String, Uuid>,
    shards: HashMap<Uuid, Shard>,
    list_mappings: HashMap<Uuid, ListMapping>,
    range_mappings: HashMap<Uuid, RangeMapping>,
    undo_log: HashMap<Uuid, UndoLogEntry>,
}

impl Default for SchemaVersion {
    fn default() -> Self {
        SchemaVersion::INITIAL
    }
}

/// Reference in-memory implementation of [`GlobalStore`], adequate for
/// embedding and for exercising the catalog and store-operation protocol in
/// tests without a real SQL backend.
pub struct InMemoryGlobalStore {
    state: StdMutex<GlobalState>,
    locks: StdMutex<HashMap<Uuid, Uuid>>,
}

impl InMemoryGlobalStore {
    pub fn new() -> Self {
        Self { state: StdMutex::new(GlobalState::default()), locks: StdMutex::new(HashMap::new()) }
    }

    /// Acquires the map lock and returns a guard releasing it on drop;
    /// convenience wrapper used by the store-operation runner.
    pub fn lock_map(&self, map_id: Uuid, operation_id: Uuid) -> CatalogResult<MapLockGuard<'_>> {
        let reentered = {
            let mut locks = self.locks.lock().unwrap();
            match locks.get(&map_id) {
                Some(holder) if *holder == operation_id => true,
                Some(_) => {
                    return Err(CatalogError::StorageOperationFailure {
                        message: format!("map {map_id} is locked by another operation"),
                    })
                }
                None => {
                    locks.insert(map_id, operation_id);
                    false
                }
            }
        };
        Ok(MapLockGuard { store: self, map_id, reentered })
    }
}

impl Default for InMemoryGlobalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalStore for InMemoryGlobalStore {
    fn schema_version(&self) -> SchemaVersion {
        self.state.lock().unwrap().schema_version
    }

    fn set_schema_version(&self, version: SchemaVersion) {
        self.state.lock().unwrap().schema_version = version;
    }

    fn acquire_map_lock(&self, map_id: Uuid, operation_id: Uuid) -> CatalogResult<()> {
        let mut locks = self.locks.lock().unwrap();
        match locks.get(&map_id) {
            Some(holder) if *holder == operation_id => Ok(()),
            Some(_) => Err(CatalogError::StorageOperationFailure {
                message: format!("map {map_id} is locked by another operation"),
            }),
            None => {
                locks.insert(map_id, operation_id);
                Ok(())
            }
        }
    }

    fn release_map_lock(&self, map_id: Uuid, operation_id: Uuid) {
        let mut locks = self.locks.lock().unwrap();
        if locks.get(&map_id) == Some(&operation_id) {
            locks.remove(&map_id);
        }
    }

    fn insert_map(&self, name: &str, kind: ShardMapKind, key_type: ShardKeyType) -> CatalogResult<ShardMap> {
        let mut state = self.state.lock().unwrap();
        if state.map_names.contains_key(name) {
            return Err(CatalogError::ShardMapAlreadyExists { name: name.to_string() });
        }
        let map = ShardMap { id: Uuid::new_v4(), name: name.to_string(), kind, key_type, version: 1 };
        state.map_names.insert(name.to_string(), map.id);
        state.maps.insert(map.id, map.clone());
        Ok(map)
    }

    fn remove_map(&self, map_id: Uuid) -> CatalogResult<()> {
        let mut state = self.state.lock().unwrap();
        let has_shards = state.shards.values().any(|s| s.map_id == map_id);
        if has_shards {
            return Err(CatalogError::ShardMapHasShards { name: map_id.to_string() });
        }
        let map = state
            .maps
            .remove(&map_id)
            .ok_or_else(|| CatalogError::ShardMapDoesNotExist { name: map_id.to_string() })?;
        state.map_names.remove(&map.name);
        Ok(())
    }

    fn get_map_by_name(&self, name: &str) -> Option<ShardMap> {
        let state = self.state.lock().unwrap();
        state.map_names.get(name).and_then(|id| state.maps.get(id)).cloned()
    }

    fn get_map_by_id(&self, map_id: Uuid) -> Option<ShardMap> {
        self.state.lock().unwrap().maps.get(&map_id).cloned()
    }

    fn list_maps(&self) -> Vec<ShardMap> {
        self.state.lock().unwrap().maps.values().cloned().collect()
    }

    fn insert_shard(&self, map_id: Uuid, location: ShardLocation) -> CatalogResult<Shard> {
        let mut state = self.state.lock().unwrap();
        if !state.maps.contains_key(&map_id) {
            return Err(CatalogError::ShardMapDoesNotExist { name: map_id.to_string() });
        }
        let dup = state.shards.values().any(|s| s.map_id == map_id && s.location == location);
        if dup {
            return Err(CatalogError::ShardLocationAlreadyExists {
                server: location.server.clone(),
                database: location.database.clone(),
            });
        }
        let shard = Shard { id: Uuid::new_v4(), map_id, location, status: meridian_core::Status::Online, version: 1 };
        state.shards.insert(shard.id, shard.clone());
        Ok(shard)
    }

    fn remove_shard(&self, shard_id: Uuid) -> CatalogResult<()> {
        let mut state = self.state.lock().unwrap();
        let has_mappings = state.list_mappings.values().any(|m| m.shard_id == shard_id)
            || state.range_mappings.values().any(|m| m.shard_id == shard_id);
        if has_mappings {
            return Err(CatalogError::ShardHasMappings { shard_id: shard_id.to_string() });
        }
        state
            .shards
            .remove(&shard_id)
            .ok_or_else(|| CatalogError::ShardDoesNotExist { shard_id: shard_id.to_string() })?;
        Ok(())
    }

    fn get_shard(&self, shard_id: Uuid) -> Option<Shard> {
        self.state.lock().unwrap().shards.get(&shard_id).cloned()
    }

    fn set_shard_status(&self, shard_id: Uuid, status: meridian_core::Status) -> CatalogResult<Shard> {
        let mut state = self.state.lock().unwrap();
        let shard = state
            .shards
            .get_mut(&shard_id)
            .ok_or_else(|| CatalogError::ShardDoesNotExist { shard_id: shard_id.to_string() })?;
        shard.status = status;
        shard.version += 1;
        Ok(shard.clone())
    }

    fn list_shards(&self, map_id: Uuid) -> Vec<Shard> {
        self.state.lock().unwrap().shards.values().filter(|s| s.map_id == map_id).cloned().collect()
    }

    fn list_distinct_locations(&self) -> Vec<ShardLocation> {
        let state = self.state.lock().unwrap();
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for shard in state.shards.values() {
            if seen.insert(shard.location.clone()) {
                out.push(shard.location.clone());
            }
        }
        out
    }

    fn insert_list_mapping(&self, mapping: ListMapping) -> CatalogResult<ListMapping> {
        let mut state = self.state.lock().unwrap();
        match state.shards.get(&mapping.shard_id) {
            Some(shard) if shard.map_id == mapping.map_id => {}
            _ => return Err(CatalogError::ShardDoesNotExist { shard_id: mapping.shard_id.to_string() }),
        }
        let dup = state.list_mappings.values().any(|m| m.map_id == mapping.map_id && m.key == mapping.key);
        if dup {
            return Err(CatalogError::MappingPointAlreadyMapped);
        }
        state.list_mappings.insert(mapping.id, mapping.clone());
        Ok(mapping)
    }

    fn remove_list_mapping(&self, mapping_id: Uuid) -> CatalogResult<ListMapping> {
        self.state
            .lock()
            .unwrap()
            .list_mappings
            .remove(&mapping_id)
            .ok_or_else(|| CatalogError::MappingDoesNotExist { mapping_id: mapping_id.to_string() })
    }

    fn update_list_mapping(&self, mapping: ListMapping) -> CatalogResult<ListMapping> {
        let mut state = self.state.lock().unwrap();
        if !state.list_mappings.contains_key(&mapping.id) {
            return Err(CatalogError::MappingDoesNotExist { mapping_id: mapping.id.to_string() });
        }
        state.list_mappings.insert(mapping.id, mapping.clone());
        Ok(mapping)
    }

    fn list_list_mappings(&self, map_id: Uuid) -> Vec<ListMapping> {
        self.state.lock().unwrap().list_mappings.values().filter(|m| m.map_id == map_id).cloned().collect()
    }

    fn find_list_mapping(&self, map_id: Uuid, key: &EncodedKey) -> Option<ListMapping> {
        self.state.lock().unwrap().list_mappings.values().find(|m| m.map_id == map_id && &m.key == key).cloned()
    }

    fn insert_range_mapping(&self, mapping: RangeMapping) -> CatalogResult<RangeMapping> {
        let mut state = self.state.lock().unwrap();
        match state.shards.get(&mapping.shard_id) {
            Some(shard) if shard.map_id == mapping.map_id => {}
            _ => return Err(CatalogError::ShardDoesNotExist { shard_id: mapping.shard_id.to_string() }),
        }
        let overlap = state
            .range_mappings
            .values()
            .any(|m| m.map_id == mapping.map_id && m.overlaps(&mapping.low, &mapping.high));
        if overlap {
            return Err(CatalogError::MappingRangeAlreadyMapped);
        }
        state.range_mappings.insert(mapping.id, mapping.clone());
        Ok(mapping)
    }

    fn remove_range_mapping(&self, mapping_id: Uuid) -> CatalogResult<RangeMapping> {
        self.state
            .lock()
            .unwrap()
            .range_mappings
            .remove(&mapping_id)
            .ok_or_else(|| CatalogError::MappingDoesNotExist { mapping_id: mapping_id.to_string() })
    }

    fn update_range_mapping(&self, mapping: RangeMapping) -> CatalogResult<RangeMapping> {
        let mut state = self.state.lock().unwrap();
        if !state.range_mappings.contains_key(&mapping.id) {
            return Err(CatalogError::MappingDoesNotExist { mapping_id: mapping.id.to_string() });
        }
        state.range_mappings.insert(mapping.id, mapping.clone());
        Ok(mapping)
    }

    fn list_range_mappings(&self, map_id: Uuid) -> Vec<RangeMapping> {
        self.state.lock().unwrap().range_mappings.values().filter(|m| m.map_id == map_id).cloned().collect()
    }

    fn find_range_mapping(&self, map_id: Uuid, key: &EncodedKey) -> Option<RangeMapping> {
        self.state.lock().unwrap().range_mappings.values().find(|m| m.map_id == map_id && m.contains(key)).cloned()
    }

    fn append_undo_entry(&self, entry: UndoLogEntry) {
        self.state.lock().unwrap().undo_log.insert(entry.id, entry);
    }

    fn finalize_undo_entry(&self, entry_id: Uuid) {
        if let Some(entry) = self.state.lock().unwrap().undo_log.get_mut(&entry_id) {
            entry.finalized = true;
        }
    }

    fn pending_undo_entries(&self) -> Vec<UndoLogEntry> {
        self.state.lock().unwrap().undo_log.values().filter(|e| !e.finalized).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_names_are_unique() {
        let store = InMemoryGlobalStore::new();
        store.insert_map("orders", ShardMapKind::Range, ShardKeyType::Int32).unwrap();
        let err = store.insert_map("orders", ShardMapKind::Range, ShardKeyType::Int32).unwrap_err();
        assert_eq!(err.kind(), meridian_core::ErrorKind::ShardMapAlreadyExists);
    }

    #[test]
    fn map_lock_is_reentrant_for_same_operation() {
        let store = InMemoryGlobalStore::new();
        let map_id = Uuid::new_v4();
        let op = Uuid::new_v4();
        store.acquire_map_lock(map_id, op).unwrap();
        store.acquire_map_lock(map_id, op).unwrap();
        let other = Uuid::new_v4();
        assert!(store.acquire_map_lock(map_id, other).is_err());
        store.release_map_lock(map_id, op);
        assert!(store.acquire_map_lock(map_id, other).is_ok());
    }

    #[test]
    fn deleting_map_with_shards_fails() {
        let store = InMemoryGlobalStore::new();
        let map = store.insert_map("orders", ShardMapKind::Range, ShardKeyType::Int32).unwrap();
        store.insert_shard(map.id, ShardLocation::new("srv", "db0")).unwrap();
        let err = store.remove_map(map.id).unwrap_err();
        assert_eq!(err.kind(), meridian_core::ErrorKind::ShardMapHasShards);
    }
}
