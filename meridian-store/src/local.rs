//! The local store (LSM): the per-shard mirror of the mappings a shard
//! owns, plus its own schema version (§4.2, §6 "Local store").

use crate::schema::SchemaVersion;
use meridian_core::{CatalogError, CatalogResult, ListMapping, RangeMapping, ShardLocation};
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use uuid::Uuid;

/// Primitive operations against one shard's local store.
pub trait LocalStore: Send + Sync {
    fn schema_version(&self) -> SchemaVersion;
    fn upgrade(&self, target: SchemaVersion) -> CatalogResult<SchemaVersion>;

    fn reflect_list_mapping(&self, mapping: ListMapping) -> CatalogResult<()>;
    fn remove_list_mapping(&self, mapping_id: Uuid) -> CatalogResult<()>;
    fn reflect_range_mapping(&self, mapping: RangeMapping) -> CatalogResult<()>;
    fn remove_range_mapping(&self, mapping_id: Uuid) -> CatalogResult<()>;

    fn local_list_mappings(&self) -> Vec<ListMapping>;
    fn local_range_mappings(&self) -> Vec<RangeMapping>;
}

#[derive(Default)]
struct LocalState {
    schema_version: SchemaVersion,
    list_mappings: HashMap<Uuid, ListMapping>,
    range_mappings: HashMap<Uuid, RangeMapping>,
}

/// Reference in-memory implementation of one shard's [`LocalStore`].
pub struct InMemoryLocalStore {
    state: StdMutex<LocalState>,
}

impl InMemoryLocalStore {
    pub fn new() -> Self {
        Self { state: StdMutex::new(LocalState::default()) }
    }
}

impl Default for InMemoryLocalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore for InMemoryLocalStore {
    fn schema_version(&self) -> SchemaVersion {
        self.state.lock().unwrap().schema_version
    }

    fn upgrade(&self, target: SchemaVersion) -> CatalogResult<SchemaVersion> {
        let mut state = self.state.lock().unwrap();
        if target < state.schema_version {
            return Err(CatalogError::LocalStoreVersionMismatch {
                expected: state.schema_version.0,
                found: target.0,
            });
        }
        state.schema_version = target;
        Ok(target)
    }

    fn reflect_list_mapping(&self, mapping: ListMapping) -> CatalogResult<()> {
        self.state.lock().unwrap().list_mappings.insert(mapping.id, mapping);
        Ok(())
    }

    fn remove_list_mapping(&self, mapping_id: Uuid) -> CatalogResult<()> {
        self.state.lock().unwrap().list_mappings.remove(&mapping_id);
        Ok(())
    }

    fn reflect_range_mapping(&self, mapping: RangeMapping) -> CatalogResult<()> {
        self.state.lock().unwrap().range_mappings.insert(mapping.id, mapping);
        Ok(())
    }

    fn remove_range_mapping(&self, mapping_id: Uuid) -> CatalogResult<()> {
        self.state.lock().unwrap().range_mappings.remove(&mapping_id);
        Ok(())
    }

    fn local_list_mappings(&self) -> Vec<ListMapping> {
        self.state.lock().unwrap().list_mappings.values().cloned().collect()
    }

    fn local_range_mappings(&self) -> Vec<RangeMapping> {
        self.state.lock().unwrap().range_mappings.values().cloned().collect()
    }
}

/// Resolves the [`LocalStore`] for a shard location. Implemented by the
/// catalog, which owns the collection of per-shard local stores; kept as a
/// trait here so the store-operation runner does not depend on
/// `meridian-catalog`.
pub trait LocalStoreResolver: Send + Sync {
    fn resolve(&self, location: &ShardLocation) -> Option<std::sync::Arc<dyn LocalStore>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrade_rejects_downgrade() {
        let store = InMemoryLocalStore::new();
        store.upgrade(SchemaVersion(3)).unwrap();
        let err = store.upgrade(SchemaVersion(2)).unwrap_err();
        assert_eq!(err.kind(), meridian_core::ErrorKind::LocalStoreVersionMismatch);
    }
}
