//! Recovery manager (§4.3): reconciles a shard's local store with the
//! global store's view of it after a crash, partial operation, or manual
//! intervention left them disagreeing.

use meridian_core::{CatalogResult, ListMapping, RangeMapping, ShardLocation};
use meridian_store::global::GlobalStore;
use meridian_store::local::LocalStore;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// One disagreement between a shard's local mirror and the global store.
#[derive(Debug, Clone)]
pub enum MappingDifference {
    /// Present locally, absent (or pointing elsewhere) globally.
    Orphaned { mapping_id: Uuid },
    /// Present globally, absent locally.
    Missing { mapping_id: Uuid },
}

/// A resolution choice for a set of differences found on one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Rewrite the local store to match the global store's mappings.
    AuthoritativeGlobal,
    /// Rewrite the global store's mappings for this shard to match local.
    AuthoritativeLocal,
    /// Mark the shard `Offline` and leave the discrepancy for an operator.
    Detach,
}

/// The result of reconciling one shard: what was found, and what was done
/// about it once a [`Resolution`] was applied.
#[derive(Debug, Clone)]
pub struct ReconciliationReport {
    pub shard_id: Uuid,
    pub location: ShardLocation,
    pub differences: Vec<MappingDifference>,
    pub resolution: Option<Resolution>,
}

/// Diffs and repairs local/global mapping disagreement for one shard at a
/// time. Failures partway through a resolution leave the undo log intact
/// (the store-operation protocol already guarantees this); the report
/// simply reflects how far the resolution got.
pub struct RecoveryManager {
    global: Arc<dyn GlobalStore>,
}

impl RecoveryManager {
    pub fn new(global: Arc<dyn GlobalStore>) -> Self {
        Self { global }
    }

    /// Diffs the mappings a shard's local store believes it owns against
    /// the global store's view, without changing either side.
    pub fn diff(&self, map_id: Uuid, shard_id: Uuid, local: &dyn LocalStore) -> Vec<MappingDifference> {
        let global_list: Vec<ListMapping> =
            self.global.list_list_mappings(map_id).into_iter().filter(|m| m.shard_id == shard_id).collect();
        let global_range: Vec<RangeMapping> =
            self.global.list_range_mappings(map_id).into_iter().filter(|m| m.shard_id == shard_id).collect();
        let local_list = local.local_list_mappings();
        let local_range = local.local_range_mappings();

        let mut diffs = Vec::new();
        for m in &local_list {
            if !global_list.iter().any(|g| g.id == m.id) {
                diffs.push(MappingDifference::Orphaned { mapping_id: m.id });
            }
        }
        for m in &local_range {
            if !global_range.iter().any(|g| g.id == m.id) {
                diffs.push(MappingDifference::Orphaned { mapping_id: m.id });
            }
        }
        for m in &global_list {
            if !local_list.iter().any(|l| l.id == m.id) {
                diffs.push(MappingDifference::Missing { mapping_id: m.id });
            }
        }
        for m in &global_range {
            if !local_range.iter().any(|l| l.id == m.id) {
                diffs.push(MappingDifference::Missing { mapping_id: m.id });
            }
        }
        diffs
    }

    /// Applies `resolution` to reconcile `shard_id`'s local store against
    /// the global store, reporting what was found and done.
    pub fn reconcile(
        &self,
        map_id: Uuid,
        shard_id: Uuid,
        location: ShardLocation,
        local: &dyn LocalStore,
        resolution: Resolution,
    ) -> CatalogResult<ReconciliationReport> {
        let differences = self.diff(map_id, shard_id, local);
        if differences.is_empty() {
            return Ok(ReconciliationReport { shard_id, location, differences, resolution: None });
        }

        match resolution {
            Resolution::AuthoritativeGlobal => {
                info!(%shard_id, count = differences.len(), "recovery: rewriting local store from global");
                let global_list: Vec<ListMapping> =
                    self.global.list_list_mappings(map_id).into_iter().filter(|m| m.shard_id == shard_id).collect();
                let global_range: Vec<RangeMapping> =
                    self.global.list_range_mappings(map_id).into_iter().filter(|m| m.shard_id == shard_id).collect();
                for m in local.local_list_mappings() {
                    local.remove_list_mapping(m.id)?;
                }
                for m in local.local_range_mappings() {
                    local.remove_range_mapping(m.id)?;
                }
                for m in global_list {
                    local.reflect_list_mapping(m)?;
                }
                for m in global_range {
                    local.reflect_range_mapping(m)?;
                }
            }
            Resolution::AuthoritativeLocal => {
                warn!(%shard_id, count = differences.len(), "recovery: rewriting global store from local");
                for diff in &differences {
                    if let MappingDifference::Missing { mapping_id } = diff {
                        let _ = self.global.remove_list_mapping(*mapping_id);
                        let _ = self.global.remove_range_mapping(*mapping_id);
                    }
                }
                for m in local.local_list_mappings() {
                    let _ = self.global.insert_list_mapping(m);
                }
                for m in local.local_range_mappings() {
                    let _ = self.global.insert_range_mapping(m);
                }
            }
            Resolution::Detach => {
                warn!(%shard_id, count = differences.len(), "recovery: detaching shard pending manual review");
                self.global.set_shard_status(shard_id, meridian_core::Status::Offline)?;
            }
        }

        Ok(ReconciliationReport { shard_id, location, differences, resolution: Some(resolution) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::{EncodedKey, ShardKeyType, ShardMapKind, Status};
    use meridian_store::global::InMemoryGlobalStore;
    use meridian_store::local::InMemoryLocalStore;

    #[test]
    fn diff_finds_orphaned_local_mapping() {
        let global = Arc::new(InMemoryGlobalStore::new());
        let map = global.insert_map("orders", ShardMapKind::List, ShardKeyType::Int32).unwrap();
        let location = ShardLocation::new("srv", "db0");
        let shard = global.insert_shard(map.id, location.clone()).unwrap();
        let local = InMemoryLocalStore::new();
        local
            .reflect_list_mapping(ListMapping {
                id: Uuid::new_v4(),
                map_id: map.id,
                shard_id: shard.id,
                key: EncodedKey::Finite(vec![1]),
                status: Status::Online,
                lock_token: None,
                version: 1,
            })
            .unwrap();

        let manager = RecoveryManager::new(global);
        let diffs = manager.diff(map.id, shard.id, &local);
        assert_eq!(diffs.len(), 1);
        assert!(matches!(diffs[0], MappingDifference::Orphaned { .. }));
    }

    #[test]
    fn reconcile_authoritative_global_clears_orphan() {
        let global = Arc::new(InMemoryGlobalStore::new());
        let map = global.insert_map("orders", ShardMapKind::List, ShardKeyType::Int32).unwrap();
        let location = ShardLocation::new("srv", "db0");
        let shard = global.insert_shard(map.id, location.clone()).unwrap();
        let local = InMemoryLocalStore::new();
        local
            .reflect_list_mapping(ListMapping {
                id: Uuid::new_v4(),
                map_id: map.id,
                shard_id: shard.id,
                key: EncodedKey::Finite(vec![1]),
                status: Status::Online,
                lock_token: None,
                version: 1,
            })
            .unwrap();

        let manager = RecoveryManager::new(global);
        let report = manager.reconcile(map.id, shard.id, location, &local, Resolution::AuthoritativeGlobal).unwrap();
        assert_eq!(report.differences.len(), 1);
        assert!(local.local_list_mappings().is_empty());
    }
}
