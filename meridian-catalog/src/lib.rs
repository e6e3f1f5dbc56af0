//! The shard map catalog (§4.3): typed operations over shard maps, shards,
//! and mappings, backed by the global/local store protocol and a versioned
//! client-side cache (I6).

pub mod cache;
pub mod catalog;
pub mod recovery;

pub use cache::{CachedMap, CatalogMetrics, ShardMapCache};
pub use catalog::{Catalog, SchemaInfo};
pub use recovery::{MappingDifference, ReconciliationReport, RecoveryManager, Resolution};
