//! Public facade for the shard map catalog and fan-out query engine
//! (spec.md §6): re-exports [`Catalog`] and the generic
//! [`ShardMap`]/[`MultiShardConnection`]/[`MultiShardCommand`]/
//! [`MultiShardDataReader`] surface a caller actually touches, leaving the
//! catalog, store, retry, and executor internals to their own crates.

mod multi_shard;
mod shard_map;

pub use meridian_catalog::{Catalog, SchemaInfo};
pub use meridian_core::{
    CatalogError, CatalogResult, CreateMode, EncodedKey, EngineConfig, ErrorCategory, ErrorKind, ExecutionOptions,
    ExecutionPolicy, ListMapping, LoadPolicy, RangeMapping, RetryBehavior, RetryPolicyConfig, Shard, ShardKeyType,
    ShardKeyValue, ShardLocation, ShardMapKind, Status,
};
pub use meridian_executor::{
    CancellationSignal, ColumnSchema, ColumnType, ExecutorEvent, ExecutorEventSink, FanoutError, Row, RowSchema,
    ShardConnection, ShardDriver, ShardRowCursor, Value,
};
pub use multi_shard::{MultiShardCommand, MultiShardConnection, MultiShardDataReader};
pub use shard_map::ShardMap;
