//! Shared types for the shard map catalog and fan-out query engine: the key
//! codec, the data model, configuration enums, and the error type every
//! other crate in the workspace propagates.

pub mod config;
pub mod error;
pub mod key;
pub mod model;

pub use config::{
    CreateMode, EngineConfig, ExecutionOptions, ExecutionPolicy, LoadPolicy, RetryBehavior, RetryPolicyConfig,
};
pub use error::{CatalogError, CatalogResult, ErrorCategory, ErrorKind};
pub use key::{EncodedKey, ShardKeyType, ShardKeyValue};
pub use model::{ListMapping, RangeMapping, Shard, ShardLocation, ShardMap, ShardMapKind, Status};
