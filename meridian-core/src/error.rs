//! Error types for the shard map catalog and fan-out query engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The category a [`CatalogError`] belongs to, used for coarse-grained handling
/// and surfaced to callers alongside the error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Catalog,
    Map,
    ListMap,
    RangeMap,
    Recovery,
    SchemaInfo,
    Validation,
    General,
}

/// Machine-readable discriminant for a [`CatalogError`], stable across
/// serialization boundaries (property P9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ShardMapManagerStoreAlreadyExists,
    ShardMapManagerStoreDoesNotExist,
    ShardMapAlreadyExists,
    ShardMapLookupFailure,
    ShardMapHasShards,
    GlobalStoreVersionMismatch,
    LocalStoreVersionMismatch,
    InsufficientParameters,
    ShardHasMappings,
    ShardAlreadyExists,
    ShardLocationAlreadyExists,
    ShardVersionMismatch,
    MappingPointAlreadyMapped,
    MappingRangeAlreadyMapped,
    MappingDoesNotExist,
    MappingNotFoundForKey,
    MappingIsOffline,
    MappingIsNotOffline,
    MappingLockOwnerIdDoesNotMatch,
    MappingIsAlreadyLocked,
    LockNotAcquired,
    LockNotReleased,
    StorageOperationFailure,
    ShardMapDoesNotExist,
    ShardDoesNotExist,
    ShardNotValid,
    SchemaMismatch,
    InvalidKey,
    InvalidShardMapName,
    NotSupported,
    Canceled,
    Timeout,
    InternalError,
    UnexpectedError,
}

/// The single error type returned by every catalog, store, and codec
/// operation. Each variant names the §7 error kind it represents; the
/// `category()` and `kind()` accessors recover the machine-readable pair a
/// caller is expected to branch on instead of matching error text.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum CatalogError {
    #[error("shard map manager store already exists")]
    ShardMapManagerStoreAlreadyExists,

    #[error("shard map manager store does not exist")]
    ShardMapManagerStoreDoesNotExist,

    #[error("shard map already exists: {name}")]
    ShardMapAlreadyExists { name: String },

    #[error("shard map lookup failed: {name}")]
    ShardMapLookupFailure { name: String },

    #[error("shard map has shards: {name}")]
    ShardMapHasShards { name: String },

    #[error("global store version mismatch: expected {expected}, found {found}")]
    GlobalStoreVersionMismatch { expected: u64, found: u64 },

    #[error("local store version mismatch: expected {expected}, found {found}")]
    LocalStoreVersionMismatch { expected: u64, found: u64 },

    #[error("insufficient parameters: {message}")]
    InsufficientParameters { message: String },

    #[error("shard has mappings: {shard_id}")]
    ShardHasMappings { shard_id: String },

    #[error("shard already exists: {shard_id}")]
    ShardAlreadyExists { shard_id: String },

    #[error("shard location already exists: {server};{database}")]
    ShardLocationAlreadyExists { server: String, database: String },

    #[error("shard version mismatch: expected {expected}, found {found}")]
    ShardVersionMismatch { expected: u64, found: u64 },

    #[error("mapping point already mapped")]
    MappingPointAlreadyMapped,

    #[error("mapping range already mapped")]
    MappingRangeAlreadyMapped,

    #[error("mapping does not exist: {mapping_id}")]
    MappingDoesNotExist { mapping_id: String },

    #[error("no mapping found for key in map {map_name}")]
    MappingNotFoundForKey { map_name: String },

    #[error("mapping is offline: {mapping_id}")]
    MappingIsOffline { mapping_id: String },

    #[error("mapping is not offline: {mapping_id}")]
    MappingIsNotOffline { mapping_id: String },

    #[error("mapping lock owner id does not match")]
    MappingLockOwnerIdDoesNotMatch,

    #[error("mapping is already locked: {mapping_id}")]
    MappingIsAlreadyLocked { mapping_id: String },

    #[error("lock not acquired: {mapping_id}")]
    LockNotAcquired { mapping_id: String },

    #[error("lock not released: {mapping_id}")]
    LockNotReleased { mapping_id: String },

    #[error("storage operation failed: {message}")]
    StorageOperationFailure { message: String },

    #[error("shard map does not exist: {name}")]
    ShardMapDoesNotExist { name: String },

    #[error("shard does not exist: {shard_id}")]
    ShardDoesNotExist { shard_id: String },

    #[error("shard not valid: {message}")]
    ShardNotValid { message: String },

    #[error("schema mismatch: {message}")]
    SchemaMismatch { message: String },

    #[error("invalid key: {message}")]
    InvalidKey { message: String },

    #[error("invalid shard map name: {name}")]
    InvalidShardMapName { name: String },

    #[error("operation not supported: {message}")]
    NotSupported { message: String },

    #[error("operation canceled")]
    Canceled,

    #[error("operation timed out")]
    Timeout,

    #[error("internal error: {message}")]
    InternalError { message: String },

    #[error("unexpected error: {message}")]
    UnexpectedError { message: String },
}

impl CatalogError {
    /// The machine-readable kind this error represents.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ShardMapManagerStoreAlreadyExists => ErrorKind::ShardMapManagerStoreAlreadyExists,
            Self::ShardMapManagerStoreDoesNotExist => ErrorKind::ShardMapManagerStoreDoesNotExist,
            Self::ShardMapAlreadyExists { .. } => ErrorKind::ShardMapAlreadyExists,
            Self::ShardMapLookupFailure { .. } => ErrorKind::ShardMapLookupFailure,
            Self::ShardMapHasShards { .. } => ErrorKind::ShardMapHasShards,
            Self::GlobalStoreVersionMismatch { .. } => ErrorKind::GlobalStoreVersionMismatch,
            Self::LocalStoreVersionMismatch { .. } => ErrorKind::LocalStoreVersionMismatch,
            Self::InsufficientParameters { .. } => ErrorKind::InsufficientParameters,
            Self::ShardHasMappings { .. } => ErrorKind::ShardHasMappings,
            Self::ShardAlreadyExists { .. } => ErrorKind::ShardAlreadyExists,
            Self::ShardLocationAlreadyExists { .. } => ErrorKind::ShardLocationAlreadyExists,
            Self::ShardVersionMismatch { .. } => ErrorKind::ShardVersionMismatch,
            Self::MappingPointAlreadyMapped => ErrorKind::MappingPointAlreadyMapped,
            Self::MappingRangeAlreadyMapped => ErrorKind::MappingRangeAlreadyMapped,
            Self::MappingDoesNotExist { .. } => ErrorKind::MappingDoesNotExist,
            Self::MappingNotFoundForKey { .. } => ErrorKind::MappingNotFoundForKey,
            Self::MappingIsOffline { .. } => ErrorKind::MappingIsOffline,
            Self::MappingIsNotOffline { .. } => ErrorKind::MappingIsNotOffline,
            Self::MappingLockOwnerIdDoesNotMatch => ErrorKind::MappingLockOwnerIdDoesNotMatch,
            Self::MappingIsAlreadyLocked { .. } => ErrorKind::MappingIsAlreadyLocked,
            Self::LockNotAcquired { .. } => ErrorKind::LockNotAcquired,
            Self::LockNotReleased { .. } => ErrorKind::LockNotReleased,
            Self::StorageOperationFailure { .. } => ErrorKind::StorageOperationFailure,
            Self::ShardMapDoesNotExist { .. } => ErrorKind::ShardMapDoesNotExist,
            Self::ShardDoesNotExist { .. } => ErrorKind::ShardDoesNotExist,
            Self::ShardNotValid { .. } => ErrorKind::ShardNotValid,
            Self::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            Self::InvalidKey { .. } => ErrorKind::InvalidKey,
            Self::InvalidShardMapName { .. } => ErrorKind::InvalidShardMapName,
            Self::NotSupported { .. } => ErrorKind::NotSupported,
            Self::Canceled => ErrorKind::Canceled,
            Self::Timeout => ErrorKind::Timeout,
            Self::InternalError { .. } => ErrorKind::InternalError,
            Self::UnexpectedError { .. } => ErrorKind::UnexpectedError,
        }
    }

    /// The category this error's kind belongs to.
    pub fn category(&self) -> ErrorCategory {
        use ErrorCategory::*;
        match self.kind() {
            ErrorKind::ShardMapManagerStoreAlreadyExists
            | ErrorKind::ShardMapManagerStoreDoesNotExist
            | ErrorKind::StorageOperationFailure
            | ErrorKind::GlobalStoreVersionMismatch
            | ErrorKind::LocalStoreVersionMismatch => Catalog,

            ErrorKind::ShardMapAlreadyExists
            | ErrorKind::ShardMapLookupFailure
            | ErrorKind::ShardMapHasShards
            | ErrorKind::ShardMapDoesNotExist
            | ErrorKind::ShardHasMappings
            | ErrorKind::ShardAlreadyExists
            | ErrorKind::ShardLocationAlreadyExists
            | ErrorKind::ShardVersionMismatch
            | ErrorKind::ShardDoesNotExist
            | ErrorKind::ShardNotValid => Map,

            ErrorKind::MappingPointAlreadyMapped
            | ErrorKind::MappingDoesNotExist
            | ErrorKind::MappingNotFoundForKey
            | ErrorKind::MappingIsOffline
            | ErrorKind::MappingIsNotOffline
            | ErrorKind::MappingLockOwnerIdDoesNotMatch
            | ErrorKind::MappingIsAlreadyLocked
            | ErrorKind::LockNotAcquired
            | ErrorKind::LockNotReleased => ListMap,

            ErrorKind::MappingRangeAlreadyMapped => RangeMap,

            ErrorKind::SchemaMismatch => SchemaInfo,

            ErrorKind::InvalidKey | ErrorKind::InvalidShardMapName | ErrorKind::InsufficientParameters => {
                Validation
            }

            ErrorKind::NotSupported
            | ErrorKind::Canceled
            | ErrorKind::Timeout
            | ErrorKind::InternalError
            | ErrorKind::UnexpectedError => General,
        }
    }
}

/// Marker trait implemented by recovery-manager specific errors; recovery
/// failures are reported through [`CatalogError::StorageOperationFailure`]
/// but keep their own category for callers that want to filter on it.
impl CatalogError {
    pub fn recovery_failure(message: impl Into<String>) -> Self {
        CatalogError::StorageOperationFailure { message: message.into() }
    }
}

pub type CatalogResult<T> = Result<T, CatalogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_and_category_round_trip_through_json() {
        let err = CatalogError::MappingLockOwnerIdDoesNotMatch;
        let json = serde_json::to_string(&err).unwrap();
        let back: CatalogError = serde_json::from_str(&json).unwrap();
        assert_eq!(err.kind() as u32, back.kind() as u32);
        assert_eq!(
            format!("{:?}", err.category()),
            format!("{:?}", back.category())
        );
    }

    #[test]
    fn categories_partition_expected_kinds() {
        assert_eq!(
            CatalogError::InvalidShardMapName { name: "x".into() }.category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            CatalogError::MappingRangeAlreadyMapped.category(),
            ErrorCategory::RangeMap
        );
        assert_eq!(CatalogError::Timeout.category(), ErrorCategory::General);
    }
}
