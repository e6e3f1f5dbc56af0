//! The store operation protocol (§4.2): every catalog mutation runs through
//! a `do` / `undo` / `finalize` sequence against the global store, with an
//! optional reflection step on the local stores of the shards it touches.

use crate::global::GlobalStore;
use crate::local::{LocalStore, LocalStoreResolver};
use crate::schema::SchemaVersion;
use crate::undo::UndoLogEntry;
use meridian_core::CatalogError;
use meridian_core::CatalogResult;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One catalog mutation expressed as a store operation. `Output` is
/// whatever the operation hands back to the caller on success (e.g. the
/// created `ShardMap`).
pub trait StoreOperation {
    type Output: Clone;

    fn name(&self) -> &str;

    /// The advisory lock key this operation serializes on. For operations
    /// against an existing map this is the map's id; `create_map` has no
    /// map id yet and instead derives a deterministic key from the
    /// requested name, so two concurrent creations of the same name still
    /// serialize against each other.
    fn lock_key(&self) -> Uuid;

    /// The schema version this operation was compiled against, if it cares
    /// (most catalog operations do; recovery and upgrade operations do
    /// not).
    fn expected_schema_version(&self) -> Option<SchemaVersion> {
        None
    }

    /// Performs the logical change against the global store and returns
    /// the undo log entry plus the operation's result. Must bump the
    /// version of every record it touches.
    fn do_global(&self, global: &dyn GlobalStore) -> CatalogResult<(UndoLogEntry, Self::Output)>;

    /// Reflects the change onto one affected shard's local store.
    fn do_local(&self, output: &Self::Output, local: &dyn LocalStore) -> CatalogResult<()>;

    /// Rolls back the logical change recorded by `do_global`.
    fn undo_global(&self, global: &dyn GlobalStore, entry: &UndoLogEntry) -> CatalogResult<()>;
}

/// Runs `op` through the full protocol: schema-version check, advisory
/// map lock, `do_global`, per-shard `do_local`, then `finalize` on success
/// or `undo_global` plus `StorageOperationFailure` on any local failure.
pub fn run_store_operation<O: StoreOperation>(
    op: &O,
    global: &dyn GlobalStore,
    locals: &dyn LocalStoreResolver,
) -> CatalogResult<O::Output> {
    if let Some(expected) = op.expected_schema_version() {
        let actual = global.schema_version();
        if actual != expected {
            debug!(op = op.name(), expected = expected.0, found = actual.0, "schema version mismatch");
            return Err(CatalogError::GlobalStoreVersionMismatch { expected: expected.0, found: actual.0 });
        }
    }

    let operation_id = Uuid::new_v4();
    global.acquire_map_lock(op.lock_key(), operation_id)?;
    debug!(op = op.name(), map_id = %op.lock_key(), "do");

    let result = (|| {
        let (entry, output) = op.do_global(global)?;
        global.append_undo_entry(entry.clone());

        for location in &entry.affected_shards {
            let local = locals.resolve(location).ok_or_else(|| CatalogError::StorageOperationFailure {
                message: format!("no local store registered for shard {location}"),
            })?;
            if let Err(cause) = op.do_local(&output, local.as_ref()) {
                warn!(op = op.name(), %location, %cause, "local reflection failed, rolling back");
                op.undo_global(global, &entry)?;
                return Err(CatalogError::StorageOperationFailure {
                    message: format!("{}: local store reflection failed on {location}: {cause}", op.name()),
                });
            }
        }

        global.finalize_undo_entry(entry.id);
        Ok(output)
    })();

    global.release_map_lock(op.lock_key(), operation_id);

    match &result {
        Ok(_) => info!(op = op.name(), map_id = %op.lock_key(), "finalize"),
        Err(e) => warn!(op = op.name(), map_id = %op.lock_key(), error = %e, "operation failed"),
    }
    result
}
