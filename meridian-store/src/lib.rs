//! The global/local store protocol (§4.2): versioned schema, advisory
//! per-map locking, the undo log, and the `do`/`undo`/`finalize` contract
//! every catalog mutation runs through.

pub mod global;
pub mod local;
pub mod operation;
pub mod ops;
pub mod schema;
pub mod undo;

pub use global::{GlobalStore, InMemoryGlobalStore, MapLockGuard};
pub use local::{InMemoryLocalStore, LocalStore, LocalStoreResolver};
pub use operation::{run_store_operation, StoreOperation};
pub use schema::SchemaVersion;
pub use undo::UndoLogEntry;
