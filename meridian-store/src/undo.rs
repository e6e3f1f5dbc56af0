//! Undo log entries recorded by every global-store mutation (§4.2).

use meridian_core::ShardLocation;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndoLogEntry {
    pub id: Uuid,
    pub map_id: Uuid,
    pub operation_name: String,
    /// Shards whose local store must reflect this change before the entry
    /// can be finalized.
    pub affected_shards: Vec<ShardLocation>,
    pub finalized: bool,
}

impl UndoLogEntry {
    pub fn new(map_id: Uuid, operation_name: impl Into<String>, affected_shards: Vec<ShardLocation>) -> Self {
        Self { id: Uuid::new_v4(), map_id, operation_name: operation_name.into(), affected_shards, finalized: false }
    }
}
