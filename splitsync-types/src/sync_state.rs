use crate::entities::EntityType;
use serde::{Deserialize, Serialize};

/// Write-once record of a temp id confirmed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    pub temp_id: String,
    pub server_id: i64,
    pub entity_type: EntityType,
    pub created_at: i64,
}

/// Singleton bookkeeping for the sync loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    /// Last drain followed by a successful pull of every cached table.
    pub last_full_sync_at: Option<i64>,
    /// Last drain that finished without transient failures.
    pub last_partial_sync_at: Option<i64>,
    /// Guards against overlapping drains. Cleared on startup.
    pub sync_in_progress: bool,
    pub drain_started_at: Option<i64>,
}
