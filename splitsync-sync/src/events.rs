//! Status stream published by the engine.

use crate::orchestrator::DrainReport;
use splitsync_types::{EntityId, EntityType, OperationId, OperationKind};

/// Events emitted for the UI layer. Queue failures surface here rather than
/// as errors returned to whoever happened to trigger the drain.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    ConnectivityChanged {
        online: bool,
    },
    DrainStarted {
        pending: usize,
    },
    OperationSynced {
        operation_id: OperationId,
        kind: OperationKind,
        entity_id: EntityId,
    },
    IdRemapped {
        entity_type: EntityType,
        temp_id: String,
        server_id: i64,
    },
    OperationRetrying {
        operation_id: OperationId,
        retry_count: u32,
        next_attempt_at: i64,
        error: String,
    },
    /// Needs user attention: discard or retry.
    OperationConflicted {
        operation_id: OperationId,
        kind: OperationKind,
        entity_id: EntityId,
        error: String,
    },
    DrainFinished(DrainReport),
    FullSyncFinished {
        at: i64,
    },
    FullSyncFailed {
        error: String,
    },
    /// Credentials were rejected; the drain stopped and nothing was lost.
    AuthRequired,
}
