//! Core types for the splitsync offline-first engine.
//!
//! Everything that crosses a crate boundary lives here:
//! - Entity and operation identifiers, including client-generated temp ids
//! - Cached entity shapes (groups, expenses, balances, users, exchange rates)
//! - The closed set of queued mutations and their pending-operation rows
//! - Id mappings and the sync metadata singleton

mod entities;
mod error;
mod ids;
mod operation;
mod sync_state;

pub use entities::{
    CachedBalance, CachedExpense, CachedGroup, CachedUser, EntityState, EntityType, ExchangeRate,
    ExpenseItem, GroupMember, Guest, ItemAssignment, ItemSplitOverride, ParticipantKind, Split,
    SplitType,
};
pub use error::TypesError;
pub use ids::{replace_id_in_json, EntityId, OperationId, TEMP_ID_PREFIX};
pub use operation::{
    ExpenseDraft, GroupDraft, GroupPatch, GuestDraft, GuestManagerChange, NewExpense, NewGroup,
    NewGuest, NewSettlement, Operation, OperationKind, OperationStatus, PendingOperation, Rollback,
    SettlementDraft,
};
pub use sync_state::{IdMapping, SyncMetadata};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
