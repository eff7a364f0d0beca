//! The durable operation queue.
//!
//! Operations are grouped by entity id and strictly FIFO within a group: only
//! a group's head may be sent, and a head that is in flight, in conflict, or
//! waiting out its backoff blocks everything queued behind it.
//!
//! Enqueueing coalesces where the server would never see the difference:
//! edits fold into a not-yet-sent create or update, and deleting an entity
//! whose create never left the device cancels the whole chain.

use crate::error::{SyncError, SyncResult};
use splitsync_storage::{LocalStore, StorageResult, StoreTxn};
use splitsync_types::{
    EntityId, EntityState, EntityType, NewExpense, NewGroup, Operation, OperationId,
    OperationStatus, PendingOperation,
};
use std::collections::HashSet;
use tracing::debug;

/// `last_error` prefix of operations put in conflict because something they
/// depend on failed.
pub const DEPENDENCY_ERROR_PREFIX: &str = "dependency failed: ";

/// What happened to an operation handed to [`OperationQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended as a new entry.
    Queued(OperationId),
    /// Folded into an existing, never-attempted entry.
    Coalesced(OperationId),
    /// Cancelled these queued entries instead; nothing will be sent.
    Cancelled(Vec<OperationId>),
}

impl EnqueueOutcome {
    /// The queue entry that now carries the mutation, if any.
    pub fn operation_id(&self) -> Option<OperationId> {
        match self {
            Self::Queued(id) | Self::Coalesced(id) => Some(*id),
            Self::Cancelled(_) => None,
        }
    }
}

#[derive(Clone)]
pub struct OperationQueue {
    store: LocalStore,
}

impl OperationQueue {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub fn enqueue(&self, op: PendingOperation) -> SyncResult<EnqueueOutcome> {
        Ok(self.store.write(|t| enqueue_in(t, op))?)
    }

    pub fn get(&self, id: &OperationId) -> SyncResult<Option<PendingOperation>> {
        Ok(self.store.read(|t| t.get_operation(id))?)
    }

    /// The whole queue in insertion order.
    pub fn list(&self) -> SyncResult<Vec<PendingOperation>> {
        Ok(self.store.read(|t| t.list_operations())?)
    }

    pub fn conflicts(&self) -> SyncResult<Vec<PendingOperation>> {
        Ok(self
            .store
            .read(|t| t.operations_with_status(OperationStatus::Conflict))?)
    }

    /// Entries not in conflict.
    pub fn pending_count(&self) -> SyncResult<usize> {
        Ok(self.store.read(|t| t.count_operations())?.0)
    }

    /// Group heads eligible to be sent at `now`, in insertion order.
    pub fn peek_ready(&self, now: i64) -> SyncResult<Vec<PendingOperation>> {
        let ops = self.list()?;
        Ok(ready_heads(&ops, now))
    }

    pub fn mark_processing(&self, id: &OperationId) -> SyncResult<PendingOperation> {
        self.store.write(|t| {
            update_in(t, id, |op| {
                op.status = OperationStatus::Processing;
            })
        })
    }

    /// Removes a confirmed entry.
    pub fn mark_done(&self, id: &OperationId) -> SyncResult<()> {
        self.store.write(|t| {
            let op = t
                .get_operation(id)?
                .ok_or_else(|| SyncError::NotFound(format!("operation {id}")))?;
            t.delete_operation(id)?;
            refresh_target(t, &op)?;
            Ok(())
        })
    }

    /// Records a transient failure: bumps `retry_count` and holds the entry
    /// until `retry_at`.
    pub fn mark_failed(
        &self,
        id: &OperationId,
        error: &str,
        retry_at: i64,
    ) -> SyncResult<PendingOperation> {
        self.store.write(|t| {
            update_in(t, id, |op| {
                op.status = OperationStatus::Failed;
                op.retry_count += 1;
                op.last_error = Some(error.to_string());
                op.next_attempt_at = Some(retry_at);
            })
        })
    }

    pub fn mark_conflict(&self, id: &OperationId, error: &str) -> SyncResult<PendingOperation> {
        self.store.write(|t| {
            update_in(t, id, |op| {
                op.status = OperationStatus::Conflict;
                op.last_error = Some(error.to_string());
            })
        })
    }

    /// Returns an entry to `pending` without counting an attempt.
    pub fn mark_pending(&self, id: &OperationId) -> SyncResult<PendingOperation> {
        self.store.write(|t| {
            update_in(t, id, |op| {
                op.status = OperationStatus::Pending;
            })
        })
    }

    /// Startup recovery: entries left `processing` by a crash go back to
    /// `pending`, and every row state is recomputed from the queue.
    pub fn reset_in_flight(&self) -> SyncResult<usize> {
        Ok(self.store.write(|t| -> StorageResult<usize> {
            let n = t.reset_processing()?;
            for op in t.list_operations()? {
                refresh_target(t, &op)?;
            }
            Ok(n)
        })?)
    }

    /// Earliest backoff deadline still in the future.
    pub fn next_retry_at(&self, now: i64) -> SyncResult<Option<i64>> {
        let failed = self
            .store
            .read(|t| t.operations_with_status(OperationStatus::Failed))?;
        Ok(failed
            .iter()
            .filter_map(|op| op.next_attempt_at)
            .filter(|at| *at > now)
            .min())
    }
}

/// Applies `f` to a stored entry, persists it, and refreshes its row state.
pub(crate) fn update_in(
    t: &StoreTxn<'_>,
    id: &OperationId,
    f: impl FnOnce(&mut PendingOperation),
) -> SyncResult<PendingOperation> {
    let mut op = t
        .get_operation(id)?
        .ok_or_else(|| SyncError::NotFound(format!("operation {id}")))?;
    f(&mut op);
    t.update_operation(&op)?;
    refresh_target(t, &op)?;
    Ok(op)
}

/// Recomputes the sync state of the row an operation targets.
pub(crate) fn refresh_target(t: &StoreTxn<'_>, op: &PendingOperation) -> StorageResult<()> {
    let (entity_type, id) = op.operation.state_target();
    let id = t.resolve_id(id)?;
    refresh_row_state(t, entity_type, &id)
}

/// A row is `Conflicted` if any queued operation on it is in conflict,
/// `Syncing` if one is in flight, `Local` if any remain, else `Confirmed`.
pub(crate) fn refresh_row_state(
    t: &StoreTxn<'_>,
    entity_type: EntityType,
    id: &EntityId,
) -> StorageResult<()> {
    let ops = t.list_operations()?;
    let mut state = EntityState::Confirmed;
    for op in &ops {
        let (ty, target) = op.operation.state_target();
        if ty != entity_type || target != id {
            continue;
        }
        state = match (state, op.status) {
            (_, OperationStatus::Conflict) | (EntityState::Conflicted, _) => EntityState::Conflicted,
            (_, OperationStatus::Processing) | (EntityState::Syncing, _) => EntityState::Syncing,
            _ => EntityState::Local,
        };
    }
    t.set_sync_state(entity_type, id, state)?;
    Ok(())
}

/// First entry of every entity group, kept only if it may be sent at `now`.
pub(crate) fn ready_heads(ops: &[PendingOperation], now: i64) -> Vec<PendingOperation> {
    let mut seen: HashSet<EntityId> = HashSet::new();
    ops.iter()
        .filter(|op| seen.insert(op.entity_id().clone()))
        .filter(|op| op.is_ready(now))
        .cloned()
        .collect()
}

/// Entries that cannot succeed without `root`: later entries on the entity it
/// creates and, transitively, anything referencing an id created along the way.
/// Returned in insertion order.
pub(crate) fn dependents(ops: &[PendingOperation], root: &PendingOperation) -> Vec<OperationId> {
    let mut created: Vec<EntityId> = root.operation.created_id().cloned().into_iter().collect();
    let mut found: HashSet<OperationId> = HashSet::new();
    let mut changed = !created.is_empty();
    while changed {
        changed = false;
        for op in ops {
            if op.id == root.id || found.contains(&op.id) {
                continue;
            }
            let refs = op.operation.temp_references();
            if created
                .iter()
                .any(|id| op.entity_id() == id || refs.contains(id))
            {
                found.insert(op.id);
                if let Some(id) = op.operation.created_id()
                    && !created.contains(id)
                {
                    created.push(id.clone());
                }
                changed = true;
            }
        }
    }
    ops.iter()
        .filter(|op| found.contains(&op.id))
        .map(|op| op.id)
        .collect()
}

/// Folds a later edit into a queued create or update of the same entity.
fn fold_update(queued: &Operation, later: &Operation) -> Option<Operation> {
    match (queued, later) {
        (Operation::CreateExpense(new), Operation::UpdateExpense { changes, .. }) => {
            Some(Operation::CreateExpense(NewExpense {
                client_id: new.client_id.clone(),
                expense: changes.clone(),
            }))
        }
        (Operation::UpdateExpense { expense_id, .. }, Operation::UpdateExpense { changes, .. }) => {
            Some(Operation::UpdateExpense {
                expense_id: expense_id.clone(),
                changes: changes.clone(),
            })
        }
        (Operation::CreateGroup(new), Operation::UpdateGroup { changes, .. }) => {
            let mut draft = new.group.clone();
            changes.apply_to_draft(&mut draft).then(|| {
                Operation::CreateGroup(NewGroup {
                    client_id: new.client_id.clone(),
                    group: draft,
                })
            })
        }
        (
            Operation::UpdateGroup {
                group_id,
                changes: earlier,
            },
            Operation::UpdateGroup { changes, .. },
        ) => {
            let mut merged = earlier.clone();
            merged.merge(changes.clone());
            Some(Operation::UpdateGroup {
                group_id: group_id.clone(),
                changes: merged,
            })
        }
        _ => None,
    }
}

fn is_update(op: &Operation) -> bool {
    matches!(
        op,
        Operation::UpdateExpense { .. } | Operation::UpdateGroup { .. }
    )
}

/// Deletes `cancel` from the queue along with the cached rows their creates
/// introduced.
fn cancel_in(
    t: &StoreTxn<'_>,
    all: &[PendingOperation],
    cancel: &[OperationId],
) -> StorageResult<()> {
    for op in all.iter().filter(|op| cancel.contains(&op.id)) {
        t.delete_operation(&op.id)?;
        if let Some(created) = op.operation.created_id() {
            match op.entity_type() {
                EntityType::Expense => {
                    t.delete_expense(created)?;
                }
                EntityType::Group => {
                    t.delete_group(created)?;
                }
                _ => {}
            }
        }
    }
    for op in all.iter().filter(|op| cancel.contains(&op.id)) {
        refresh_target(t, op)?;
    }
    Ok(())
}

/// Enqueue inside an existing transaction, so a repository write and its
/// queue entry commit together.
pub(crate) fn enqueue_in(
    t: &StoreTxn<'_>,
    mut op: PendingOperation,
) -> StorageResult<EnqueueOutcome> {
    let entity_ops = t.operations_for_entity(op.entity_id())?;

    if is_update(&op.operation)
        && let Some(latest) = entity_ops.last()
        && latest.is_untouched()
        && let Some(folded) = fold_update(&latest.operation, &op.operation)
    {
        let mut target = latest.clone();
        target.operation = folded;
        target.base_version = op.base_version;
        t.update_operation(&target)?;
        debug!(op = %target.id, kind = %target.kind(), "coalesced edit into queued operation");
        return Ok(EnqueueOutcome::Coalesced(target.id));
    }

    // Deleting something the server never heard of: drop the whole chain.
    if op.operation.is_delete()
        && op.entity_id().is_temp()
        && let Some(first) = entity_ops.first()
        && first.operation.is_create()
        && first.is_untouched()
    {
        let all = t.list_operations()?;
        let outside_refs = all.iter().any(|o| {
            o.entity_id() != op.entity_id() && o.operation.temp_references().contains(op.entity_id())
        });
        // A guest still referenced elsewhere has to exist server-side first.
        let cascade = !matches!(op.operation, Operation::RemoveGuest { .. });
        if cascade || !outside_refs {
            let mut cancel: Vec<OperationId> = entity_ops.iter().map(|o| o.id).collect();
            if cascade {
                for id in dependents(&all, first) {
                    if !cancel.contains(&id) {
                        cancel.push(id);
                    }
                }
            }
            cancel_in(t, &all, &cancel)?;
            debug!(
                entity = %op.entity_id(),
                cancelled = cancel.len(),
                "delete of unsent entity cancelled queued operations"
            );
            return Ok(EnqueueOutcome::Cancelled(cancel));
        }
    }

    // A delete supersedes the trailing run of unsent updates, keeping the
    // earliest snapshot for rollback.
    if op.operation.is_delete() {
        for prior in entity_ops.iter().rev() {
            if !prior.is_untouched() || !is_update(&prior.operation) {
                break;
            }
            if let Some(rollback) = &prior.rollback {
                op.rollback = Some(rollback.clone());
            }
            t.delete_operation(&prior.id)?;
            debug!(op = %prior.id, "update superseded by delete");
        }
    }

    t.insert_operation(&mut op)?;
    debug!(op = %op.id, kind = %op.kind(), entity = %op.entity_id(), seq = op.seq, "operation queued");
    Ok(EnqueueOutcome::Queued(op.id))
}
