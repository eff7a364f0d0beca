//! Entity Repository: the only way the UI reads or changes cached data.
//!
//! Reads never touch the network. A write validates the mutation, applies it
//! optimistically to the cache, and queues the matching operation, all inside
//! one store transaction: either the user sees the edit and it is queued, or
//! neither happens.

use crate::connectivity::ConnectivityHandle;
use crate::error::{SyncError, SyncResult};
use crate::queue::{self, EnqueueOutcome};
use crate::remapper::resolve_in;
use crate::validation::{self, SplitValidator};
use splitsync_storage::{LocalStore, StoreTxn};
use splitsync_types::{
    now_millis, CachedBalance, CachedExpense, CachedGroup, CachedUser, EntityId, EntityState,
    EntityType, ExchangeRate, ExpenseDraft, GroupDraft, GroupMember, GroupPatch, Guest,
    GuestDraft, NewExpense, NewGroup, NewGuest, NewSettlement, Operation, OperationId,
    ParticipantKind, PendingOperation, Rollback, SettlementDraft,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// A user-intent change, before ids are assigned.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    CreateExpense(ExpenseDraft),
    UpdateExpense {
        expense_id: EntityId,
        changes: ExpenseDraft,
    },
    DeleteExpense {
        expense_id: EntityId,
    },
    CreateGroup(GroupDraft),
    UpdateGroup {
        group_id: EntityId,
        changes: GroupPatch,
    },
    DeleteGroup {
        group_id: EntityId,
    },
    SettleUp(SettlementDraft),
    AddMember {
        group_id: EntityId,
        user_id: i64,
    },
    RemoveMember {
        group_id: EntityId,
        user_id: i64,
    },
    AddGuest {
        group_id: EntityId,
        guest: GuestDraft,
    },
    RemoveGuest {
        group_id: EntityId,
        guest_id: EntityId,
    },
}

impl Mutation {
    /// Creates get a fresh temp id here.
    fn into_operation(self) -> Operation {
        match self {
            Self::CreateExpense(expense) => Operation::CreateExpense(NewExpense {
                client_id: EntityId::new_temp(),
                expense,
            }),
            Self::UpdateExpense {
                expense_id,
                changes,
            } => Operation::UpdateExpense {
                expense_id,
                changes,
            },
            Self::DeleteExpense { expense_id } => Operation::DeleteExpense { expense_id },
            Self::CreateGroup(group) => Operation::CreateGroup(NewGroup {
                client_id: EntityId::new_temp(),
                group,
            }),
            Self::UpdateGroup { group_id, changes } => Operation::UpdateGroup { group_id, changes },
            Self::DeleteGroup { group_id } => Operation::DeleteGroup { group_id },
            Self::SettleUp(settlement) => Operation::SettleUp(NewSettlement {
                client_id: EntityId::new_temp(),
                settlement,
            }),
            Self::AddMember { group_id, user_id } => Operation::AddMember { group_id, user_id },
            Self::RemoveMember { group_id, user_id } => {
                Operation::RemoveMember { group_id, user_id }
            }
            Self::AddGuest { group_id, guest } => Operation::AddGuest(NewGuest {
                client_id: EntityId::new_temp(),
                group_id,
                guest,
            }),
            Self::RemoveGuest { group_id, guest_id } => {
                Operation::RemoveGuest { group_id, guest_id }
            }
        }
    }
}

/// Result of [`EntityRepository::write`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    /// The affected entity; a fresh temp id for creates.
    pub entity_id: EntityId,
    /// The queue entry carrying the change. `None` when the write cancelled
    /// queued work instead (deleting something never sent).
    pub operation_id: Option<OperationId>,
    /// The device was offline; the change syncs on reconnect.
    pub offline: bool,
}

/// A cached row of any addressable kind.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedEntity {
    User(CachedUser),
    Group(CachedGroup),
    Expense(CachedExpense),
    Guest(Guest),
}

#[derive(Clone)]
pub struct EntityRepository {
    store: LocalStore,
    validator: Arc<dyn SplitValidator>,
    connectivity: ConnectivityHandle,
}

impl EntityRepository {
    pub fn new(
        store: LocalStore,
        validator: Arc<dyn SplitValidator>,
        connectivity: ConnectivityHandle,
    ) -> Self {
        Self {
            store,
            validator,
            connectivity,
        }
    }

    // ---- reads ----

    /// Looks up one cached row. Temp ids already confirmed by the server
    /// resolve to their canonical row.
    pub fn read(&self, entity_type: EntityType, id: &EntityId) -> SyncResult<Option<CachedEntity>> {
        self.store.read(|t| {
            let id = t.resolve_id(id)?;
            Ok(match entity_type {
                EntityType::Group => t.get_group(&id)?.map(CachedEntity::Group),
                EntityType::Expense => t.get_expense(&id)?.map(CachedEntity::Expense),
                EntityType::User => match id.as_canonical() {
                    Some(uid) => t.get_user(uid)?.map(CachedEntity::User),
                    None => None,
                },
                EntityType::Guest => t
                    .list_groups()?
                    .into_iter()
                    .find_map(|g| g.guest(&id).cloned())
                    .map(CachedEntity::Guest),
                EntityType::Balance | EntityType::ExchangeRate => {
                    return Err(SyncError::Validation(format!(
                        "{entity_type} rows are not addressable by id"
                    )));
                }
            })
        })
    }

    pub fn group(&self, id: &EntityId) -> SyncResult<Option<CachedGroup>> {
        Ok(self
            .store
            .read(|t| t.resolve_id(id).and_then(|id| t.get_group(&id)))?)
    }

    pub fn expense(&self, id: &EntityId) -> SyncResult<Option<CachedExpense>> {
        Ok(self
            .store
            .read(|t| t.resolve_id(id).and_then(|id| t.get_expense(&id)))?)
    }

    pub fn groups(&self) -> SyncResult<Vec<CachedGroup>> {
        Ok(self.store.read(|t| t.list_groups())?)
    }

    pub fn expenses_for_group(&self, group_id: &EntityId) -> SyncResult<Vec<CachedExpense>> {
        Ok(self
            .store
            .read(|t| t.resolve_id(group_id).and_then(|id| t.expenses_for_group(&id)))?)
    }

    pub fn users(&self) -> SyncResult<Vec<CachedUser>> {
        Ok(self.store.read(|t| t.list_users())?)
    }

    /// Balances of one group, or the cross-group totals for `None`.
    pub fn balances_for_group(&self, group_id: Option<&EntityId>) -> SyncResult<Vec<CachedBalance>> {
        Ok(self.store.read(|t| match group_id {
            Some(id) => {
                let id = t.resolve_id(id)?;
                t.balances(Some(&id))
            }
            None => t.balances(None),
        })?)
    }

    pub fn exchange_rates(&self, base: &str) -> SyncResult<Vec<ExchangeRate>> {
        Ok(self.store.read(|t| t.exchange_rates_for(base))?)
    }

    /// Group balances with every managed guest rolled up into the member (or
    /// unmanaged guest) at the top of its manager chain.
    pub fn aggregated_balances(&self, group_id: &EntityId) -> SyncResult<Vec<CachedBalance>> {
        let (group, balances) = self.store.read(|t| -> SyncResult<_> {
            let id = t.resolve_id(group_id)?;
            let group = t
                .get_group(&id)?
                .ok_or_else(|| SyncError::NotFound(format!("group {id}")))?;
            let balances = t.balances(Some(&id))?;
            Ok((group, balances))
        })?;

        let mut totals: BTreeMap<(EntityId, bool, String), CachedBalance> = BTreeMap::new();
        for balance in balances {
            let (owner, is_guest) = if balance.is_guest {
                top_manager(&group, &balance.participant_id)
            } else {
                (balance.participant_id.clone(), false)
            };
            totals
                .entry((owner.clone(), is_guest, balance.currency.clone()))
                .and_modify(|b| b.amount += balance.amount)
                .or_insert(CachedBalance {
                    participant_id: owner,
                    is_guest,
                    ..balance
                });
        }
        Ok(totals.into_values().collect())
    }

    // ---- writes ----

    /// Validates, applies optimistically, and queues `mutation`.
    pub fn write(&self, mutation: Mutation) -> SyncResult<WriteOutcome> {
        let mut operation = mutation.into_operation();
        let validator = self.validator.clone();
        let now = now_millis();

        let outcome = self.store.write(|t| -> SyncResult<EnqueueOutcome> {
            resolve_in(t, &mut operation)?;
            check_references(t, &operation)?;
            let (base_version, rollback) = apply_optimistic(t, &operation, &*validator, now)?;
            let op = PendingOperation::new(operation.clone(), base_version, rollback, now);
            Ok(queue::enqueue_in(t, op)?)
        })?;

        let offline = !self.connectivity.is_online();
        debug!(
            kind = %operation.kind(),
            entity = %operation.entity_id(),
            offline,
            "local write applied"
        );
        if !offline {
            self.connectivity.nudge();
        }
        Ok(WriteOutcome {
            entity_id: operation.entity_id().clone(),
            operation_id: outcome.operation_id(),
            offline,
        })
    }
}

/// Follows guest managers upwards; stops at a member, an unmanaged guest, or
/// a repeated guest.
fn top_manager(group: &CachedGroup, guest_id: &EntityId) -> (EntityId, bool) {
    let mut current = (guest_id.clone(), true);
    let mut seen: HashSet<EntityId> = HashSet::new();
    while current.1 && seen.insert(current.0.clone()) {
        let Some((manager, kind)) = group.guest(&current.0).and_then(|g| g.manager()) else {
            break;
        };
        current = (manager.clone(), kind == ParticipantKind::Guest);
    }
    current
}

/// Every temp id the operation mentions must be a cached row, a guest of a
/// cached group, or the id a queued create will bring into existence.
fn check_references(t: &StoreTxn<'_>, operation: &Operation) -> SyncResult<()> {
    let refs = operation.temp_references();
    if refs.is_empty() {
        return Ok(());
    }
    let queued: HashSet<EntityId> = t
        .list_operations()?
        .iter()
        .filter_map(|op| op.operation.created_id().cloned())
        .collect();
    let groups = t.list_groups()?;
    for id in refs {
        let known = queued.contains(&id)
            || groups.iter().any(|g| g.id == id || g.guest(&id).is_some())
            || t.get_expense(&id)?.is_some();
        if !known {
            return Err(SyncError::Validation(format!("unknown temp id {id}")));
        }
    }
    Ok(())
}

fn load_group(t: &StoreTxn<'_>, id: &EntityId) -> SyncResult<CachedGroup> {
    t.get_group(id)?
        .ok_or_else(|| SyncError::NotFound(format!("group {id}")))
}

fn load_expense(t: &StoreTxn<'_>, id: &EntityId) -> SyncResult<CachedExpense> {
    t.get_expense(id)?
        .ok_or_else(|| SyncError::NotFound(format!("expense {id}")))
}

/// Bumps the version of a changed group, stores it, and returns the
/// pre-change snapshot as the rollback.
fn commit_group(
    t: &StoreTxn<'_>,
    before: CachedGroup,
    mut after: CachedGroup,
    now: i64,
) -> SyncResult<(u64, Option<Rollback>)> {
    after.local_version = before.local_version + 1;
    after.sync_state = EntityState::Local;
    after.cached_at = now;
    t.put_group(&after)?;
    Ok((
        after.local_version,
        Some(Rollback::Restore {
            groups: vec![before],
            expenses: Vec::new(),
        }),
    ))
}

/// Applies the operation to the cache. Returns the target row's version after
/// the edit and how to undo it.
fn apply_optimistic(
    t: &StoreTxn<'_>,
    operation: &Operation,
    validator: &dyn SplitValidator,
    now: i64,
) -> SyncResult<(u64, Option<Rollback>)> {
    match operation {
        Operation::CreateExpense(new) => {
            validation::check_expense(&new.expense, validator).map_err(SyncError::Validation)?;
            let expense = new.expense.clone().into_expense(new.client_id.clone(), 1, now);
            t.put_expense(&expense)?;
            Ok((
                1,
                Some(Rollback::Remove {
                    entity_type: EntityType::Expense,
                    id: new.client_id.clone(),
                }),
            ))
        }
        Operation::UpdateExpense {
            expense_id,
            changes,
        } => {
            validation::check_expense(changes, validator).map_err(SyncError::Validation)?;
            let before = load_expense(t, expense_id)?;
            let mut after = before.clone();
            changes.apply_to(&mut after);
            after.local_version = before.local_version + 1;
            after.sync_state = EntityState::Local;
            after.cached_at = now;
            t.put_expense(&after)?;
            Ok((
                after.local_version,
                Some(Rollback::Restore {
                    groups: Vec::new(),
                    expenses: vec![before],
                }),
            ))
        }
        Operation::DeleteExpense { expense_id } => {
            let before = load_expense(t, expense_id)?;
            t.delete_expense(expense_id)?;
            Ok((
                before.local_version,
                Some(Rollback::Restore {
                    groups: Vec::new(),
                    expenses: vec![before],
                }),
            ))
        }
        Operation::CreateGroup(new) => {
            validation::check_group(&new.group).map_err(SyncError::Validation)?;
            let group = new.group.clone().into_group(new.client_id.clone(), 1, now);
            t.put_group(&group)?;
            Ok((
                1,
                Some(Rollback::Remove {
                    entity_type: EntityType::Group,
                    id: new.client_id.clone(),
                }),
            ))
        }
        Operation::UpdateGroup { group_id, changes } => {
            if changes.is_empty() {
                return Err(SyncError::Validation("group update changes nothing".into()));
            }
            let before = load_group(t, group_id)?;
            let mut after = before.clone();
            changes.apply_to(&mut after);
            validation::check_group(&GroupDraft {
                name: after.name.clone(),
                default_currency: after.default_currency.clone(),
                icon: None,
                is_shared: after.is_shared,
            })
            .map_err(SyncError::Validation)?;
            if let Some(missing) = changes
                .guest_managers
                .iter()
                .find(|c| after.guest(&c.guest_id).is_none())
            {
                return Err(SyncError::Validation(format!(
                    "guest {} is not in group {group_id}",
                    missing.guest_id
                )));
            }
            validation::check_guest_managers(&after).map_err(SyncError::Validation)?;
            commit_group(t, before, after, now)
        }
        Operation::DeleteGroup { group_id } => {
            let group = load_group(t, group_id)?;
            let expenses = t.expenses_for_group(group_id)?;
            for expense in &expenses {
                t.delete_expense(&expense.id)?;
            }
            t.delete_group(group_id)?;
            info!(group = %group_id, expenses = expenses.len(), "group deleted locally");
            Ok((
                group.local_version,
                Some(Rollback::Restore {
                    groups: vec![group],
                    expenses,
                }),
            ))
        }
        Operation::SettleUp(new) => {
            validation::check_settlement(&new.settlement).map_err(SyncError::Validation)?;
            let expense = new
                .settlement
                .clone()
                .into_expense(new.client_id.clone(), 1, now);
            t.put_expense(&expense)?;
            Ok((
                1,
                Some(Rollback::Remove {
                    entity_type: EntityType::Expense,
                    id: new.client_id.clone(),
                }),
            ))
        }
        Operation::AddMember { group_id, user_id } => {
            let before = load_group(t, group_id)?;
            if before.has_member(*user_id) {
                return Err(SyncError::Validation(format!(
                    "user {user_id} is already a member of group {group_id}"
                )));
            }
            let (name, email) = match t.get_user(*user_id)? {
                Some(user) => (user.name, user.email),
                None => (format!("User {user_id}"), None),
            };
            let mut after = before.clone();
            after.members.push(GroupMember {
                user_id: *user_id,
                name,
                email,
            });
            commit_group(t, before, after, now)
        }
        Operation::RemoveMember { group_id, user_id } => {
            let before = load_group(t, group_id)?;
            if !before.has_member(*user_id) {
                return Err(SyncError::Validation(format!(
                    "user {user_id} is not a member of group {group_id}"
                )));
            }
            let mut after = before.clone();
            after.members.retain(|m| m.user_id != *user_id);
            validation::check_guest_managers(&after).map_err(SyncError::Validation)?;
            commit_group(t, before, after, now)
        }
        Operation::AddGuest(new) => {
            validation::check_guest(&new.guest).map_err(SyncError::Validation)?;
            let before = load_group(t, &new.group_id)?;
            let mut after = before.clone();
            after
                .guests
                .push(new.guest.clone().into_guest(new.client_id.clone()));
            validation::check_guest_managers(&after).map_err(SyncError::Validation)?;
            commit_group(t, before, after, now)
        }
        Operation::RemoveGuest { group_id, guest_id } => {
            let before = load_group(t, group_id)?;
            if before.guest(guest_id).is_none() {
                return Err(SyncError::NotFound(format!(
                    "guest {guest_id} in group {group_id}"
                )));
            }
            if let Some(managed) = before
                .guests
                .iter()
                .find(|g| g.managed_by_id.as_ref() == Some(guest_id))
            {
                return Err(SyncError::Validation(format!(
                    "guest {guest_id} still manages {}",
                    managed.id
                )));
            }
            let mut after = before.clone();
            after.guests.retain(|g| &g.id != guest_id);
            commit_group(t, before, after, now)
        }
    }
}
