//! Queued mutations.
//!
//! `Operation` is a closed sum type over every mutation the client can make
//! while offline. Each variant carries a strongly-typed payload which is also
//! the request body sent to the server.

use crate::entities::{
    CachedExpense, CachedGroup, EntityState, EntityType, ExpenseItem, Guest, ParticipantKind,
    Split, SplitType,
};
use crate::error::TypesError;
use crate::ids::{replace_id_in_json, EntityId, OperationId};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Full expense content, as entered by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseDraft {
    pub description: String,
    pub amount: i64,
    pub currency: String,
    pub date: NaiveDate,
    pub payer_id: EntityId,
    #[serde(default)]
    pub payer_is_guest: bool,
    #[serde(default)]
    pub group_id: Option<EntityId>,
    pub split_type: SplitType,
    #[serde(default)]
    pub splits: Vec<Split>,
    #[serde(default)]
    pub items: Vec<ExpenseItem>,
}

impl ExpenseDraft {
    pub fn into_expense(self, id: EntityId, local_version: u64, now: i64) -> CachedExpense {
        CachedExpense {
            id,
            description: self.description,
            amount: self.amount,
            currency: self.currency,
            date: self.date,
            payer_id: self.payer_id,
            payer_is_guest: self.payer_is_guest,
            group_id: self.group_id,
            split_type: self.split_type,
            splits: self.splits,
            items: self.items,
            is_settlement: false,
            created_by: None,
            updated_at: None,
            local_version,
            sync_state: EntityState::Local,
            cached_at: now,
        }
    }

    /// Overwrites the user-editable fields of a cached expense.
    pub fn apply_to(&self, expense: &mut CachedExpense) {
        expense.description = self.description.clone();
        expense.amount = self.amount;
        expense.currency = self.currency.clone();
        expense.date = self.date;
        expense.payer_id = self.payer_id.clone();
        expense.payer_is_guest = self.payer_is_guest;
        expense.group_id = self.group_id.clone();
        expense.split_type = self.split_type;
        expense.splits = self.splits.clone();
        expense.items = self.items.clone();
    }

    fn collect_ids<'a>(&'a self, out: &mut Vec<&'a EntityId>) {
        out.push(&self.payer_id);
        out.extend(self.group_id.iter());
        out.extend(self.splits.iter().map(|s| &s.participant_id));
        for item in &self.items {
            out.extend(item.assignments.iter().map(|a| &a.participant_id));
            if let Some(over) = &item.split_override {
                out.extend(over.splits.iter().map(|s| &s.participant_id));
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewExpense {
    pub client_id: EntityId,
    #[serde(flatten)]
    pub expense: ExpenseDraft,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDraft {
    pub name: String,
    pub default_currency: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub is_shared: bool,
}

impl GroupDraft {
    pub fn into_group(self, id: EntityId, local_version: u64, now: i64) -> CachedGroup {
        CachedGroup {
            id,
            name: self.name,
            owner_id: None,
            default_currency: self.default_currency,
            icon: self.icon,
            is_shared: self.is_shared,
            share_link: None,
            members: Vec::new(),
            guests: Vec::new(),
            local_version,
            sync_state: EntityState::Local,
            cached_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewGroup {
    pub client_id: EntityId,
    #[serde(flatten)]
    pub group: GroupDraft,
}

/// Reassigns (or clears) the manager of one guest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestManagerChange {
    pub guest_id: EntityId,
    #[serde(default)]
    pub managed_by_id: Option<EntityId>,
    #[serde(default)]
    pub managed_by_type: Option<ParticipantKind>,
}

/// Partial group update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_shared: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guest_managers: Vec<GuestManagerChange>,
}

impl GroupPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.default_currency.is_none()
            && self.icon.is_none()
            && self.is_shared.is_none()
            && self.guest_managers.is_empty()
    }

    /// Folds a later patch into this one; the later value wins per field.
    pub fn merge(&mut self, later: GroupPatch) {
        if later.name.is_some() {
            self.name = later.name;
        }
        if later.default_currency.is_some() {
            self.default_currency = later.default_currency;
        }
        if later.icon.is_some() {
            self.icon = later.icon;
        }
        if later.is_shared.is_some() {
            self.is_shared = later.is_shared;
        }
        for change in later.guest_managers {
            match self
                .guest_managers
                .iter_mut()
                .find(|c| c.guest_id == change.guest_id)
            {
                Some(existing) => *existing = change,
                None => self.guest_managers.push(change),
            }
        }
    }

    pub fn apply_to(&self, group: &mut CachedGroup) {
        if let Some(name) = &self.name {
            group.name = name.clone();
        }
        if let Some(currency) = &self.default_currency {
            group.default_currency = currency.clone();
        }
        if let Some(icon) = &self.icon {
            group.icon = Some(icon.clone());
        }
        if let Some(shared) = self.is_shared {
            group.is_shared = shared;
        }
        for change in &self.guest_managers {
            if let Some(guest) = group.guests.iter_mut().find(|g| g.id == change.guest_id) {
                guest.managed_by_id = change.managed_by_id.clone();
                guest.managed_by_type = change.managed_by_type;
            }
        }
    }

    /// Applies the scalar fields to a not-yet-sent create. Returns false when
    /// the patch touches guests, which a create payload cannot carry.
    pub fn apply_to_draft(&self, draft: &mut GroupDraft) -> bool {
        if !self.guest_managers.is_empty() {
            return false;
        }
        if let Some(name) = &self.name {
            draft.name = name.clone();
        }
        if let Some(currency) = &self.default_currency {
            draft.default_currency = currency.clone();
        }
        if let Some(icon) = &self.icon {
            draft.icon = Some(icon.clone());
        }
        if let Some(shared) = self.is_shared {
            draft.is_shared = shared;
        }
        true
    }
}

/// A payment from one participant to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementDraft {
    #[serde(default)]
    pub group_id: Option<EntityId>,
    pub payer_id: EntityId,
    #[serde(default)]
    pub payer_is_guest: bool,
    pub payee_id: EntityId,
    #[serde(default)]
    pub payee_is_guest: bool,
    pub amount: i64,
    pub currency: String,
    pub date: NaiveDate,
}

impl SettlementDraft {
    /// Settlements are cached as payment expenses owed entirely by the payee.
    pub fn into_expense(self, id: EntityId, local_version: u64, now: i64) -> CachedExpense {
        CachedExpense {
            id,
            description: "Settlement".to_string(),
            amount: self.amount,
            currency: self.currency,
            date: self.date,
            payer_id: self.payer_id,
            payer_is_guest: self.payer_is_guest,
            group_id: self.group_id,
            split_type: SplitType::Exact,
            splits: vec![Split {
                participant_id: self.payee_id,
                is_guest: self.payee_is_guest,
                amount_owed: self.amount,
                percentage: None,
                shares: None,
            }],
            items: Vec::new(),
            is_settlement: true,
            created_by: None,
            updated_at: None,
            local_version,
            sync_state: EntityState::Local,
            cached_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSettlement {
    pub client_id: EntityId,
    #[serde(flatten)]
    pub settlement: SettlementDraft,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestDraft {
    pub name: String,
    #[serde(default)]
    pub managed_by_id: Option<EntityId>,
    #[serde(default)]
    pub managed_by_type: Option<ParticipantKind>,
}

impl GuestDraft {
    pub fn into_guest(self, id: EntityId) -> Guest {
        Guest {
            id,
            name: self.name,
            managed_by_id: self.managed_by_id,
            managed_by_type: self.managed_by_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewGuest {
    pub client_id: EntityId,
    pub group_id: EntityId,
    #[serde(flatten)]
    pub guest: GuestDraft,
}

/// Kind tag of an [`Operation`], as persisted in the queue table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    CreateExpense,
    UpdateExpense,
    DeleteExpense,
    CreateGroup,
    UpdateGroup,
    DeleteGroup,
    SettleUp,
    AddMember,
    RemoveMember,
    AddGuest,
    RemoveGuest,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateExpense => "create_expense",
            Self::UpdateExpense => "update_expense",
            Self::DeleteExpense => "delete_expense",
            Self::CreateGroup => "create_group",
            Self::UpdateGroup => "update_group",
            Self::DeleteGroup => "delete_group",
            Self::SettleUp => "settle_up",
            Self::AddMember => "add_member",
            Self::RemoveMember => "remove_member",
            Self::AddGuest => "add_guest",
            Self::RemoveGuest => "remove_guest",
        }
    }

    pub fn parse(s: &str) -> Result<Self, TypesError> {
        match s {
            "create_expense" => Ok(Self::CreateExpense),
            "update_expense" => Ok(Self::UpdateExpense),
            "delete_expense" => Ok(Self::DeleteExpense),
            "create_group" => Ok(Self::CreateGroup),
            "update_group" => Ok(Self::UpdateGroup),
            "delete_group" => Ok(Self::DeleteGroup),
            "settle_up" => Ok(Self::SettleUp),
            "add_member" => Ok(Self::AddMember),
            "remove_member" => Ok(Self::RemoveMember),
            "add_guest" => Ok(Self::AddGuest),
            "remove_guest" => Ok(Self::RemoveGuest),
            _ => Err(TypesError::UnknownVariant {
                kind: "operation kind",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-intent mutation awaiting server confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Operation {
    CreateExpense(NewExpense),
    UpdateExpense {
        expense_id: EntityId,
        changes: ExpenseDraft,
    },
    DeleteExpense {
        expense_id: EntityId,
    },
    CreateGroup(NewGroup),
    UpdateGroup {
        group_id: EntityId,
        changes: GroupPatch,
    },
    DeleteGroup {
        group_id: EntityId,
    },
    SettleUp(NewSettlement),
    AddMember {
        group_id: EntityId,
        user_id: i64,
    },
    RemoveMember {
        group_id: EntityId,
        user_id: i64,
    },
    AddGuest(NewGuest),
    RemoveGuest {
        group_id: EntityId,
        guest_id: EntityId,
    },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::CreateExpense(_) => OperationKind::CreateExpense,
            Self::UpdateExpense { .. } => OperationKind::UpdateExpense,
            Self::DeleteExpense { .. } => OperationKind::DeleteExpense,
            Self::CreateGroup(_) => OperationKind::CreateGroup,
            Self::UpdateGroup { .. } => OperationKind::UpdateGroup,
            Self::DeleteGroup { .. } => OperationKind::DeleteGroup,
            Self::SettleUp(_) => OperationKind::SettleUp,
            Self::AddMember { .. } => OperationKind::AddMember,
            Self::RemoveMember { .. } => OperationKind::RemoveMember,
            Self::AddGuest(_) => OperationKind::AddGuest,
            Self::RemoveGuest { .. } => OperationKind::RemoveGuest,
        }
    }

    /// Entity type the queue groups this operation under.
    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::CreateExpense(_)
            | Self::UpdateExpense { .. }
            | Self::DeleteExpense { .. }
            | Self::SettleUp(_) => EntityType::Expense,
            Self::CreateGroup(_)
            | Self::UpdateGroup { .. }
            | Self::DeleteGroup { .. }
            | Self::AddMember { .. }
            | Self::RemoveMember { .. } => EntityType::Group,
            Self::AddGuest(_) | Self::RemoveGuest { .. } => EntityType::Guest,
        }
    }

    /// Entity id the queue groups this operation under (FIFO per id).
    pub fn entity_id(&self) -> &EntityId {
        match self {
            Self::CreateExpense(new) => &new.client_id,
            Self::UpdateExpense { expense_id, .. } | Self::DeleteExpense { expense_id } => {
                expense_id
            }
            Self::CreateGroup(new) => &new.client_id,
            Self::UpdateGroup { group_id, .. }
            | Self::DeleteGroup { group_id }
            | Self::AddMember { group_id, .. }
            | Self::RemoveMember { group_id, .. } => group_id,
            Self::SettleUp(new) => &new.client_id,
            Self::AddGuest(new) => &new.client_id,
            Self::RemoveGuest { guest_id, .. } => guest_id,
        }
    }

    /// The temp id this operation brings into existence, if it is a create.
    pub fn created_id(&self) -> Option<&EntityId> {
        match self {
            Self::CreateExpense(new) => Some(&new.client_id),
            Self::CreateGroup(new) => Some(&new.client_id),
            Self::SettleUp(new) => Some(&new.client_id),
            Self::AddGuest(new) => Some(&new.client_id),
            _ => None,
        }
    }

    pub fn is_create(&self) -> bool {
        self.created_id().is_some()
    }

    pub fn is_delete(&self) -> bool {
        matches!(
            self,
            Self::DeleteExpense { .. } | Self::DeleteGroup { .. } | Self::RemoveGuest { .. }
        )
    }

    /// The cached row whose sync state reflects this operation.
    pub fn state_target(&self) -> (EntityType, &EntityId) {
        match self {
            Self::CreateExpense(new) => (EntityType::Expense, &new.client_id),
            Self::SettleUp(new) => (EntityType::Expense, &new.client_id),
            Self::UpdateExpense { expense_id, .. } | Self::DeleteExpense { expense_id } => {
                (EntityType::Expense, expense_id)
            }
            Self::CreateGroup(new) => (EntityType::Group, &new.client_id),
            Self::UpdateGroup { group_id, .. }
            | Self::DeleteGroup { group_id }
            | Self::AddMember { group_id, .. }
            | Self::RemoveMember { group_id, .. }
            | Self::RemoveGuest { group_id, .. } => (EntityType::Group, group_id),
            Self::AddGuest(new) => (EntityType::Group, &new.group_id),
        }
    }

    /// Temp ids this operation needs resolved before it can be sent,
    /// excluding the id it creates itself.
    pub fn temp_references(&self) -> Vec<EntityId> {
        let mut ids: Vec<&EntityId> = Vec::new();
        match self {
            Self::CreateExpense(new) => new.expense.collect_ids(&mut ids),
            Self::UpdateExpense {
                expense_id,
                changes,
            } => {
                ids.push(expense_id);
                changes.collect_ids(&mut ids);
            }
            Self::DeleteExpense { expense_id } => ids.push(expense_id),
            Self::CreateGroup(_) => {}
            Self::UpdateGroup { group_id, changes } => {
                ids.push(group_id);
                for change in &changes.guest_managers {
                    ids.push(&change.guest_id);
                    ids.extend(change.managed_by_id.iter());
                }
            }
            Self::DeleteGroup { group_id }
            | Self::AddMember { group_id, .. }
            | Self::RemoveMember { group_id, .. } => ids.push(group_id),
            Self::SettleUp(new) => {
                ids.extend(new.settlement.group_id.iter());
                ids.push(&new.settlement.payer_id);
                ids.push(&new.settlement.payee_id);
            }
            Self::AddGuest(new) => {
                ids.push(&new.group_id);
                ids.extend(new.guest.managed_by_id.iter());
            }
            Self::RemoveGuest { group_id, guest_id } => {
                ids.push(group_id);
                ids.push(guest_id);
            }
        }

        let created = self.created_id();
        let mut out: Vec<EntityId> = Vec::new();
        for id in ids {
            if id.is_temp() && Some(id) != created && !out.contains(id) {
                out.push(id.clone());
            }
        }
        out
    }

    /// Rewrites every occurrence of `temp_id` to the canonical id.
    pub fn replace_id(&mut self, temp_id: &str, server_id: i64) -> Result<usize, serde_json::Error> {
        let mut value = serde_json::to_value(&*self)?;
        let replaced = replace_id_in_json(&mut value, temp_id, server_id);
        if replaced > 0 {
            *self = serde_json::from_value(value)?;
        }
        Ok(replaced)
    }
}

/// Lifecycle status of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Processing,
    Failed,
    Conflict,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Failed => "failed",
            Self::Conflict => "conflict",
        }
    }

    pub fn parse(s: &str) -> Result<Self, TypesError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "failed" => Ok(Self::Failed),
            "conflict" => Ok(Self::Conflict),
            _ => Err(TypesError::UnknownVariant {
                kind: "operation status",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How to undo the optimistic cache write of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Rollback {
    /// The operation created a row; undoing removes it.
    Remove { entity_type: EntityType, id: EntityId },
    /// The operation changed or removed rows; undoing restores these snapshots.
    Restore {
        #[serde(default)]
        groups: Vec<CachedGroup>,
        #[serde(default)]
        expenses: Vec<CachedExpense>,
    },
}

impl Rollback {
    pub fn replace_id(&mut self, temp_id: &str, server_id: i64) -> Result<usize, serde_json::Error> {
        let mut value = serde_json::to_value(&*self)?;
        let replaced = replace_id_in_json(&mut value, temp_id, server_id);
        if replaced > 0 {
            *self = serde_json::from_value(value)?;
        }
        Ok(replaced)
    }
}

/// A row of the durable operation queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Insertion order, assigned by the store.
    pub seq: i64,
    pub id: OperationId,
    pub operation: Operation,
    /// `local_version` of the target row right after this edit was applied.
    pub base_version: u64,
    pub rollback: Option<Rollback>,
    pub created_at: i64,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Earliest time (ms) a failed operation may be retried.
    pub next_attempt_at: Option<i64>,
    pub status: OperationStatus,
}

impl PendingOperation {
    pub fn new(operation: Operation, base_version: u64, rollback: Option<Rollback>, now: i64) -> Self {
        Self {
            seq: 0,
            id: OperationId::new(),
            operation,
            base_version,
            rollback,
            created_at: now,
            retry_count: 0,
            last_error: None,
            next_attempt_at: None,
            status: OperationStatus::Pending,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }

    pub fn entity_type(&self) -> EntityType {
        self.operation.entity_type()
    }

    pub fn entity_id(&self) -> &EntityId {
        self.operation.entity_id()
    }

    /// Never attempted: safe to fold later edits into it.
    pub fn is_untouched(&self) -> bool {
        self.status == OperationStatus::Pending && self.retry_count == 0
    }

    /// Eligible to be sent at `now` (ignoring ordering constraints).
    pub fn is_ready(&self, now: i64) -> bool {
        match self.status {
            OperationStatus::Pending => true,
            OperationStatus::Failed => self.next_attempt_at.is_none_or(|t| t <= now),
            OperationStatus::Processing | OperationStatus::Conflict => false,
        }
    }
}
