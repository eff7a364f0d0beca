//! Cached entity shapes.
//!
//! These mirror the server's JSON resources. The bookkeeping fields
//! (`local_version`, `sync_state`, `cached_at`) are client-only and default
//! when a row is decoded from a server response.

use crate::error::TypesError;
use crate::ids::EntityId;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of cached entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    User,
    Group,
    Expense,
    Guest,
    Balance,
    ExchangeRate,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Group => "group",
            Self::Expense => "expense",
            Self::Guest => "guest",
            Self::Balance => "balance",
            Self::ExchangeRate => "exchange_rate",
        }
    }

    pub fn parse(s: &str) -> Result<Self, TypesError> {
        match s {
            "user" => Ok(Self::User),
            "group" => Ok(Self::Group),
            "expense" => Ok(Self::Expense),
            "guest" => Ok(Self::Guest),
            "balance" => Ok(Self::Balance),
            "exchange_rate" => Ok(Self::ExchangeRate),
            _ => Err(TypesError::UnknownVariant {
                kind: "entity type",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconciliation state of a locally editable row.
///
/// ```text
/// Local ──▶ Syncing ──▶ Confirmed
///   ▲          │
///   └──────────┤ (transient failure / more queued edits)
///              ▼
///          Conflicted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    /// Edited locally, not yet sent.
    Local,
    /// An operation for this row is in flight.
    Syncing,
    /// Matches the server as of the last confirmed response.
    #[default]
    Confirmed,
    /// The server rejected an operation; needs user attention.
    Conflicted,
}

impl EntityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Syncing => "syncing",
            Self::Confirmed => "confirmed",
            Self::Conflicted => "conflicted",
        }
    }

    pub fn parse(s: &str) -> Result<Self, TypesError> {
        match s {
            "local" => Ok(Self::Local),
            "syncing" => Ok(Self::Syncing),
            "confirmed" => Ok(Self::Confirmed),
            "conflicted" => Ok(Self::Conflicted),
            _ => Err(TypesError::UnknownVariant {
                kind: "entity state",
                value: s.to_string(),
            }),
        }
    }

    /// Returns true if the row should render in a "needs attention" state.
    pub fn needs_attention(&self) -> bool {
        matches!(self, Self::Conflicted)
    }
}

/// Whether a participant reference points at a registered user or a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantKind {
    User,
    Guest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedUser {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub cached_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMember {
    pub user_id: i64,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// A non-registered participant of a group.
///
/// A guest may be managed by a member or another guest: its balance is shown
/// rolled up under the manager. The manager relation must never cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guest {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub managed_by_id: Option<EntityId>,
    #[serde(default)]
    pub managed_by_type: Option<ParticipantKind>,
}

impl Guest {
    pub fn manager(&self) -> Option<(&EntityId, ParticipantKind)> {
        match (&self.managed_by_id, self.managed_by_type) {
            (Some(id), Some(kind)) => Some((id, kind)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedGroup {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub owner_id: Option<i64>,
    pub default_currency: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub is_shared: bool,
    #[serde(default)]
    pub share_link: Option<String>,
    #[serde(default)]
    pub members: Vec<GroupMember>,
    #[serde(default)]
    pub guests: Vec<Guest>,
    #[serde(default)]
    pub local_version: u64,
    #[serde(default)]
    pub sync_state: EntityState,
    #[serde(default)]
    pub cached_at: i64,
}

impl CachedGroup {
    /// True until the server has confirmed the create and assigned an id.
    pub fn is_temp(&self) -> bool {
        self.id.is_temp()
    }

    pub fn guest(&self, guest_id: &EntityId) -> Option<&Guest> {
        self.guests.iter().find(|g| &g.id == guest_id)
    }

    pub fn has_member(&self, user_id: i64) -> bool {
        self.members.iter().any(|m| m.user_id == user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SplitType {
    Equal,
    Exact,
    Percent,
    Shares,
    Itemized,
}

/// One participant's share of an expense.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Split {
    pub participant_id: EntityId,
    #[serde(default)]
    pub is_guest: bool,
    /// Minor currency units.
    pub amount_owed: i64,
    #[serde(default)]
    pub percentage: Option<f64>,
    #[serde(default)]
    pub shares: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemAssignment {
    pub participant_id: EntityId,
    #[serde(default)]
    pub is_guest: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSplitOverride {
    pub split_type: SplitType,
    pub splits: Vec<Split>,
}

/// A line item of an itemized expense.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseItem {
    pub name: String,
    pub amount: i64,
    #[serde(default)]
    pub assignments: Vec<ItemAssignment>,
    #[serde(default)]
    pub split_override: Option<ItemSplitOverride>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedExpense {
    pub id: EntityId,
    pub description: String,
    /// Minor currency units.
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
    #[serde(default)]
    pub is_settlement: bool,
    #[serde(default)]
    pub created_by: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub local_version: u64,
    #[serde(default)]
    pub sync_state: EntityState,
    #[serde(default)]
    pub cached_at: i64,
}

impl CachedExpense {
    /// True until the server has confirmed the create and assigned an id.
    pub fn is_temp(&self) -> bool {
        self.id.is_temp()
    }
}

/// Net balance of one participant in one currency, optionally scoped to a group.
/// Positive means the participant is owed money.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedBalance {
    pub participant_id: EntityId,
    #[serde(default)]
    pub is_guest: bool,
    pub currency: String,
    #[serde(default)]
    pub group_id: Option<EntityId>,
    pub amount: i64,
    #[serde(default)]
    pub cached_at: i64,
}

impl CachedBalance {
    /// Storage key: `<group|*>:<u|g><participant>:<currency>`.
    pub fn key(&self) -> String {
        let group = self
            .group_id
            .as_ref()
            .map(|g| g.to_string())
            .unwrap_or_else(|| "*".to_string());
        let kind = if self.is_guest { 'g' } else { 'u' };
        format!("{group}:{kind}{}:{}", self.participant_id, self.currency)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub base: String,
    pub quote: String,
    pub rate: f64,
    #[serde(default)]
    pub fetched_at: i64,
}
