#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use splitsync_cloud::{ApiResponse, CloudError, CloudResult, RemoteApi};
use splitsync_storage::LocalStore;
use splitsync_sync::{SumSplitValidator, SyncConfig, SyncEngine, SyncEvent};
use splitsync_types::*;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

// ── Fake server ─────────────────────────────────────────────────

/// Scripted failure for the next `execute` call.
#[derive(Debug, Clone)]
pub enum Failure {
    /// Connection dropped before the server saw the request.
    Network,
    /// Server answered with this status.
    Status(u16),
    /// Server applied the request but the response never arrived.
    LostResponse,
}

#[derive(Default)]
pub struct ServerState {
    pub next_id: i64,
    pub groups: BTreeMap<i64, CachedGroup>,
    pub expenses: BTreeMap<i64, CachedExpense>,
    pub friends: Vec<CachedUser>,
    pub balances: Vec<CachedBalance>,
    /// Responses already produced, by idempotency key.
    pub applied: HashMap<OperationId, ApiResponse>,
    /// Every `execute` call, including failed and replayed ones.
    pub calls: Vec<(OperationId, Operation)>,
    pub failures: VecDeque<Failure>,
}

/// In-memory stand-in for the REST API. Applies operations the way the real
/// server does, honours idempotency keys, and refuses unresolved temp ids.
pub struct FakeServer {
    pub state: Mutex<ServerState>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Self::starting_at(42)
    }

    /// Server ids are handed out from `next_id` upwards.
    pub fn starting_at(next_id: i64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ServerState {
                next_id,
                ..ServerState::default()
            }),
        })
    }

    pub fn fail_next(&self, failures: impl IntoIterator<Item = Failure>) {
        self.state.lock().unwrap().failures.extend(failures);
    }

    pub fn calls(&self) -> Vec<(OperationId, Operation)> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_kinds(&self) -> Vec<OperationKind> {
        self.calls().iter().map(|(_, op)| op.kind()).collect()
    }

    pub fn expenses(&self) -> Vec<CachedExpense> {
        self.state.lock().unwrap().expenses.values().cloned().collect()
    }

    pub fn groups(&self) -> Vec<CachedGroup> {
        self.state.lock().unwrap().groups.values().cloned().collect()
    }

    /// Server-side group with user 1 as its only member.
    pub fn seed_group(&self, name: &str) -> i64 {
        let mut state = self.state.lock().unwrap();
        let id = state.allocate();
        let mut group = group_draft(name).into_group(EntityId::Canonical(id), 0, 0);
        group.owner_id = Some(1);
        group.sync_state = EntityState::Confirmed;
        group.members.push(GroupMember {
            user_id: 1,
            name: "Me".into(),
            email: None,
        });
        state.groups.insert(id, group);
        id
    }

    pub fn seed_guest(&self, group_id: i64, guest: GuestDraft) -> EntityId {
        let mut state = self.state.lock().unwrap();
        let id = EntityId::Canonical(state.allocate());
        if let Some(group) = state.groups.get_mut(&group_id) {
            group.guests.push(guest.into_guest(id.clone()));
        }
        id
    }

    pub fn seed_expense(&self, draft: ExpenseDraft) -> i64 {
        let mut state = self.state.lock().unwrap();
        let id = state.allocate();
        let mut expense = draft.into_expense(EntityId::Canonical(id), 0, 0);
        expense.created_by = Some(1);
        expense.sync_state = EntityState::Confirmed;
        state.expenses.insert(id, expense);
        id
    }
}

fn rejected(status: u16, body: &str) -> CloudError {
    CloudError::Status {
        status,
        body: body.to_string(),
    }
}

fn not_found(what: &str, id: &EntityId) -> CloudError {
    rejected(404, &format!("{what} {id} not found"))
}

fn canonical(id: &EntityId) -> CloudResult<i64> {
    id.as_canonical()
        .ok_or_else(|| rejected(422, &format!("unresolved temp id {id}")))
}

impl ServerState {
    fn allocate(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn group_mut(&mut self, id: &EntityId) -> CloudResult<&mut CachedGroup> {
        let key = canonical(id)?;
        self.groups.get_mut(&key).ok_or_else(|| not_found("group", id))
    }

    fn apply(&mut self, operation: &Operation) -> CloudResult<ApiResponse> {
        Ok(match operation {
            Operation::CreateExpense(new) => {
                let id = self.allocate();
                let mut expense = new.expense.clone().into_expense(EntityId::Canonical(id), 0, 0);
                expense.created_by = Some(1);
                expense.sync_state = EntityState::Confirmed;
                self.expenses.insert(id, expense.clone());
                ApiResponse::Expense(expense)
            }
            Operation::UpdateExpense {
                expense_id,
                changes,
            } => {
                let key = canonical(expense_id)?;
                let expense = self
                    .expenses
                    .get_mut(&key)
                    .ok_or_else(|| not_found("expense", expense_id))?;
                changes.apply_to(expense);
                ApiResponse::Expense(expense.clone())
            }
            Operation::DeleteExpense { expense_id } => {
                let key = canonical(expense_id)?;
                self.expenses
                    .remove(&key)
                    .ok_or_else(|| not_found("expense", expense_id))?;
                ApiResponse::Empty
            }
            Operation::CreateGroup(new) => {
                let id = self.allocate();
                let mut group = new.group.clone().into_group(EntityId::Canonical(id), 0, 0);
                group.owner_id = Some(1);
                group.sync_state = EntityState::Confirmed;
                group.members.push(GroupMember {
                    user_id: 1,
                    name: "Me".into(),
                    email: None,
                });
                self.groups.insert(id, group.clone());
                ApiResponse::Group(group)
            }
            Operation::UpdateGroup { group_id, changes } => {
                let group = self.group_mut(group_id)?;
                changes.apply_to(group);
                ApiResponse::Group(group.clone())
            }
            Operation::DeleteGroup { group_id } => {
                let key = canonical(group_id)?;
                self.groups
                    .remove(&key)
                    .ok_or_else(|| not_found("group", group_id))?;
                self.expenses
                    .retain(|_, e| e.group_id.as_ref() != Some(group_id));
                ApiResponse::Empty
            }
            Operation::SettleUp(new) => {
                let id = self.allocate();
                let mut expense = new
                    .settlement
                    .clone()
                    .into_expense(EntityId::Canonical(id), 0, 0);
                expense.created_by = Some(1);
                expense.sync_state = EntityState::Confirmed;
                self.expenses.insert(id, expense.clone());
                ApiResponse::Expense(expense)
            }
            Operation::AddMember { group_id, user_id } => {
                let group = self.group_mut(group_id)?;
                group.members.push(GroupMember {
                    user_id: *user_id,
                    name: format!("User {user_id}"),
                    email: None,
                });
                ApiResponse::Group(group.clone())
            }
            Operation::RemoveMember { group_id, user_id } => {
                let group = self.group_mut(group_id)?;
                group.members.retain(|m| m.user_id != *user_id);
                ApiResponse::Group(group.clone())
            }
            Operation::AddGuest(new) => {
                let id = self.allocate();
                let guest = new.guest.clone().into_guest(EntityId::Canonical(id));
                self.group_mut(&new.group_id)?.guests.push(guest.clone());
                ApiResponse::Guest(guest)
            }
            Operation::RemoveGuest { group_id, guest_id } => {
                canonical(guest_id)?;
                let group = self.group_mut(group_id)?;
                group.guests.retain(|g| &g.id != guest_id);
                ApiResponse::Group(group.clone())
            }
        })
    }
}

#[async_trait]
impl RemoteApi for FakeServer {
    async fn execute(
        &self,
        idempotency_key: &OperationId,
        operation: &Operation,
    ) -> CloudResult<ApiResponse> {
        let mut state = self.state.lock().unwrap();
        state.calls.push((*idempotency_key, operation.clone()));

        if let Some(previous) = state.applied.get(idempotency_key) {
            return Ok(previous.clone());
        }
        if let Some(temp) = operation.temp_references().first() {
            return Err(rejected(422, &format!("unresolved temp id {temp}")));
        }

        match state.failures.pop_front() {
            Some(Failure::Network) => Err(CloudError::Network("connection reset".into())),
            Some(Failure::Status(status)) => Err(rejected(status, "scripted failure")),
            Some(Failure::LostResponse) => {
                let response = state.apply(operation)?;
                state.applied.insert(*idempotency_key, response);
                Err(CloudError::Network("response lost".into()))
            }
            None => {
                let response = state.apply(operation)?;
                state.applied.insert(*idempotency_key, response.clone());
                Ok(response)
            }
        }
    }

    async fn fetch_groups(&self) -> CloudResult<Vec<CachedGroup>> {
        Ok(self.groups())
    }

    async fn fetch_group_expenses(&self, group_id: i64) -> CloudResult<Vec<CachedExpense>> {
        Ok(self
            .expenses()
            .into_iter()
            .filter(|e| e.group_id == Some(EntityId::Canonical(group_id)))
            .collect())
    }

    async fn fetch_balances(&self) -> CloudResult<Vec<CachedBalance>> {
        Ok(self.state.lock().unwrap().balances.clone())
    }

    async fn fetch_friends(&self) -> CloudResult<Vec<CachedUser>> {
        Ok(self.state.lock().unwrap().friends.clone())
    }

    async fn fetch_exchange_rates(&self, base: &str) -> CloudResult<Vec<ExchangeRate>> {
        Ok(vec![ExchangeRate {
            base: base.to_string(),
            quote: "USD".into(),
            rate: 1.08,
            fetched_at: 0,
        }])
    }
}

// ── Gated server ────────────────────────────────────────────────

/// Holds the first `execute` call until [`GatedServer::release`], so a test
/// can act while that operation is in flight. Later calls pass straight
/// through to the wrapped [`FakeServer`].
pub struct GatedServer {
    inner: Arc<FakeServer>,
    armed: AtomicBool,
    entered: Notify,
    released: Notify,
}

impl GatedServer {
    pub fn new(inner: Arc<FakeServer>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            armed: AtomicBool::new(true),
            entered: Notify::new(),
            released: Notify::new(),
        })
    }

    /// Resolves once the held call has reached the server.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.released.notify_one();
    }
}

#[async_trait]
impl RemoteApi for GatedServer {
    async fn execute(
        &self,
        idempotency_key: &OperationId,
        operation: &Operation,
    ) -> CloudResult<ApiResponse> {
        if self.armed.swap(false, Ordering::AcqRel) {
            self.entered.notify_one();
            self.released.notified().await;
        }
        self.inner.execute(idempotency_key, operation).await
    }

    async fn fetch_groups(&self) -> CloudResult<Vec<CachedGroup>> {
        self.inner.fetch_groups().await
    }

    async fn fetch_group_expenses(&self, group_id: i64) -> CloudResult<Vec<CachedExpense>> {
        self.inner.fetch_group_expenses(group_id).await
    }

    async fn fetch_balances(&self) -> CloudResult<Vec<CachedBalance>> {
        self.inner.fetch_balances().await
    }

    async fn fetch_friends(&self) -> CloudResult<Vec<CachedUser>> {
        self.inner.fetch_friends().await
    }

    async fn fetch_exchange_rates(&self, base: &str) -> CloudResult<Vec<ExchangeRate>> {
        self.inner.fetch_exchange_rates(base).await
    }
}

// ── Builders ────────────────────────────────────────────────────

/// Instant retries, no automatic pull, so tests see exactly what they drive.
pub fn test_config() -> SyncConfig {
    SyncConfig {
        backoff_base_ms: 0,
        backoff_cap_ms: 0,
        max_retries: 3,
        pull_after_drain: false,
        ..SyncConfig::default()
    }
}

pub fn engine_with(store: LocalStore, server: Arc<FakeServer>, config: SyncConfig) -> SyncEngine {
    engine_over(store, server, config)
}

pub fn engine_over(store: LocalStore, api: Arc<dyn RemoteApi>, config: SyncConfig) -> SyncEngine {
    SyncEngine::init(store, api, Arc::new(SumSplitValidator), config).unwrap()
}

pub fn engine(server: Arc<FakeServer>) -> SyncEngine {
    engine_with(LocalStore::open_in_memory().unwrap(), server, test_config())
}

pub fn group_draft(name: &str) -> GroupDraft {
    GroupDraft {
        name: name.into(),
        default_currency: "EUR".into(),
        icon: None,
        is_shared: false,
    }
}

/// A single-payer expense owed entirely by user 1.
pub fn expense_draft(description: &str, amount: i64, group_id: Option<EntityId>) -> ExpenseDraft {
    ExpenseDraft {
        description: description.into(),
        amount,
        currency: "EUR".into(),
        date: NaiveDate::from_ymd_opt(2025, 3, 14).unwrap(),
        payer_id: EntityId::Canonical(1),
        payer_is_guest: false,
        group_id,
        split_type: SplitType::Exact,
        splits: vec![Split {
            participant_id: EntityId::Canonical(1),
            is_guest: false,
            amount_owed: amount,
            percentage: None,
            shares: None,
        }],
        items: Vec::new(),
    }
}

pub fn settlement_draft(group_id: Option<EntityId>, amount: i64) -> SettlementDraft {
    SettlementDraft {
        group_id,
        payer_id: EntityId::Canonical(2),
        payer_is_guest: false,
        payee_id: EntityId::Canonical(1),
        payee_is_guest: false,
        amount,
        currency: "EUR".into(),
        date: NaiveDate::from_ymd_opt(2025, 3, 15).unwrap(),
    }
}

/// Everything published on the event stream so far.
pub fn collect_events(rx: &mut tokio::sync::broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
