//! Sync orchestrator: drains the operation queue against the remote API.
//!
//! ```text
//! Idle ──trigger──▶ Draining ──queue empty / blocked──▶ Idle
//!                      │
//!                      └──transient failures pending──▶ Backoff{until} ──deadline──▶ Draining
//! ```
//!
//! One drain runs at a time. A trigger that arrives mid-drain is remembered
//! and answered with another pass before the drain returns. Every queue
//! transition is a single store transaction; nothing is held across an
//! `.await` except the pass lock.

use crate::backoff::backoff_millis;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::SyncEvent;
use crate::queue::{self, dependents, OperationQueue, DEPENDENCY_ERROR_PREFIX};
use crate::remapper::{record_in, resolve_in};
use splitsync_cloud::{ApiResponse, CloudError, FailureClass, RemoteApi};
use splitsync_storage::{LocalStore, StorageResult, StoreTxn};
use splitsync_types::{
    now_millis, CachedExpense, CachedGroup, EntityId, EntityState, EntityType, ExchangeRate,
    Operation, OperationId, OperationStatus, PendingOperation, Rollback,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Where the drain loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    Idle,
    Draining,
    /// Transient failures are waiting; the earliest may be retried at `until` (ms).
    Backoff { until: i64 },
}

/// Summary of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub synced: usize,
    pub remapped: usize,
    pub retrying: usize,
    pub conflicted: usize,
    /// Left waiting on a create that has not synced yet.
    pub deferred: usize,
    /// The drain stopped on an authentication failure.
    pub auth_required: bool,
    /// Another drain was running; this trigger was folded into it.
    pub skipped: bool,
    /// Queue entries not in conflict when the drain ended.
    pub remaining: usize,
}

impl DrainReport {
    /// Finished without transient or auth failures.
    pub fn is_clean(&self) -> bool {
        !self.skipped && !self.auth_required && self.retrying == 0
    }

    /// Folds a follow-up drain into this one. Counts add up; queue-shape
    /// fields come from the later drain.
    fn absorb(&mut self, later: DrainReport) {
        self.synced += later.synced;
        self.remapped += later.remapped;
        self.retrying += later.retrying;
        self.conflicted += later.conflicted;
        self.deferred = later.deferred;
        self.auth_required |= later.auth_required;
        self.skipped &= later.skipped;
        self.remaining = later.remaining;
    }
}

/// Summary of a pull refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FullSyncReport {
    pub groups: usize,
    pub expenses: usize,
    /// Confirmed rows the server no longer returns.
    pub removed: usize,
    /// Rows left alone because queued operations still target them.
    pub skipped: usize,
    pub balances: usize,
    pub users: usize,
    pub exchange_rates: usize,
    pub at: i64,
}

enum Prepared {
    Ready(PendingOperation),
    /// A referenced create is still queued.
    Defer(EntityId),
    /// Put in conflict because a dependency failed.
    Blocked(PendingOperation),
    Gone,
}

enum Step {
    Sent,
    Deferred,
    /// Removed from the queue between the peek and the send.
    Gone,
    Stop,
}

/// Held for the lifetime of one exclusive drain. Releases the drain flag on
/// drop, and cleans up after a drain that never reached `end_drain`.
struct DrainGuard<'a> {
    orchestrator: &'a SyncOrchestrator,
    began: bool,
    finished: bool,
}

impl<'a> DrainGuard<'a> {
    fn new(orchestrator: &'a SyncOrchestrator) -> Self {
        Self {
            orchestrator,
            began: false,
            finished: false,
        }
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.orchestrator.abandon_drain(self.began);
        }
        self.orchestrator.draining.store(false, Ordering::Release);
    }
}

pub struct SyncOrchestrator {
    store: LocalStore,
    queue: OperationQueue,
    api: Arc<dyn RemoteApi>,
    config: SyncConfig,
    events: broadcast::Sender<SyncEvent>,
    draining: AtomicBool,
    rerun: AtomicBool,
    /// Serializes drain passes and pull refreshes.
    pass_lock: Mutex<()>,
    state: watch::Sender<DrainState>,
}

impl SyncOrchestrator {
    pub fn new(store: LocalStore, api: Arc<dyn RemoteApi>, config: SyncConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(DrainState::Idle);
        Self {
            queue: OperationQueue::new(store.clone()),
            store,
            api,
            config,
            events,
            draining: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            pass_lock: Mutex::new(()),
            state,
        }
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> DrainState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<DrainState> {
        self.state.subscribe()
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Sends every ready operation, in order, until the queue is empty or
    /// blocked. Safe to call concurrently: overlapping calls return a
    /// `skipped` report and schedule one more pass on the running drain.
    ///
    /// Dropping the returned future mid-drain releases the drain: entries in
    /// flight go back to `pending` and the durable flag is cleared.
    pub async fn drain(&self) -> SyncResult<DrainReport> {
        let mut total: Option<DrainReport> = None;
        loop {
            if self.draining.swap(true, Ordering::AcqRel) {
                self.rerun.store(true, Ordering::Release);
                if let Some(report) = total {
                    // The running drain owns the late trigger now.
                    return Ok(report);
                }
                debug!("drain already running, trigger coalesced");
                return Ok(DrainReport {
                    skipped: true,
                    ..DrainReport::default()
                });
            }
            let result = {
                let mut guard = DrainGuard::new(self);
                self.drain_exclusive(&mut guard).await
            };
            let report = result?;
            total = Some(match total.take() {
                Some(mut earlier) => {
                    earlier.absorb(report);
                    earlier
                }
                None => report,
            });
            // A trigger can land after the last pass but before the flag drops.
            if !self.rerun.swap(false, Ordering::AcqRel) {
                break;
            }
            debug!("trigger arrived while releasing the drain, draining again");
        }
        let report = total.unwrap_or_default();

        if self.config.pull_after_drain && report.is_clean() && report.remaining == 0 {
            // Failures are reported on the event stream.
            let _ = self.full_sync().await;
        }
        Ok(report)
    }

    async fn drain_exclusive(&self, guard: &mut DrainGuard<'_>) -> SyncResult<DrainReport> {
        let _pass = self.pass_lock.lock().await;

        if !self.store.write(|t| t.begin_drain(now_millis()))? {
            warn!("sync_in_progress already set by another writer, skipping drain");
            guard.finished = true;
            return Ok(DrainReport {
                skipped: true,
                ..DrainReport::default()
            });
        }
        guard.began = true;
        self.state.send_replace(DrainState::Draining);
        let pending = self.queue.pending_count().unwrap_or(0);
        info!(pending, "drain started");
        self.emit(SyncEvent::DrainStarted { pending });

        let mut report = DrainReport::default();
        let outcome = self.run_passes(&mut report).await;

        let clean = outcome.is_ok() && report.is_clean();
        self.store.write(|t| t.end_drain(clean, now_millis()))?;
        guard.finished = true;
        self.publish_idle_state();
        outcome?;

        report.remaining = self.queue.pending_count()?;
        info!(
            synced = report.synced,
            retrying = report.retrying,
            conflicted = report.conflicted,
            deferred = report.deferred,
            remaining = report.remaining,
            "drain finished"
        );
        self.emit(SyncEvent::DrainFinished(report.clone()));
        Ok(report)
    }

    fn publish_idle_state(&self) {
        let next_retry = self.queue.next_retry_at(now_millis());
        self.state.send_replace(match next_retry {
            Ok(Some(until)) => DrainState::Backoff { until },
            _ => DrainState::Idle,
        });
    }

    /// Cleanup for a drain that stopped without reaching `end_drain`.
    fn abandon_drain(&self, began: bool) {
        match self.queue.reset_in_flight() {
            Ok(n) if n > 0 => warn!(released = n, "drain abandoned, in-flight entries back to pending"),
            Ok(_) => debug!("drain abandoned"),
            Err(e) => warn!("drain abandoned, could not release in-flight entries: {e}"),
        }
        if began && let Err(e) = self.store.write(|t| t.end_drain(false, now_millis())) {
            warn!("drain abandoned, could not clear sync_in_progress: {e}");
        }
        self.publish_idle_state();
    }

    async fn run_passes(&self, report: &mut DrainReport) -> SyncResult<()> {
        // Each operation is sent at most once per drain; retries wait for the
        // next one.
        let mut attempted: HashSet<OperationId> = HashSet::new();
        loop {
            let mut skip = attempted.clone();
            let mut progressed = false;
            let mut deferred = 0;
            loop {
                let ready = self.queue.peek_ready(now_millis())?;
                let Some(op) = ready.into_iter().find(|op| !skip.contains(&op.id)) else {
                    break;
                };
                skip.insert(op.id);
                match self.process(op.id, report).await? {
                    Step::Sent => {
                        attempted.insert(op.id);
                        progressed = true;
                    }
                    Step::Deferred => deferred += 1,
                    Step::Gone => {}
                    Step::Stop => return Ok(()),
                }
            }
            report.deferred = deferred;
            let rerun = self.rerun.swap(false, Ordering::AcqRel);
            if !progressed && !rerun {
                return Ok(());
            }
        }
    }

    async fn process(&self, id: OperationId, report: &mut DrainReport) -> SyncResult<Step> {
        let op = match self.store.write(|t| self.prepare_in(t, &id))? {
            Prepared::Ready(op) => op,
            Prepared::Defer(waiting_on) => {
                debug!(op = %id, %waiting_on, "deferred until create syncs");
                return Ok(Step::Deferred);
            }
            Prepared::Blocked(op) => {
                report.conflicted += 1;
                self.emit_conflicted(&op);
                return Ok(Step::Sent);
            }
            Prepared::Gone => {
                debug!(op = %id, "operation left the queue before it was sent");
                return Ok(Step::Gone);
            }
        };

        debug!(op = %op.id, kind = %op.kind(), entity = %op.entity_id(), "sending operation");
        let result = match self.api.execute(&op.id, &op.operation).await {
            Ok(response) => self.on_success(op, response, report).map(|()| Step::Sent),
            Err(err) => self.on_failure(op, err, report),
        };
        if let Err(err) = &result {
            // The outcome was not recorded; the entry must not stay in flight.
            warn!(op = %id, "could not record send outcome: {err}");
            if let Err(e) = self.queue.mark_pending(&id) {
                warn!(op = %id, "could not return entry to pending: {e}");
            }
        }
        result
    }

    /// Re-reads the entry, resolves mapped ids, checks its dependencies, and
    /// marks it in flight.
    fn prepare_in(&self, t: &StoreTxn<'_>, id: &OperationId) -> SyncResult<Prepared> {
        let Some(mut op) = t.get_operation(id)? else {
            return Ok(Prepared::Gone);
        };
        if resolve_in(t, &mut op.operation)? > 0 {
            t.update_operation(&op)?;
        }

        let refs = op.operation.temp_references();
        if !refs.is_empty() {
            let all = t.list_operations()?;
            let mut waiting_on = None;
            for temp in &refs {
                let creator = all
                    .iter()
                    .find(|o| o.operation.created_id() == Some(temp));
                let reason = match creator {
                    Some(c) if c.status == OperationStatus::Conflict => {
                        SyncError::Dependency(format!("{} {} is in conflict", c.kind(), temp)).to_string()
                    }
                    Some(_) => {
                        waiting_on.get_or_insert_with(|| temp.clone());
                        continue;
                    }
                    None => SyncError::Dependency(format!("{temp} was never created")).to_string(),
                };
                let op = queue::update_in(t, &op.id, |o| {
                    o.status = OperationStatus::Conflict;
                    o.last_error = Some(reason);
                })?;
                return Ok(Prepared::Blocked(op));
            }
            if let Some(temp) = waiting_on {
                return Ok(Prepared::Defer(temp));
            }
        }

        op.status = OperationStatus::Processing;
        t.update_operation(&op)?;
        queue::refresh_target(t, &op)?;
        Ok(Prepared::Ready(op))
    }

    fn on_success(
        &self,
        op: PendingOperation,
        response: ApiResponse,
        report: &mut DrainReport,
    ) -> SyncResult<()> {
        if op.operation.is_create() && response.server_id().is_none() {
            let reason = format!("server accepted {} without returning an id", op.kind());
            warn!(op = %op.id, "{reason}");
            report.conflicted += self.conflict(&op, &reason)?;
            return Ok(());
        }

        let now = now_millis();
        let remap = self.store.write(|t| -> SyncResult<_> {
            let mut remap = None;
            if let (Some(temp), Some(server_id)) =
                (op.operation.created_id().and_then(EntityId::as_temp), response.server_id())
                && record_in(t, temp, server_id, op.entity_type(), now)?.is_some()
            {
                remap = Some((temp.to_string(), server_id));
            }
            apply_response_in(t, &op, &response, now)?;
            t.delete_operation(&op.id)?;
            queue::refresh_target(t, &op)?;
            Ok(remap)
        })?;

        report.synced += 1;
        let mut entity_id = op.entity_id().clone();
        if let Some((temp_id, server_id)) = remap {
            report.remapped += 1;
            entity_id = EntityId::Canonical(server_id);
            info!(%temp_id, server_id, entity_type = %op.entity_type(), "temp id confirmed");
            self.emit(SyncEvent::IdRemapped {
                entity_type: op.entity_type(),
                temp_id,
                server_id,
            });
        }
        debug!(op = %op.id, kind = %op.kind(), entity = %entity_id, "operation synced");
        self.emit(SyncEvent::OperationSynced {
            operation_id: op.id,
            kind: op.kind(),
            entity_id,
        });
        Ok(())
    }

    fn on_failure(
        &self,
        op: PendingOperation,
        err: CloudError,
        report: &mut DrainReport,
    ) -> SyncResult<Step> {
        match err.class() {
            FailureClass::Transient => {
                let retry_count = op.retry_count + 1;
                if retry_count >= self.config.max_retries {
                    warn!(op = %op.id, retry_count, "giving up after transient failures: {err}");
                    let reason = format!("max retries exceeded: {err}");
                    self.store.write(|t| {
                        queue::update_in(t, &op.id, |o| o.retry_count = retry_count)
                    })?;
                    report.conflicted += self.conflict(&op, &reason)?;
                    return Ok(Step::Sent);
                }
                let delay =
                    backoff_millis(retry_count, self.config.backoff_base_ms, self.config.backoff_cap_ms);
                let next_attempt_at = now_millis() + i64::try_from(delay).unwrap_or(i64::MAX / 2);
                let error = err.to_string();
                self.queue.mark_failed(&op.id, &error, next_attempt_at)?;
                debug!(op = %op.id, retry_count, delay_ms = delay, "transient failure: {error}");
                report.retrying += 1;
                self.emit(SyncEvent::OperationRetrying {
                    operation_id: op.id,
                    retry_count,
                    next_attempt_at,
                    error,
                });
                Ok(Step::Sent)
            }
            FailureClass::Rejected => {
                warn!(op = %op.id, kind = %op.kind(), "server rejected operation: {err}");
                let reason = SyncError::Conflict(err.to_string()).to_string();
                report.conflicted += self.conflict(&op, &reason)?;
                Ok(Step::Sent)
            }
            FailureClass::Unauthorized => {
                warn!(op = %op.id, "authentication failed, stopping drain: {err}");
                self.queue.mark_pending(&op.id)?;
                report.auth_required = true;
                self.emit(SyncEvent::AuthRequired);
                Ok(Step::Stop)
            }
        }
    }

    /// Puts `op` in conflict and, for creates, everything that depends on it.
    /// Returns how many entries went to conflict.
    fn conflict(&self, op: &PendingOperation, reason: &str) -> SyncResult<usize> {
        let conflicted = self.store.write(|t| -> SyncResult<Vec<PendingOperation>> {
            let mut out = vec![queue::update_in(t, &op.id, |o| {
                o.status = OperationStatus::Conflict;
                o.last_error = Some(reason.to_string());
            })?];
            if op.operation.is_create() {
                let all = t.list_operations()?;
                let cascade =
                    SyncError::Dependency(format!("{} {} failed", op.kind(), op.entity_id())).to_string();
                for id in dependents(&all, op) {
                    out.push(queue::update_in(t, &id, |o| {
                        o.status = OperationStatus::Conflict;
                        o.last_error = Some(cascade.clone());
                    })?);
                }
            }
            Ok(out)
        })?;
        for op in &conflicted {
            self.emit_conflicted(op);
        }
        Ok(conflicted.len())
    }

    fn emit_conflicted(&self, op: &PendingOperation) {
        self.emit(SyncEvent::OperationConflicted {
            operation_id: op.id,
            kind: op.kind(),
            entity_id: op.entity_id().clone(),
            error: op.last_error.clone().unwrap_or_default(),
        });
    }

    // ---- pull refresh ----

    /// Refreshes every cached table from the server. Rows that queued
    /// operations still target are left alone.
    pub async fn full_sync(&self) -> SyncResult<FullSyncReport> {
        let _pass = self.pass_lock.lock().await;
        let result = self.pull().await;
        match &result {
            Ok(report) => {
                info!(
                    groups = report.groups,
                    expenses = report.expenses,
                    removed = report.removed,
                    skipped = report.skipped,
                    "full sync finished"
                );
                self.emit(SyncEvent::FullSyncFinished { at: report.at });
            }
            Err(e) => {
                warn!("full sync failed: {e}");
                self.emit(SyncEvent::FullSyncFailed {
                    error: e.to_string(),
                });
            }
        }
        result
    }

    async fn pull(&self) -> SyncResult<FullSyncReport> {
        let groups = self.api.fetch_groups().await?;
        let mut expenses = Vec::new();
        for group in &groups {
            if let Some(id) = group.id.as_canonical() {
                expenses.extend(self.api.fetch_group_expenses(id).await?);
            }
        }
        let balances = self.api.fetch_balances().await?;
        let friends = self.api.fetch_friends().await?;
        let mut rates: Vec<ExchangeRate> = Vec::new();
        for base in &self.config.exchange_rate_bases {
            match self.api.fetch_exchange_rates(base).await {
                Ok(r) => rates.extend(r),
                Err(e) => warn!(base = %base, "exchange rate refresh failed: {e}"),
            }
        }

        let now = now_millis();
        Ok(self.store.write(|t| -> StorageResult<FullSyncReport> {
            let mut report = FullSyncReport {
                at: now,
                ..FullSyncReport::default()
            };
            let queued = t.list_operations()?;
            let busy: HashSet<(EntityType, EntityId)> = queued
                .iter()
                .map(|op| {
                    let (ty, id) = op.operation.state_target();
                    (ty, id.clone())
                })
                .collect();
            let deleting: HashSet<EntityId> = queued
                .iter()
                .filter_map(|op| match &op.operation {
                    Operation::DeleteGroup { group_id } => Some(group_id.clone()),
                    _ => None,
                })
                .collect();

            let server_groups: HashSet<EntityId> = groups.iter().map(|g| g.id.clone()).collect();
            for mut group in groups {
                if busy.contains(&(EntityType::Group, group.id.clone())) {
                    report.skipped += 1;
                    continue;
                }
                group.local_version = t.get_group(&group.id)?.map_or(0, |g| g.local_version);
                group.sync_state = EntityState::Confirmed;
                group.cached_at = now;
                t.put_group(&group)?;
                report.groups += 1;
            }
            for local in t.list_groups()? {
                if is_stale(&local.id, local.sync_state, &server_groups)
                    && !busy.contains(&(EntityType::Group, local.id.clone()))
                {
                    t.delete_group(&local.id)?;
                    report.removed += 1;
                }
            }

            let server_expenses: HashSet<EntityId> =
                expenses.iter().map(|e| e.id.clone()).collect();
            for mut expense in expenses {
                let in_deleted_group = expense
                    .group_id
                    .as_ref()
                    .is_some_and(|g| deleting.contains(g));
                if in_deleted_group || busy.contains(&(EntityType::Expense, expense.id.clone())) {
                    report.skipped += 1;
                    continue;
                }
                expense.local_version = t.get_expense(&expense.id)?.map_or(0, |e| e.local_version);
                expense.sync_state = EntityState::Confirmed;
                expense.cached_at = now;
                t.put_expense(&expense)?;
                report.expenses += 1;
            }
            for local in t.list_expenses()? {
                // Expenses outside any group are not pulled by group.
                if local.group_id.is_some()
                    && is_stale(&local.id, local.sync_state, &server_expenses)
                    && !busy.contains(&(EntityType::Expense, local.id.clone()))
                {
                    t.delete_expense(&local.id)?;
                    report.removed += 1;
                }
            }

            report.balances = balances.len();
            t.replace_balances(&balances)?;
            report.users = friends.len();
            t.replace_users(&friends)?;
            report.exchange_rates = rates.len();
            t.put_exchange_rates(&rates)?;
            t.record_full_sync(now)?;
            Ok(report)
        })?)
    }

    // ---- manual resolution ----

    /// Drops a queued entry, later entries on the same entity and, for a
    /// create, everything depending on it. Optimistic writes are reverted
    /// newest first. Returns the removed entry ids.
    pub fn discard_operation(&self, id: &OperationId) -> SyncResult<Vec<OperationId>> {
        let removed = self.store.write(|t| -> SyncResult<Vec<OperationId>> {
            let target = t
                .get_operation(id)?
                .ok_or_else(|| SyncError::NotFound(format!("operation {id}")))?;
            let all = t.list_operations()?;

            let mut remove: HashSet<OperationId> = HashSet::from([target.id]);
            remove.extend(
                all.iter()
                    .filter(|o| o.entity_id() == target.entity_id() && o.seq > target.seq)
                    .map(|o| o.id),
            );
            remove.extend(dependents(&all, &target));

            let doomed: Vec<&PendingOperation> =
                all.iter().filter(|o| remove.contains(&o.id)).collect();
            if let Some(busy) = doomed
                .iter()
                .find(|o| o.status == OperationStatus::Processing)
            {
                return Err(SyncError::InvalidState(format!(
                    "operation {} is in flight",
                    busy.id
                )));
            }

            let now = now_millis();
            for op in doomed.iter().rev() {
                if let Some(rollback) = &op.rollback {
                    revert_in(t, rollback, now)?;
                }
                t.delete_operation(&op.id)?;
            }
            for op in &doomed {
                queue::refresh_target(t, op)?;
            }
            Ok(doomed.iter().map(|o| o.id).collect())
        })?;
        info!(op = %id, removed = removed.len(), "operation discarded");
        Ok(removed)
    }

    /// Puts a conflicted entry, and the entries that conflicted because of
    /// it, back in the queue with a fresh retry budget.
    pub fn retry_operation(&self, id: &OperationId) -> SyncResult<Vec<OperationId>> {
        let reset = self.store.write(|t| -> SyncResult<Vec<OperationId>> {
            let target = t
                .get_operation(id)?
                .ok_or_else(|| SyncError::NotFound(format!("operation {id}")))?;
            if target.status != OperationStatus::Conflict {
                return Err(SyncError::InvalidState(format!(
                    "operation {id} is {}, not in conflict",
                    target.status
                )));
            }
            let all = t.list_operations()?;
            let mut ids = vec![target.id];
            ids.extend(dependents(&all, &target).into_iter().filter(|dep| {
                all.iter().any(|o| {
                    &o.id == dep
                        && o.status == OperationStatus::Conflict
                        && o
                            .last_error
                            .as_deref()
                            .is_some_and(|e| e.starts_with(DEPENDENCY_ERROR_PREFIX))
                })
            }));
            for op_id in &ids {
                queue::update_in(t, op_id, |o| {
                    o.status = OperationStatus::Pending;
                    o.retry_count = 0;
                    o.last_error = None;
                    o.next_attempt_at = None;
                })?;
            }
            Ok(ids)
        })?;
        info!(op = %id, reset = reset.len(), "operation queued for retry");
        Ok(reset)
    }
}

fn is_stale(id: &EntityId, state: EntityState, on_server: &HashSet<EntityId>) -> bool {
    !id.is_temp() && state == EntityState::Confirmed && !on_server.contains(id)
}

/// Undoes an optimistic write. Restored snapshots get a version above
/// anything seen so a late response cannot clobber them.
fn revert_in(t: &StoreTxn<'_>, rollback: &Rollback, now: i64) -> StorageResult<()> {
    match rollback {
        Rollback::Remove { entity_type, id } => {
            let id = t.resolve_id(id)?;
            match entity_type {
                EntityType::Group => {
                    for expense in t.expenses_for_group(&id)? {
                        if expense.is_temp() {
                            t.delete_expense(&expense.id)?;
                        }
                    }
                    t.delete_group(&id)?;
                }
                EntityType::Expense => {
                    t.delete_expense(&id)?;
                }
                _ => {}
            }
        }
        Rollback::Restore { groups, expenses } => {
            for snapshot in groups {
                let current = t.get_group(&snapshot.id)?.map_or(0, |g| g.local_version);
                let mut group = snapshot.clone();
                group.local_version = current.max(snapshot.local_version) + 1;
                group.cached_at = now;
                t.put_group(&group)?;
            }
            for snapshot in expenses {
                let current = t.get_expense(&snapshot.id)?.map_or(0, |e| e.local_version);
                let mut expense = snapshot.clone();
                expense.local_version = current.max(snapshot.local_version) + 1;
                expense.cached_at = now;
                t.put_expense(&expense)?;
            }
        }
    }
    Ok(())
}

/// Writes the server's representation back into the cache.
///
/// A row deleted locally since the send stays deleted. If the user edited the
/// row after the operation was queued (`local_version` moved past the
/// operation's `base_version`), only server-owned fields are merged in.
fn apply_response_in(
    t: &StoreTxn<'_>,
    op: &PendingOperation,
    response: &ApiResponse,
    now: i64,
) -> StorageResult<()> {
    match response {
        ApiResponse::Expense(server) => {
            let Some(local) = t.get_expense(&server.id)? else {
                debug!(expense = %server.id, "response for locally deleted expense ignored");
                return Ok(());
            };
            let row = if local.local_version > op.base_version {
                CachedExpense {
                    created_by: server.created_by,
                    updated_at: server.updated_at,
                    ..local
                }
            } else {
                CachedExpense {
                    local_version: local.local_version,
                    sync_state: local.sync_state,
                    cached_at: now,
                    ..server.clone()
                }
            };
            t.put_expense(&row)?;
        }
        ApiResponse::Group(server) => {
            let Some(local) = t.get_group(&server.id)? else {
                debug!(group = %server.id, "response for locally deleted group ignored");
                return Ok(());
            };
            let row = if local.local_version > op.base_version {
                CachedGroup {
                    owner_id: server.owner_id,
                    share_link: server.share_link.clone(),
                    ..local
                }
            } else {
                CachedGroup {
                    local_version: local.local_version,
                    sync_state: local.sync_state,
                    cached_at: now,
                    ..server.clone()
                }
            };
            t.put_group(&row)?;
        }
        ApiResponse::Guest(server) => {
            let (_, group_id) = op.operation.state_target();
            let group_id = t.resolve_id(group_id)?;
            if let Some(mut group) = t.get_group(&group_id)? {
                match group.guests.iter_mut().find(|g| g.id == server.id) {
                    Some(guest) => *guest = server.clone(),
                    None => group.guests.push(server.clone()),
                }
                group.cached_at = now;
                t.put_group(&group)?;
            }
        }
        ApiResponse::Empty => {}
    }
    Ok(())
}
