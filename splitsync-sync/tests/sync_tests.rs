//! Drain scenarios against an in-process fake server.
//!
//! Covers:
//! - Temp id remapping across dependent operations
//! - Coalescing of edits made while offline
//! - Rejections, cascading dependency failures, and manual resolution
//! - Transient failures with backoff, retry exhaustion, and idempotent replay
//! - Authentication failures that stop the drain without losing work
//! - Pull refreshes that leave queued rows alone

mod support;

use pretty_assertions::assert_eq;
use splitsync_sync::{
    DrainState, Mutation, SyncConfig, SyncError, SyncEvent, DEPENDENCY_ERROR_PREFIX,
};
use splitsync_storage::LocalStore;
use splitsync_types::*;
use support::*;

/// Engine whose cache already holds everything the server has.
async fn pulled_engine(server: std::sync::Arc<FakeServer>) -> splitsync_sync::SyncEngine {
    let engine = engine(server);
    engine.set_online(true);
    engine.full_sync().await.unwrap();
    engine
}

// ═══════════════════════════════════════════════════════════════════════════
// Id remapping
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn offline_group_and_expense_sync_with_server_ids() {
    init_tracing();
    let server = FakeServer::new();
    let engine = engine(server.clone());
    let mut events = engine.subscribe();
    let repo = engine.repository();

    let group = repo
        .write(Mutation::CreateGroup(group_draft("Trip")))
        .unwrap();
    assert!(group.offline);
    assert!(group.entity_id.is_temp());
    let expense = repo
        .write(Mutation::CreateExpense(expense_draft(
            "Dinner",
            3000,
            Some(group.entity_id.clone()),
        )))
        .unwrap();
    assert!(expense.entity_id.is_temp());

    engine.set_online(true);
    let report = engine.sync_now().await.unwrap();
    assert_eq!(report.synced, 2);
    assert_eq!(report.remapped, 2);
    assert_eq!(report.remaining, 0);

    // The expense went out with the group's server id, never the temp id.
    let calls = server.calls();
    assert_eq!(calls.len(), 2);
    match &calls[1].1 {
        Operation::CreateExpense(new) => {
            assert_eq!(new.expense.group_id, Some(EntityId::Canonical(42)));
        }
        other => panic!("expected CreateExpense, got {other:?}"),
    }

    let cached_group = repo.group(&EntityId::Canonical(42)).unwrap().unwrap();
    assert_eq!(cached_group.name, "Trip");
    assert_eq!(cached_group.sync_state, EntityState::Confirmed);

    // Old temp ids still resolve to the confirmed rows.
    assert_eq!(
        repo.group(&group.entity_id).unwrap().map(|g| g.id),
        Some(EntityId::Canonical(42))
    );
    assert_eq!(
        engine.remapper().resolve(&expense.entity_id).unwrap(),
        EntityId::Canonical(43)
    );

    let expenses = repo.expenses_for_group(&EntityId::Canonical(42)).unwrap();
    assert_eq!(expenses.len(), 1);
    assert_eq!(expenses[0].id, EntityId::Canonical(43));
    assert_eq!(expenses[0].group_id, Some(EntityId::Canonical(42)));
    assert_eq!(expenses[0].sync_state, EntityState::Confirmed);
    assert_eq!(expenses[0].created_by, Some(1));

    let events = collect_events(&mut events);
    let remapped: Vec<(String, i64)> = events
        .iter()
        .filter_map(|e| match e {
            SyncEvent::IdRemapped {
                temp_id, server_id, ..
            } => Some((temp_id.clone(), *server_id)),
            _ => None,
        })
        .collect();
    assert_eq!(
        remapped,
        vec![
            (group.entity_id.to_string(), 42),
            (expense.entity_id.to_string(), 43),
        ]
    );
    assert!(matches!(events.first(), Some(SyncEvent::ConnectivityChanged { online: true })));
    assert!(matches!(events.last(), Some(SyncEvent::DrainFinished(_))));
    assert_eq!(engine.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn guest_added_to_offline_group_is_remapped_inside_the_group() {
    let server = FakeServer::new();
    let engine = engine(server.clone());
    let repo = engine.repository();

    let group = repo
        .write(Mutation::CreateGroup(group_draft("Cabin")))
        .unwrap();
    let guest = repo
        .write(Mutation::AddGuest {
            group_id: group.entity_id.clone(),
            guest: GuestDraft {
                name: "Sam".into(),
                managed_by_id: None,
                managed_by_type: None,
            },
        })
        .unwrap();
    assert!(guest.entity_id.is_temp());

    engine.set_online(true);
    let report = engine.sync_now().await.unwrap();
    assert_eq!(report.synced, 2);

    assert_eq!(
        server.call_kinds(),
        vec![OperationKind::CreateGroup, OperationKind::AddGuest]
    );
    let cached = repo.group(&EntityId::Canonical(42)).unwrap().unwrap();
    assert_eq!(cached.guests.len(), 1);
    assert_eq!(cached.guests[0].id, EntityId::Canonical(43));
    assert_eq!(cached.guests[0].name, "Sam");
    assert_eq!(cached.sync_state, EntityState::Confirmed);
}

#[tokio::test]
async fn settlement_syncs_as_payment_expense() {
    let server = FakeServer::new();
    let engine = engine(server.clone());

    let written = engine
        .repository()
        .write(Mutation::SettleUp(settlement_draft(None, 2500)))
        .unwrap();
    let local = engine.repository().expense(&written.entity_id).unwrap().unwrap();
    assert!(local.is_settlement);

    engine.set_online(true);
    engine.sync_now().await.unwrap();

    let on_server = server.expenses();
    assert_eq!(on_server.len(), 1);
    assert!(on_server[0].is_settlement);
    assert_eq!(on_server[0].amount, 2500);
    let confirmed = engine
        .repository()
        .expense(&EntityId::Canonical(42))
        .unwrap()
        .unwrap();
    assert_eq!(confirmed.sync_state, EntityState::Confirmed);
}

// ═══════════════════════════════════════════════════════════════════════════
// Coalescing
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn edits_to_unsent_create_go_out_as_one_call() {
    let server = FakeServer::new();
    let engine = engine(server.clone());
    let repo = engine.repository();

    let created = repo
        .write(Mutation::CreateExpense(expense_draft("Taxi", 1000, None)))
        .unwrap();
    for amount in [1500, 2000] {
        let outcome = repo
            .write(Mutation::UpdateExpense {
                expense_id: created.entity_id.clone(),
                changes: expense_draft("Taxi", amount, None),
            })
            .unwrap();
        assert_eq!(outcome.operation_id, created.operation_id);
    }

    let queued = engine.pending_operations().unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].kind(), OperationKind::CreateExpense);
    assert_eq!(repo.expense(&created.entity_id).unwrap().unwrap().amount, 2000);

    engine.set_online(true);
    engine.sync_now().await.unwrap();

    let calls = server.calls();
    assert_eq!(calls.len(), 1);
    match &calls[0].1 {
        Operation::CreateExpense(new) => assert_eq!(new.expense.amount, 2000),
        other => panic!("expected CreateExpense, got {other:?}"),
    }
    assert_eq!(server.expenses()[0].amount, 2000);
}

#[tokio::test]
async fn edits_to_confirmed_expense_collapse_into_latest_update() {
    let server = FakeServer::new();
    let group_id = server.seed_group("Flat");
    let expense_id = server.seed_expense(expense_draft(
        "Groceries",
        1000,
        Some(EntityId::Canonical(group_id)),
    ));
    let engine = pulled_engine(server.clone()).await;
    engine.set_online(false);

    for amount in [1500, 2000] {
        engine
            .repository()
            .write(Mutation::UpdateExpense {
                expense_id: EntityId::Canonical(expense_id),
                changes: expense_draft("Groceries", amount, Some(EntityId::Canonical(group_id))),
            })
            .unwrap();
    }
    let local = engine
        .repository()
        .expense(&EntityId::Canonical(expense_id))
        .unwrap()
        .unwrap();
    assert_eq!(local.amount, 2000);
    assert_eq!(local.local_version, 2);
    assert_eq!(local.sync_state, EntityState::Local);

    engine.set_online(true);
    let report = engine.sync_now().await.unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(server.call_kinds(), vec![OperationKind::UpdateExpense]);
    assert_eq!(server.expenses()[0].amount, 2000);

    let confirmed = engine
        .repository()
        .expense(&EntityId::Canonical(expense_id))
        .unwrap()
        .unwrap();
    assert_eq!(confirmed.amount, 2000);
    assert_eq!(confirmed.sync_state, EntityState::Confirmed);
    // The response does not reset the local edit counter.
    assert_eq!(confirmed.local_version, 2);
}

#[tokio::test]
async fn deleting_unsent_expense_sends_nothing() {
    let server = FakeServer::new();
    let engine = engine(server.clone());
    let repo = engine.repository();

    let created = repo
        .write(Mutation::CreateExpense(expense_draft("Oops", 700, None)))
        .unwrap();
    let deleted = repo
        .write(Mutation::DeleteExpense {
            expense_id: created.entity_id.clone(),
        })
        .unwrap();
    assert_eq!(deleted.operation_id, None);
    assert!(repo.expense(&created.entity_id).unwrap().is_none());
    assert!(engine.pending_operations().unwrap().is_empty());

    engine.set_online(true);
    let report = engine.sync_now().await.unwrap();
    assert_eq!(report.synced, 0);
    assert!(server.calls().is_empty());
}

// ═══════════════════════════════════════════════════════════════════════════
// Rejections and dependencies
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn rejected_create_goes_to_conflict_and_is_not_resent() {
    let server = FakeServer::new();
    server.fail_next([Failure::Status(422)]);
    let engine = engine(server.clone());
    let mut events = engine.subscribe();

    let created = engine
        .repository()
        .write(Mutation::CreateExpense(expense_draft("Hotel", 12000, None)))
        .unwrap();
    engine.set_online(true);
    let report = engine.sync_now().await.unwrap();
    assert_eq!(report.synced, 0);
    assert_eq!(report.conflicted, 1);
    assert_eq!(report.remaining, 0);

    let conflicts = engine.conflicts().unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].retry_count, 0);
    assert!(conflicts[0].last_error.as_deref().unwrap().contains("422"));

    // The row keeps its temp id and is flagged for the user.
    let row = engine
        .repository()
        .expense(&created.entity_id)
        .unwrap()
        .unwrap();
    assert_eq!(row.id, created.entity_id);
    assert_eq!(row.sync_state, EntityState::Conflicted);

    engine.sync_now().await.unwrap();
    assert_eq!(server.calls().len(), 1);

    let conflicted = collect_events(&mut events)
        .into_iter()
        .filter(|e| matches!(e, SyncEvent::OperationConflicted { .. }))
        .count();
    assert_eq!(conflicted, 1);
}

#[tokio::test]
async fn failed_group_create_blocks_dependents_without_sending_them() {
    let server = FakeServer::new();
    server.fail_next([Failure::Status(400)]);
    let engine = engine(server.clone());
    let repo = engine.repository();

    let group = repo
        .write(Mutation::CreateGroup(group_draft("Ski")))
        .unwrap();
    repo.write(Mutation::CreateExpense(expense_draft(
        "Lift pass",
        9000,
        Some(group.entity_id.clone()),
    )))
    .unwrap();
    repo.write(Mutation::AddMember {
        group_id: group.entity_id.clone(),
        user_id: 5,
    })
    .unwrap();

    engine.set_online(true);
    let report = engine.sync_now().await.unwrap();
    assert_eq!(report.conflicted, 3);
    assert_eq!(server.call_kinds(), vec![OperationKind::CreateGroup]);

    let conflicts = engine.conflicts().unwrap();
    assert_eq!(conflicts.len(), 3);
    assert_eq!(conflicts[0].kind(), OperationKind::CreateGroup);
    for dependent in &conflicts[1..] {
        assert!(dependent
            .last_error
            .as_deref()
            .unwrap()
            .starts_with(DEPENDENCY_ERROR_PREFIX));
    }
}

#[tokio::test]
async fn independent_entities_keep_syncing_past_a_conflict() {
    let server = FakeServer::new();
    server.fail_next([Failure::Status(422)]);
    let engine = engine(server.clone());
    let repo = engine.repository();

    repo.write(Mutation::CreateExpense(expense_draft("Bad", 100, None)))
        .unwrap();
    repo.write(Mutation::CreateExpense(expense_draft("Good", 200, None)))
        .unwrap();

    engine.set_online(true);
    let report = engine.sync_now().await.unwrap();
    assert_eq!(report.conflicted, 1);
    assert_eq!(report.synced, 1);
    assert_eq!(server.expenses()[0].description, "Good");
}

#[tokio::test]
async fn discarding_a_conflicted_create_reverts_it_and_its_dependents() {
    let server = FakeServer::new();
    server.fail_next([Failure::Status(422)]);
    let engine = engine(server.clone());
    let repo = engine.repository();

    let group = repo
        .write(Mutation::CreateGroup(group_draft("Ski")))
        .unwrap();
    let expense = repo
        .write(Mutation::CreateExpense(expense_draft(
            "Lift pass",
            9000,
            Some(group.entity_id.clone()),
        )))
        .unwrap();
    engine.set_online(true);
    engine.sync_now().await.unwrap();

    let removed = engine
        .discard_operation(&group.operation_id.unwrap())
        .unwrap();
    assert_eq!(removed.len(), 2);
    assert!(removed.contains(&expense.operation_id.unwrap()));
    assert!(repo.groups().unwrap().is_empty());
    assert!(repo.expense(&expense.entity_id).unwrap().is_none());
    assert!(engine.pending_operations().unwrap().is_empty());
}

#[tokio::test]
async fn discarding_an_update_restores_the_confirmed_row() {
    let server = FakeServer::new();
    let group_id = server.seed_group("Flat");
    let expense_id = server.seed_expense(expense_draft(
        "Rent",
        80000,
        Some(EntityId::Canonical(group_id)),
    ));
    let engine = pulled_engine(server.clone()).await;
    engine.set_online(false);

    let id = EntityId::Canonical(expense_id);
    let edit = engine
        .repository()
        .write(Mutation::UpdateExpense {
            expense_id: id.clone(),
            changes: expense_draft("Rent", 85000, Some(EntityId::Canonical(group_id))),
        })
        .unwrap();
    assert_eq!(engine.repository().expense(&id).unwrap().unwrap().amount, 85000);

    engine.discard_operation(&edit.operation_id.unwrap()).unwrap();
    let restored = engine.repository().expense(&id).unwrap().unwrap();
    assert_eq!(restored.amount, 80000);
    assert_eq!(restored.sync_state, EntityState::Confirmed);
    assert!(restored.local_version > 1);
}

#[tokio::test]
async fn retrying_a_conflict_requeues_its_dependents() {
    let server = FakeServer::new();
    server.fail_next([Failure::Status(422)]);
    let engine = engine(server.clone());
    let repo = engine.repository();

    let group = repo
        .write(Mutation::CreateGroup(group_draft("Ski")))
        .unwrap();
    repo.write(Mutation::CreateExpense(expense_draft(
        "Lift pass",
        9000,
        Some(group.entity_id.clone()),
    )))
    .unwrap();
    engine.set_online(true);
    engine.sync_now().await.unwrap();
    assert_eq!(engine.conflicts().unwrap().len(), 2);

    let reset = engine.retry_operation(&group.operation_id.unwrap()).unwrap();
    assert_eq!(reset.len(), 2);
    for op in engine.pending_operations().unwrap() {
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 0);
        assert_eq!(op.last_error, None);
    }

    let report = engine.sync_now().await.unwrap();
    assert_eq!(report.synced, 2);
    assert!(engine.conflicts().unwrap().is_empty());
    assert_eq!(server.expenses()[0].group_id, Some(EntityId::Canonical(42)));
}

#[tokio::test]
async fn resolving_unknown_or_healthy_operations_fails() {
    let engine = engine(FakeServer::new());
    let written = engine
        .repository()
        .write(Mutation::CreateExpense(expense_draft("Tea", 300, None)))
        .unwrap();

    assert!(matches!(
        engine.discard_operation(&OperationId::new()),
        Err(SyncError::NotFound(_))
    ));
    assert!(matches!(
        engine.retry_operation(&written.operation_id.unwrap()),
        Err(SyncError::InvalidState(_))
    ));
}

// ═══════════════════════════════════════════════════════════════════════════
// Transient failures
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn transient_failures_retry_until_the_limit_then_conflict() {
    let server = FakeServer::new();
    server.fail_next([Failure::Network, Failure::Status(503), Failure::Network]);
    let engine = engine(server.clone());
    engine
        .repository()
        .write(Mutation::CreateExpense(expense_draft("Bus", 250, None)))
        .unwrap();
    engine.set_online(true);

    for attempt in 1..=2u32 {
        let report = engine.sync_now().await.unwrap();
        assert_eq!(report.retrying, 1);
        assert_eq!(report.remaining, 1);
        let op = &engine.pending_operations().unwrap()[0];
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.retry_count, attempt);
        assert!(op.next_attempt_at.is_some());
    }

    // Third transient failure reaches max_retries (3).
    let report = engine.sync_now().await.unwrap();
    assert_eq!(report.conflicted, 1);
    let conflict = &engine.conflicts().unwrap()[0];
    assert_eq!(conflict.retry_count, 3);
    assert!(conflict
        .last_error
        .as_deref()
        .unwrap()
        .starts_with("max retries exceeded"));
    assert_eq!(server.calls().len(), 3);
}

#[tokio::test]
async fn backoff_holds_the_operation_until_its_deadline() {
    let server = FakeServer::new();
    server.fail_next([Failure::Network]);
    let config = SyncConfig {
        backoff_base_ms: 60_000,
        backoff_cap_ms: 60_000,
        ..test_config()
    };
    let engine = engine_with(LocalStore::open_in_memory().unwrap(), server.clone(), config);
    let mut events = engine.subscribe();
    engine
        .repository()
        .write(Mutation::CreateExpense(expense_draft("Bus", 250, None)))
        .unwrap();
    engine.set_online(true);

    let before = now_millis();
    let report = engine.sync_now().await.unwrap();
    assert_eq!(report.retrying, 1);
    match engine.drain_state() {
        DrainState::Backoff { until } => assert!(until >= before + 60_000),
        other => panic!("expected backoff, got {other:?}"),
    }
    let retrying = collect_events(&mut events).into_iter().find_map(|e| match e {
        SyncEvent::OperationRetrying {
            retry_count,
            next_attempt_at,
            ..
        } => Some((retry_count, next_attempt_at)),
        _ => None,
    });
    let (retry_count, next_attempt_at) = retrying.unwrap();
    assert_eq!(retry_count, 1);
    assert!(next_attempt_at >= before + 60_000);

    // Still waiting: nothing is sent.
    let report = engine.sync_now().await.unwrap();
    assert_eq!(report.synced, 0);
    assert_eq!(report.remaining, 1);
    assert_eq!(server.calls().len(), 1);
}

#[tokio::test]
async fn lost_response_is_replayed_with_the_same_idempotency_key() {
    let server = FakeServer::new();
    server.fail_next([Failure::LostResponse]);
    let engine = engine(server.clone());
    let written = engine
        .repository()
        .write(Mutation::CreateExpense(expense_draft("Museum", 1800, None)))
        .unwrap();
    engine.set_online(true);

    let report = engine.sync_now().await.unwrap();
    assert_eq!(report.retrying, 1);
    assert_eq!(server.expenses().len(), 1);

    let report = engine.sync_now().await.unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(report.remapped, 1);

    let calls = server.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].0, calls[1].0);
    assert_eq!(calls[0].0, written.operation_id.unwrap());
    assert_eq!(server.expenses().len(), 1);
    assert!(engine
        .repository()
        .expense(&EntityId::Canonical(42))
        .unwrap()
        .is_some());
}

// ═══════════════════════════════════════════════════════════════════════════
// Authentication
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn auth_failure_stops_the_drain_and_keeps_everything_pending() {
    let server = FakeServer::new();
    server.fail_next([Failure::Status(401)]);
    let engine = engine(server.clone());
    let mut events = engine.subscribe();
    let repo = engine.repository();
    repo.write(Mutation::CreateExpense(expense_draft("One", 100, None)))
        .unwrap();
    repo.write(Mutation::CreateExpense(expense_draft("Two", 200, None)))
        .unwrap();
    engine.set_online(true);

    let report = engine.sync_now().await.unwrap();
    assert!(report.auth_required);
    assert_eq!(report.synced, 0);
    assert_eq!(report.remaining, 2);
    assert_eq!(server.calls().len(), 1);
    for op in engine.pending_operations().unwrap() {
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 0);
    }
    assert!(collect_events(&mut events)
        .iter()
        .any(|e| matches!(e, SyncEvent::AuthRequired)));

    // Signed back in.
    let report = engine.sync_now().await.unwrap();
    assert_eq!(report.synced, 2);
}

// ═══════════════════════════════════════════════════════════════════════════
// Pull refresh
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn full_sync_fills_every_cached_table() {
    let server = FakeServer::new();
    let group_id = server.seed_group("Flat");
    server.seed_expense(expense_draft("Rent", 80000, Some(EntityId::Canonical(group_id))));
    {
        let mut state = server.state.lock().unwrap();
        state.friends.push(CachedUser {
            id: 2,
            name: "Alex".into(),
            email: Some("alex@example.com".into()),
            cached_at: 0,
        });
        state.balances.push(CachedBalance {
            participant_id: EntityId::Canonical(2),
            is_guest: false,
            currency: "EUR".into(),
            group_id: Some(EntityId::Canonical(group_id)),
            amount: -40000,
            cached_at: 0,
        });
    }
    let config = SyncConfig {
        exchange_rate_bases: vec!["EUR".into()],
        ..test_config()
    };
    let engine = engine_with(LocalStore::open_in_memory().unwrap(), server.clone(), config);
    engine.set_online(true);

    let report = engine.full_sync().await.unwrap();
    assert_eq!(report.groups, 1);
    assert_eq!(report.expenses, 1);
    assert_eq!(report.users, 1);
    assert_eq!(report.balances, 1);
    assert_eq!(report.exchange_rates, 1);

    let repo = engine.repository();
    assert_eq!(repo.groups().unwrap()[0].sync_state, EntityState::Confirmed);
    assert_eq!(
        repo.expenses_for_group(&EntityId::Canonical(group_id))
            .unwrap()
            .len(),
        1
    );
    assert_eq!(repo.users().unwrap()[0].name, "Alex");
    assert_eq!(
        repo.balances_for_group(Some(&EntityId::Canonical(group_id)))
            .unwrap()[0]
            .amount,
        -40000
    );
    assert_eq!(repo.exchange_rates("EUR").unwrap()[0].quote, "USD");
    assert_eq!(engine.metadata().unwrap().last_full_sync_at, Some(report.at));
}

#[tokio::test]
async fn full_sync_leaves_rows_with_queued_edits_alone() {
    let server = FakeServer::new();
    let group_id = server.seed_group("Flat");
    let engine = pulled_engine(server.clone()).await;
    let gid = EntityId::Canonical(group_id);

    engine.set_online(false);
    engine
        .repository()
        .write(Mutation::UpdateGroup {
            group_id: gid.clone(),
            changes: GroupPatch {
                name: Some("Flat share".into()),
                ..GroupPatch::default()
            },
        })
        .unwrap();
    server.state.lock().unwrap().groups.get_mut(&group_id).unwrap().name = "Renamed remotely".into();

    engine.set_online(true);
    let report = engine.full_sync().await.unwrap();
    assert_eq!(report.skipped, 1);
    let local = engine.repository().group(&gid).unwrap().unwrap();
    assert_eq!(local.name, "Flat share");
    assert_eq!(local.sync_state, EntityState::Local);
}

#[tokio::test]
async fn full_sync_drops_confirmed_rows_the_server_no_longer_has() {
    let server = FakeServer::new();
    let keep = server.seed_group("Keep");
    let gone = server.seed_group("Gone");
    server.seed_expense(expense_draft("Old", 500, Some(EntityId::Canonical(gone))));
    let engine = pulled_engine(server.clone()).await;
    assert_eq!(engine.repository().groups().unwrap().len(), 2);

    {
        let mut state = server.state.lock().unwrap();
        state.groups.remove(&gone);
        state.expenses.clear();
    }
    // A local draft must survive the refresh.
    let draft = engine
        .repository()
        .write(Mutation::CreateGroup(group_draft("Draft")))
        .unwrap();
    let queued = engine.pending_operations().unwrap();
    assert_eq!(queued.len(), 1);

    let report = engine.full_sync().await.unwrap();
    assert_eq!(report.removed, 2);
    let names: Vec<String> = engine
        .repository()
        .groups()
        .unwrap()
        .into_iter()
        .map(|g| g.name)
        .collect();
    assert_eq!(names, vec!["Draft", "Keep"]);
    assert!(engine.repository().group(&draft.entity_id).unwrap().is_some());
    assert!(engine
        .repository()
        .group(&EntityId::Canonical(keep))
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn clean_drain_pulls_when_configured() {
    let server = FakeServer::new();
    let config = SyncConfig {
        pull_after_drain: true,
        ..test_config()
    };
    let engine = engine_with(LocalStore::open_in_memory().unwrap(), server.clone(), config);
    let mut events = engine.subscribe();
    engine
        .repository()
        .write(Mutation::CreateGroup(group_draft("Trip")))
        .unwrap();
    engine.set_online(true);

    engine.sync_now().await.unwrap();
    assert!(engine.metadata().unwrap().last_full_sync_at.is_some());
    assert!(engine.metadata().unwrap().last_partial_sync_at.is_some());
    assert!(collect_events(&mut events)
        .iter()
        .any(|e| matches!(e, SyncEvent::FullSyncFinished { .. })));
}

#[tokio::test]
async fn offline_engine_refuses_to_sync() {
    let engine = engine(FakeServer::new());
    assert!(matches!(engine.sync_now().await, Err(SyncError::Offline)));
    assert!(matches!(engine.full_sync().await, Err(SyncError::Offline)));
}

// ═══════════════════════════════════════════════════════════════════════════
// In-flight operations
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn edit_made_while_create_is_in_flight_survives_and_syncs() {
    init_tracing();
    let server = FakeServer::new();
    let gated = GatedServer::new(server.clone());
    let engine = engine_over(LocalStore::open_in_memory().unwrap(), gated.clone(), test_config());
    let repo = engine.repository();
    let created = repo
        .write(Mutation::CreateExpense(expense_draft("Hotel", 1000, None)))
        .unwrap();
    engine.set_online(true);

    let (report, ()) = tokio::join!(engine.sync_now(), async {
        gated.entered().await;
        repo.write(Mutation::UpdateExpense {
            expense_id: created.entity_id.clone(),
            changes: expense_draft("Hotel", 2000, None),
        })
        .unwrap();
        gated.release();
    });

    let report = report.unwrap();
    assert_eq!(report.synced, 2);
    assert_eq!(
        server.call_kinds(),
        vec![OperationKind::CreateExpense, OperationKind::UpdateExpense]
    );

    // The create's response carried 1000; the newer local edit wins.
    let row = repo.expense(&EntityId::Canonical(42)).unwrap().unwrap();
    assert_eq!(row.amount, 2000);
    assert_eq!(row.sync_state, EntityState::Confirmed);
    let amounts: Vec<i64> = server.expenses().iter().map(|e| e.amount).collect();
    assert_eq!(amounts, vec![2000]);
}

#[tokio::test]
async fn trigger_during_a_drain_is_folded_into_it() {
    let server = FakeServer::new();
    let gated = GatedServer::new(server.clone());
    let engine = engine_over(LocalStore::open_in_memory().unwrap(), gated.clone(), test_config());
    let repo = engine.repository();
    repo.write(Mutation::CreateExpense(expense_draft("Museum", 1500, None)))
        .unwrap();
    engine.set_online(true);

    let (report, overlapping) = tokio::join!(engine.sync_now(), async {
        gated.entered().await;
        repo.write(Mutation::CreateExpense(expense_draft("Dinner", 3000, None)))
            .unwrap();
        let overlapping = engine.sync_now().await.unwrap();
        gated.release();
        overlapping
    });

    assert!(overlapping.skipped);
    assert_eq!(overlapping.synced, 0);

    let report = report.unwrap();
    assert!(!report.skipped);
    assert_eq!(report.synced, 2);
    assert_eq!(report.remaining, 0);
    assert_eq!(server.calls().len(), 2);
    assert_eq!(server.expenses().len(), 2);
    assert!(!engine.metadata().unwrap().sync_in_progress);
}

#[tokio::test]
async fn dropped_drain_releases_its_operation_for_the_next_one() {
    init_tracing();
    let server = FakeServer::new();
    let gated = GatedServer::new(server.clone());
    let engine = engine_over(LocalStore::open_in_memory().unwrap(), gated.clone(), test_config());
    let written = engine
        .repository()
        .write(Mutation::CreateExpense(expense_draft("Taxi", 2300, None)))
        .unwrap();
    engine.set_online(true);

    // The held call never returns; the caller gives up on it.
    let timed_out =
        tokio::time::timeout(std::time::Duration::from_millis(50), engine.sync_now()).await;
    assert!(timed_out.is_err());

    let queued = engine.pending_operations().unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].status, OperationStatus::Pending);
    assert_eq!(queued[0].retry_count, 0);
    assert!(!engine.metadata().unwrap().sync_in_progress);
    assert_eq!(engine.drain_state(), DrainState::Idle);
    let row = engine
        .repository()
        .expense(&written.entity_id)
        .unwrap()
        .unwrap();
    assert_eq!(row.sync_state, EntityState::Local);

    let report = engine.sync_now().await.unwrap();
    assert!(!report.skipped);
    assert_eq!(report.synced, 1);
    assert_eq!(server.calls()[0].0, written.operation_id.unwrap());
    assert_eq!(server.expenses().len(), 1);
}

#[tokio::test]
async fn store_failure_after_send_returns_the_entry_to_pending() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("splitsync.db");
    let server = FakeServer::new();
    let engine = engine_with(LocalStore::open(&path).unwrap(), server.clone(), test_config());
    let written = engine
        .repository()
        .write(Mutation::CreateExpense(expense_draft("Ferry", 900, None)))
        .unwrap();
    engine.set_online(true);

    // Recording the server id is the first write after the send.
    let side = rusqlite::Connection::open(&path).unwrap();
    side.execute_batch(
        "CREATE TRIGGER refuse_mappings BEFORE INSERT ON id_mappings
         BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
    )
    .unwrap();

    assert!(matches!(engine.sync_now().await, Err(SyncError::Storage(_))));
    let queued = engine.pending_operations().unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].status, OperationStatus::Pending);
    assert!(!engine.metadata().unwrap().sync_in_progress);
    let row = engine
        .repository()
        .expense(&written.entity_id)
        .unwrap()
        .unwrap();
    assert_eq!(row.sync_state, EntityState::Local);

    side.execute_batch("DROP TRIGGER refuse_mappings;").unwrap();
    let report = engine.sync_now().await.unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(engine.pending_count().unwrap(), 0);

    // The resend reused the idempotency key, so the server applied it once.
    let keys: Vec<OperationId> = server.calls().iter().map(|(key, _)| *key).collect();
    assert_eq!(keys, vec![written.operation_id.unwrap(); 2]);
    assert_eq!(server.expenses().len(), 1);
    assert!(engine
        .repository()
        .expense(&EntityId::Canonical(42))
        .unwrap()
        .is_some());
}
