//! Integration tests for PostgresStore
//!
//! Run with: cargo test -p contd-durable --test postgres_integration_test -- --test-threads=1
//!
//! Requirements:
//! - PostgreSQL reachable via DATABASE_URL (tests are skipped otherwise)
//! - Migrations are applied automatically on first connect

use std::time::Duration;

use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use contd_core::{CompletedStep, Event, EventPayload, Snapshot, Variables, WorkflowState};
use contd_durable::persistence::{
    AttemptOutcome, DurableStore, IdempotencyStore, JournalStore, LeaseStore, PostgresStore,
    SnapshotStore, StoreError,
};

/// Connect to the test database, or None when DATABASE_URL is unset or
/// unreachable (the test is then skipped).
async fn try_store() -> Option<PostgresStore> {
    dotenvy::dotenv().ok();
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = match PgPool::connect(&url).await {
        Ok(pool) => pool,
        Err(err) => {
            eprintln!("skipping postgres tests: {err}");
            return None;
        }
    };
    let store = PostgresStore::new(pool);
    store.migrate().await.expect("migrations should apply");
    Some(store)
}

/// Delete rows for a workflow, in reverse dependency order.
async fn cleanup(store: &PostgresStore, workflow_id: &str) {
    for table in [
        "contd_completed_steps",
        "contd_step_attempts",
        "contd_snapshots",
        "contd_events",
        "contd_workflow_leases",
        "contd_lease_tokens",
    ] {
        sqlx::query(&format!("DELETE FROM {table} WHERE workflow_id = $1"))
            .bind(workflow_id)
            .execute(store.pool())
            .await
            .ok();
    }
}

fn intention(workflow_id: &str, attempt_id: u32) -> Event {
    Event::new(
        workflow_id,
        "org-test",
        EventPayload::StepIntention {
            step_id: "a_1".to_string(),
            step_name: "a".to_string(),
            attempt_id,
            fencing_token: 1,
        },
    )
}

#[tokio::test]
async fn test_append_assigns_contiguous_sequences() {
    let Some(store) = try_store().await else { return };
    let workflow_id = format!("wf-pg-{}", Uuid::now_v7());

    let first = store.append(intention(&workflow_id, 1)).await.unwrap();
    let second = store.append(intention(&workflow_id, 2)).await.unwrap();
    assert_eq!(first.event_seq, 1);
    assert_eq!(second.event_seq, 2);

    let events = store.read_range(&workflow_id, 1, i64::MAX).await.unwrap();
    assert_eq!(events.len(), 2);
    for event in &events {
        event.verify_checksum().unwrap();
    }

    let (seq, id) = store.tail(&workflow_id).await.unwrap().unwrap();
    assert_eq!(seq, 2);
    assert_eq!(id, second.event_id);

    cleanup(&store, &workflow_id).await;
}

#[tokio::test]
async fn test_duplicate_event_id_is_rejected() {
    let Some(store) = try_store().await else { return };
    let workflow_id = format!("wf-pg-{}", Uuid::now_v7());

    let event = intention(&workflow_id, 1);
    let copy = event.clone();
    store.append(event).await.unwrap();

    let err = store.append(copy).await.unwrap_err();
    assert!(matches!(err, StoreError::DuplicateEvent(_)));

    cleanup(&store, &workflow_id).await;
}

#[tokio::test]
async fn test_lease_lifecycle_with_fencing() {
    let Some(store) = try_store().await else { return };
    let workflow_id = format!("wf-pg-{}", Uuid::now_v7());
    let ttl = Duration::from_secs(30);

    let lease = store.acquire(&workflow_id, "exec-a", ttl).await.unwrap();
    assert_eq!(lease.fencing_token, 1);

    let err = store
        .acquire(&workflow_id, "exec-b", ttl)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::LeaseHeld { .. }));

    let renewed = store.heartbeat(&lease, ttl).await.unwrap();
    assert!(renewed.lease_expires_at > lease.lease_expires_at);

    // Token keeps increasing across a release/re-acquire cycle.
    store.release(&lease).await.unwrap();
    let again = store.acquire(&workflow_id, "exec-b", ttl).await.unwrap();
    assert_eq!(again.fencing_token, 2);

    let err = store.heartbeat(&lease, ttl).await.unwrap_err();
    assert!(matches!(err, StoreError::LeaseMismatch(_)));

    store.release(&again).await.unwrap();
    cleanup(&store, &workflow_id).await;
}

#[tokio::test]
async fn test_attempts_and_exactly_once_completion() {
    let Some(store) = try_store().await else { return };
    let workflow_id = format!("wf-pg-{}", Uuid::now_v7());

    let lease = store
        .acquire(&workflow_id, "exec-a", Duration::from_secs(30))
        .await
        .unwrap();

    let outcome = store
        .allocate_attempt(&workflow_id, "a_1", lease.fencing_token)
        .await
        .unwrap();
    let attempt = match outcome {
        AttemptOutcome::Allocated(attempt) => attempt,
        other => panic!("unexpected outcome: {other:?}"),
    };
    assert_eq!(attempt.attempt_id, 1);

    let err = store.allocate_attempt(&workflow_id, "a_1", 99).await.unwrap_err();
    assert!(matches!(err, StoreError::LeaseMismatch(_)));

    // A completion write under a stale token is fenced out before
    // anything lands.
    let err = store
        .append_with_completion(
            Event::new(
                &workflow_id,
                "org-test",
                EventPayload::StepCompleted {
                    step_id: "a_1".to_string(),
                    attempt_id: 1,
                    state_delta: Default::default(),
                    new_state_checksum: "unchecked".to_string(),
                    duration_ms: 1,
                },
            ),
            CompletedStep::record(&workflow_id, "a_1", 1, json!({"y": 2})),
            99,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::LeaseMismatch(_)));
    assert!(store.tail(&workflow_id).await.unwrap().is_none());

    // Commit the completion together with its journal event.
    let completion = CompletedStep::record(&workflow_id, "a_1", 1, json!({"y": 2}));
    let event = Event::new(
        &workflow_id,
        "org-test",
        EventPayload::StepCompleted {
            step_id: "a_1".to_string(),
            attempt_id: 1,
            state_delta: Default::default(),
            new_state_checksum: "unchecked".to_string(),
            duration_ms: 1,
        },
    );
    let sealed = store
        .append_with_completion(event, completion.clone(), lease.fencing_token)
        .await
        .unwrap();
    assert_eq!(sealed.event_seq, 1);

    // A second completion for the same step is refused and appends nothing.
    let err = store
        .append_with_completion(
            Event::new(
                &workflow_id,
                "org-test",
                EventPayload::StepCompleted {
                    step_id: "a_1".to_string(),
                    attempt_id: 2,
                    state_delta: Default::default(),
                    new_state_checksum: "unchecked".to_string(),
                    duration_ms: 1,
                },
            ),
            CompletedStep::record(&workflow_id, "a_1", 2, json!({"y": 3})),
            lease.fencing_token,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::AlreadyCompleted { .. }));
    let (seq, _) = store.tail(&workflow_id).await.unwrap().unwrap();
    assert_eq!(seq, 1);

    // Allocation now reports the completion instead of a new attempt.
    let outcome = store
        .allocate_attempt(&workflow_id, "a_1", lease.fencing_token)
        .await
        .unwrap();
    assert!(matches!(outcome, AttemptOutcome::AlreadyCompleted(done) if done.attempt_id == 1));

    store.release(&lease).await.unwrap();
    cleanup(&store, &workflow_id).await;
}

#[tokio::test]
async fn test_snapshot_round_trip_and_latest() {
    let Some(store) = try_store().await else { return };
    let workflow_id = format!("wf-pg-{}", Uuid::now_v7());

    let mut vars = Variables::new();
    vars.insert("x".to_string(), json!(1));
    let state = WorkflowState::initial(
        workflow_id.clone(),
        "org-test",
        "flow",
        vars,
        Variables::new(),
        chrono::Utc::now(),
    );

    let early = Snapshot::inline(state.clone(), 0);
    let late = Snapshot::inline(state.clone(), 5);
    store.put(early.clone()).await.unwrap();
    store.put(early.clone()).await.unwrap(); // idempotent
    store.put(late.clone()).await.unwrap();

    let found = store.get_latest(&workflow_id, i64::MAX).await.unwrap().unwrap();
    assert_eq!(found.snapshot_id, late.snapshot_id);
    let bounded = store.get_latest(&workflow_id, 3).await.unwrap().unwrap();
    assert_eq!(bounded.snapshot_id, early.snapshot_id);

    let listed = store.list(&workflow_id).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].snapshot_id, late.snapshot_id);

    cleanup(&store, &workflow_id).await;
}
