//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p execution-store --test postgres_integration
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use execution_store::{
    ExecutionId, ExecutionStatus, ExecutionStore, ExecutionStoreError, ExecutionStoreExt,
    IdempotencyClaim, LockStore, NewExecution, NewStepEvent, OutboxMessage, OutboxStore,
    PageRequest, PostgresExecutionStore, PostgresLockStore, PostgresOutboxStore, StepEventStore,
    StepStatus, StepTermination, Version,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_workflow_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh pool with cleared tables
async fn get_test_pool() -> PgPool {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query(
        "TRUNCATE TABLE workflow_step_events, workflow_executions, workflow_locks, workflow_outbox",
    )
    .execute(&pool)
    .await
    .unwrap();

    pool
}

async fn get_test_store() -> PostgresExecutionStore {
    PostgresExecutionStore::new(get_test_pool().await)
}

fn started(execution_id: ExecutionId, step_index: i32) -> NewStepEvent {
    NewStepEvent {
        execution_id,
        attempt: 0,
        workflow_name: "order-processing".to_string(),
        step_name: format!("step-{step_index}"),
        step_index,
        total_steps: Some(3),
        input_data: Some(serde_json::json!({"index": step_index})),
        started_at: Utc::now(),
    }
}

fn finished(execution_id: ExecutionId, step_index: i32, status: StepStatus) -> StepTermination {
    StepTermination {
        execution_id,
        attempt: 0,
        workflow_name: "order-processing".to_string(),
        step_name: format!("step-{step_index}"),
        step_index,
        total_steps: Some(3),
        status,
        output_data: Some(serde_json::json!({"ok": status == StepStatus::Completed})),
        error_message: None,
        error_type: None,
        duration_ms: 12,
        completed_at: Utc::now(),
    }
}

#[tokio::test]
#[serial]
async fn create_and_complete_execution() {
    let store = get_test_store().await;

    let record = store
        .create_execution(
            NewExecution::new("order-processing", serde_json::json!({"order": 1}))
                .correlation_id(Some("corr-1".to_string())),
        )
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Running);

    let completed = store
        .complete_execution(record.id, serde_json::json!({"shipped": true}))
        .await
        .unwrap();
    assert_eq!(completed.status, ExecutionStatus::Completed);
    assert!(completed.completed_at.is_some());

    let loaded = store.require_execution(record.id).await.unwrap();
    assert_eq!(loaded.result, Some(serde_json::json!({"shipped": true})));
    assert_eq!(loaded.correlation_id.as_deref(), Some("corr-1"));
}

#[tokio::test]
#[serial]
async fn illegal_transition_is_rejected() {
    let store = get_test_store().await;
    let record = store
        .create_execution(NewExecution::new("order-processing", serde_json::json!({})))
        .await
        .unwrap();

    store
        .complete_execution(record.id, serde_json::json!(null))
        .await
        .unwrap();
    let err = store.fail_execution(record.id, "late").await.unwrap_err();
    assert!(matches!(err, ExecutionStoreError::InvalidTransition { .. }));

    let loaded = store.require_execution(record.id).await.unwrap();
    assert_eq!(loaded.status, ExecutionStatus::Completed);
}

#[tokio::test]
#[serial]
async fn retry_budget_is_enforced() {
    let store = get_test_store().await;
    let record = store
        .create_execution(
            NewExecution::new("order-processing", serde_json::json!({})).max_retries(1),
        )
        .await
        .unwrap();
    store.fail_execution(record.id, "boom").await.unwrap();

    let retried = store.retry_execution(record.id).await.unwrap();
    assert_eq!(retried.retry_count, 1);

    let err = store.retry_execution(record.id).await.unwrap_err();
    assert!(matches!(
        err,
        ExecutionStoreError::RetryBudgetExhausted { .. }
    ));
}

#[tokio::test]
#[serial]
async fn duplicate_idempotency_key_maps_to_conflict() {
    let store = get_test_store().await;
    let new = || {
        NewExecution::new("order-processing", serde_json::json!({})).idempotency_key("order-7")
    };

    store.create_execution(new()).await.unwrap();
    let err = store.create_execution(new()).await.unwrap_err();
    assert!(matches!(err, ExecutionStoreError::IdempotencyConflict { .. }));

    // Same key under another workflow is independent
    store
        .create_execution(
            NewExecution::new("refunds", serde_json::json!({})).idempotency_key("order-7"),
        )
        .await
        .unwrap();
}

#[tokio::test]
#[serial]
async fn claim_idempotency_key_lifecycle() {
    let store = get_test_store().await;
    let new = || {
        NewExecution::new("order-processing", serde_json::json!({"n": 1}))
            .idempotency_key("checkout-1")
    };

    let first = store.claim_idempotency_key(new()).await.unwrap();
    assert!(matches!(first, IdempotencyClaim::Started(_)));
    let id = first.record().id;

    let again = store.claim_idempotency_key(new()).await.unwrap();
    assert!(matches!(again, IdempotencyClaim::InProgress(_)));

    store.fail_execution(id, "boom").await.unwrap();
    let resumed = store.claim_idempotency_key(new()).await.unwrap();
    assert!(matches!(resumed, IdempotencyClaim::Resumed(_)));
    assert_eq!(resumed.record().id, id);
    assert_eq!(resumed.record().status, ExecutionStatus::Running);
    assert_eq!(resumed.record().attempt, 1);
    assert_eq!(store.require_execution(id).await.unwrap().attempt, 1);

    store
        .complete_execution(id, serde_json::json!("done"))
        .await
        .unwrap();
    let cached = store.claim_idempotency_key(new()).await.unwrap();
    assert!(matches!(cached, IdempotencyClaim::Completed(_)));
    assert_eq!(cached.record().result, Some(serde_json::json!("done")));
}

#[tokio::test]
#[serial]
async fn cancelled_key_is_not_reopened() {
    let store = get_test_store().await;
    let new = || {
        NewExecution::new("order-processing", serde_json::json!({})).idempotency_key("checkout-2")
    };

    let id = store.claim_idempotency_key(new()).await.unwrap().record().id;
    store.cancel_execution(id).await.unwrap();

    let claim = store.claim_idempotency_key(new()).await.unwrap();
    assert!(matches!(claim, IdempotencyClaim::Cancelled(_)));
    assert!(!claim.should_execute());
    let stored = store.require_execution(id).await.unwrap();
    assert_eq!(stored.status, ExecutionStatus::Cancelled);
    assert_eq!(stored.attempt, 0);
}

#[tokio::test]
#[serial]
async fn concurrent_claims_start_exactly_one_execution() {
    let store = get_test_store().await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .claim_idempotency_key(
                    NewExecution::new("order-processing", serde_json::json!({}))
                        .idempotency_key("race"),
                )
                .await
        }));
    }

    let mut started = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(IdempotencyClaim::Started(_)) => started += 1,
            Ok(_) | Err(ExecutionStoreError::IdempotencyConflict { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(started, 1);

    let page = store
        .find_executions_by_workflow("order-processing", PageRequest::default())
        .await
        .unwrap();
    assert_eq!(page.total, 1);
}

#[tokio::test]
#[serial]
async fn paging_and_statistics() {
    let store = get_test_store().await;
    let since = Utc::now() - chrono::Duration::minutes(1);

    for n in 0..5 {
        let record = store
            .create_execution(NewExecution::new("order-processing", serde_json::json!(n)))
            .await
            .unwrap();
        if n % 2 == 0 {
            store
                .complete_execution(record.id, serde_json::json!(n))
                .await
                .unwrap();
        } else {
            store.fail_execution(record.id, "nope").await.unwrap();
        }
    }

    let page = store
        .find_executions_by_workflow("order-processing", PageRequest::new(0, 2))
        .await
        .unwrap();
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.total, 5);
    assert!(page.has_next());

    let stats = store
        .get_statistics("order-processing", since)
        .await
        .unwrap();
    assert_eq!(stats.total, 5);
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.failed, 2);
    assert!(stats.average_duration_ms.is_some());
}

#[tokio::test]
#[serial]
async fn step_rows_are_idempotent() {
    let store = get_test_store().await;
    let execution_id = ExecutionId::new();

    let first = store
        .record_step_started(started(execution_id, 0))
        .await
        .unwrap();
    assert!(first.was_inserted());

    let duplicate = store
        .record_step_started(started(execution_id, 0))
        .await
        .unwrap();
    assert!(!duplicate.was_inserted());

    let done = store
        .record_step_finished(finished(execution_id, 0, StepStatus::Completed))
        .await
        .unwrap();
    assert_eq!(done.status, StepStatus::Completed);
    assert_eq!(done.version, Version::new(2));

    let err = store
        .record_step_finished(finished(execution_id, 0, StepStatus::Failed))
        .await
        .unwrap_err();
    assert!(err.is_lost_race());

    let stored = store.get_step_event(execution_id, 0, 0).await.unwrap().unwrap();
    assert_eq!(stored.status, StepStatus::Completed);
}

#[tokio::test]
#[serial]
async fn later_attempt_gets_fresh_step_rows() {
    let store = get_test_store().await;
    let execution_id = ExecutionId::new();

    store
        .record_step_started(started(execution_id, 0))
        .await
        .unwrap();
    store
        .record_step_finished(finished(execution_id, 0, StepStatus::Failed))
        .await
        .unwrap();

    let mut retry = started(execution_id, 0);
    retry.attempt = 1;
    assert!(store.record_step_started(retry).await.unwrap().was_inserted());

    let mut done = finished(execution_id, 0, StepStatus::Completed);
    done.attempt = 1;
    store.record_step_finished(done).await.unwrap();

    let latest = store.get_step_events(execution_id).await.unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].attempt, 1);
    assert_eq!(latest[0].status, StepStatus::Completed);

    let history: Vec<_> = store
        .get_step_history(execution_id)
        .await
        .unwrap()
        .into_iter()
        .map(|step| (step.attempt, step.status))
        .collect();
    assert_eq!(
        history,
        vec![(0, StepStatus::Failed), (1, StepStatus::Completed)]
    );
}

#[tokio::test]
#[serial]
async fn concurrent_finalizers_have_one_winner() {
    let store = get_test_store().await;
    let execution_id = ExecutionId::new();
    store
        .record_step_started(started(execution_id, 1))
        .await
        .unwrap();

    let a = store.clone();
    let b = store.clone();
    let (left, right) = tokio::join!(
        a.record_step_finished(finished(execution_id, 1, StepStatus::Completed)),
        b.record_step_finished(finished(execution_id, 1, StepStatus::Failed)),
    );

    let winners = [&left, &right].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    for result in [left, right] {
        if let Err(err) = result {
            assert!(err.is_lost_race());
        }
    }
}

#[tokio::test]
#[serial]
async fn finish_without_start_inserts_terminal_row() {
    let store = get_test_store().await;
    let execution_id = ExecutionId::new();

    let record = store
        .record_step_finished(finished(execution_id, 2, StepStatus::Failed))
        .await
        .unwrap();
    assert_eq!(record.status, StepStatus::Failed);
    assert_eq!(record.version, Version::first());

    let steps = store.get_step_events(execution_id).await.unwrap();
    assert_eq!(steps.len(), 1);
}

#[tokio::test]
#[serial]
async fn lock_is_exclusive_until_deleted() {
    let locks = PostgresLockStore::new(get_test_pool().await);
    let ttl = Duration::from_secs(30);

    assert!(locks.set_if_absent_with_expiry("entity:42", "a", ttl).await.unwrap());
    assert!(!locks.set_if_absent_with_expiry("entity:42", "b", ttl).await.unwrap());
    assert!(locks.delete("entity:42").await.unwrap());
    assert!(locks.set_if_absent_with_expiry("entity:42", "b", ttl).await.unwrap());
    locks.ping().await.unwrap();
}

#[tokio::test]
#[serial]
async fn expired_lock_can_be_taken_over() {
    let locks = PostgresLockStore::new(get_test_pool().await);

    assert!(
        locks
            .set_if_absent_with_expiry("entity:1", "a", Duration::from_millis(50))
            .await
            .unwrap()
    );
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(
        locks
            .set_if_absent_with_expiry("entity:1", "b", Duration::from_secs(30))
            .await
            .unwrap()
    );
}

#[tokio::test]
#[serial]
async fn outbox_tracks_dispatch() {
    let outbox = PostgresOutboxStore::new(get_test_pool().await);
    let message = OutboxMessage::new("workflow-events", "exec-1", serde_json::json!({"n": 1}));
    let id = message.id;

    outbox.append(message).await.unwrap();
    assert_eq!(outbox.pending(10).await.unwrap().len(), 1);

    outbox.mark_dispatched(&[id]).await.unwrap();
    assert!(outbox.pending(10).await.unwrap().is_empty());
}
