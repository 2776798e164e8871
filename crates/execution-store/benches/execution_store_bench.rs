use chrono::Utc;
use criterion::{Criterion, criterion_group, criterion_main};
use execution_store::{
    ExecutionId, ExecutionStore, InMemoryExecutionStore, NewExecution, NewStepEvent,
    StepEventStore, StepStatus, StepTermination,
};

fn started(execution_id: ExecutionId, step_index: i32) -> NewStepEvent {
    NewStepEvent {
        execution_id,
        attempt: 0,
        workflow_name: "bench".to_string(),
        step_name: format!("step-{step_index}"),
        step_index,
        total_steps: Some(10),
        input_data: None,
        started_at: Utc::now(),
    }
}

fn finished(execution_id: ExecutionId, step_index: i32) -> StepTermination {
    StepTermination {
        execution_id,
        attempt: 0,
        workflow_name: "bench".to_string(),
        step_name: format!("step-{step_index}"),
        step_index,
        total_steps: Some(10),
        status: StepStatus::Completed,
        output_data: Some(serde_json::json!({"ok": true})),
        error_message: None,
        error_type: None,
        duration_ms: 1,
        completed_at: Utc::now(),
    }
}

fn bench_create_and_complete(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("execution_store/create_and_complete", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryExecutionStore::new();
                let record = store
                    .create_execution(NewExecution::new("bench", serde_json::json!({"n": 1})))
                    .await
                    .unwrap();
                store
                    .complete_execution(record.id, serde_json::json!(null))
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_step_lifecycle_10(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("execution_store/step_lifecycle_10", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryExecutionStore::new();
                let execution_id = ExecutionId::new();
                for index in 0..10 {
                    store
                        .record_step_started(started(execution_id, index))
                        .await
                        .unwrap();
                    store
                        .record_step_finished(finished(execution_id, index))
                        .await
                        .unwrap();
                }
            });
        });
    });
}

fn bench_claim_idempotency_key(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryExecutionStore::new();

    c.bench_function("execution_store/claim_existing_key", |b| {
        b.iter(|| {
            rt.block_on(async {
                store
                    .claim_idempotency_key(
                        NewExecution::new("bench", serde_json::json!({})).idempotency_key("hot"),
                    )
                    .await
                    .unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_create_and_complete,
    bench_step_lifecycle_10,
    bench_claim_idempotency_key
);
criterion_main!(benches);
