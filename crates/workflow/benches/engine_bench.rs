use std::sync::Arc;

use async_trait::async_trait;
use criterion::{Criterion, criterion_group, criterion_main};
use execution_store::{InMemoryExecutionStore, InMemoryLockStore};
use workflow::{
    EngineConfig, EventPublisher, ExecutionContext, InMemoryDurableSink, Outcome, Step, StepError,
    Workflow, WorkflowEngine, WorkflowOptions,
};

struct Chain {
    steps: u32,
    fail_last: bool,
}

#[async_trait]
impl Workflow for Chain {
    type Input = u32;
    type Output = u32;

    fn name(&self) -> &str {
        "bench-chain"
    }

    fn total_steps(&self) -> Option<u32> {
        Some(self.steps)
    }

    async fn execute(
        &self,
        input: u32,
        ctx: &mut ExecutionContext,
    ) -> Result<Outcome<u32>, StepError> {
        let mut value = input;
        for i in 0..self.steps {
            let fail = self.fail_last && i + 1 == self.steps;
            let step = Step::from_fn(format!("step-{i}"), move |n: u32| async move {
                if fail {
                    return Err(StepError::new("Bench", "last step fails"));
                }
                Ok(n + 1)
            })
            .with_compensation_fn(|_| async { Ok(()) });
            value = step.invoke(value, ctx).await?;
        }
        Ok(Outcome::Success(value))
    }
}

fn engine() -> WorkflowEngine {
    let store = InMemoryExecutionStore::new();
    let publisher = EventPublisher::new("bench")
        .with_durable_sink(Arc::new(InMemoryDurableSink::new()))
        .with_step_store(Arc::new(store.clone()));
    WorkflowEngine::new(
        EngineConfig::default(),
        Arc::new(store.clone()),
        Arc::new(store),
        Arc::new(InMemoryLockStore::new()),
        Arc::new(publisher),
    )
}

fn bench_execute_10_steps(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let workflow = Chain {
        steps: 10,
        fail_last: false,
    };

    c.bench_function("engine/execute_10_steps", |b| {
        b.iter(|| {
            rt.block_on(async {
                let engine = engine();
                engine
                    .execute_workflow(&workflow, 0, None, WorkflowOptions::new())
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_compensate_10_steps(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let workflow = Chain {
        steps: 10,
        fail_last: true,
    };

    c.bench_function("engine/compensate_10_steps", |b| {
        b.iter(|| {
            rt.block_on(async {
                let engine = engine();
                engine
                    .execute_workflow(&workflow, 0, None, WorkflowOptions::new())
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_idempotent_hit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let workflow = Chain {
        steps: 1,
        fail_last: false,
    };
    let engine = engine();
    rt.block_on(async {
        engine
            .execute_idempotent("bench-key", &workflow, 0, WorkflowOptions::new())
            .await
            .unwrap();
    });

    c.bench_function("engine/idempotent_hit", |b| {
        b.iter(|| {
            rt.block_on(async {
                engine
                    .execute_idempotent("bench-key", &workflow, 0, WorkflowOptions::new())
                    .await
                    .unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_execute_10_steps,
    bench_compensate_10_steps,
    bench_idempotent_hit
);
criterion_main!(benches);
