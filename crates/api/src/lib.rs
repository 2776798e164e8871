//! Admin and introspection HTTP service for the workflow engine.
//!
//! Lists registered workflows, pages through executions and step rows,
//! exposes retry/pause/resume/cancel, streams live events over SSE and
//! serves Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use execution_store::{
    ExecutionStoreError, InMemoryExecutionStore, InMemoryLockStore, InMemoryOutboxStore,
    PostgresExecutionStore, PostgresLockStore, PostgresOutboxStore,
};
use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::PgPool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use workflow::{BroadcastSink, EngineConfig, EventPublisher, OutboxSink, WorkflowEngine};

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
    /// Real-time sink the engine publishes to; `/events` subscribes here.
    pub live: BroadcastSink,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/workflows", get(routes::workflows::list))
        .route(
            "/workflows/{name}/executions",
            get(routes::workflows::executions).post(routes::workflows::start),
        )
        .route(
            "/workflows/{name}/statistics",
            get(routes::workflows::statistics),
        )
        .route("/executions/{id}", get(routes::executions::get))
        .route("/executions/{id}/steps", get(routes::executions::steps))
        .route("/executions/{id}/retry", post(routes::executions::retry))
        .route("/executions/{id}/pause", post(routes::executions::pause))
        .route("/executions/{id}/resume", post(routes::executions::resume))
        .route("/executions/{id}/cancel", post(routes::executions::cancel))
        .route("/events", get(routes::events::stream))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates application state backed by in-memory stores.
pub fn create_in_memory_state(config: EngineConfig) -> Arc<AppState> {
    let store = InMemoryExecutionStore::new();
    let live = BroadcastSink::new(config.broadcast_capacity);

    let publisher = EventPublisher::new(config.events_topic.clone())
        .with_durable_sink(Arc::new(OutboxSink::new(Arc::new(InMemoryOutboxStore::new()))))
        .with_realtime_sink(Arc::new(live.clone()))
        .with_step_store(Arc::new(store.clone()));

    let engine = WorkflowEngine::new(
        config,
        Arc::new(store.clone()),
        Arc::new(store),
        Arc::new(InMemoryLockStore::new()),
        Arc::new(publisher),
    );

    Arc::new(AppState {
        engine: Arc::new(engine),
        live,
    })
}

/// Creates application state backed by PostgreSQL, running migrations first.
pub async fn create_postgres_state(
    config: EngineConfig,
    pool: PgPool,
) -> Result<Arc<AppState>, ExecutionStoreError> {
    let store = PostgresExecutionStore::new(pool.clone());
    store.run_migrations().await?;
    let live = BroadcastSink::new(config.broadcast_capacity);

    let publisher = EventPublisher::new(config.events_topic.clone())
        .with_durable_sink(Arc::new(OutboxSink::new(Arc::new(PostgresOutboxStore::new(
            pool.clone(),
        )))))
        .with_realtime_sink(Arc::new(live.clone()))
        .with_step_store(Arc::new(store.clone()));

    let engine = WorkflowEngine::new(
        config,
        Arc::new(store.clone()),
        Arc::new(store),
        Arc::new(PostgresLockStore::new(pool)),
        Arc::new(publisher),
    );

    Ok(Arc::new(AppState {
        engine: Arc::new(engine),
        live,
    }))
}
