//! Durable state for workflow executions.
//!
//! Holds one record per execution plus one row per step attempt, a
//! set-if-absent lock store for entity-scoped mutual exclusion, and an
//! outbox for events awaiting relay. Every store has an in-memory and a
//! PostgreSQL implementation with matching constraint behavior.

pub mod error;
pub mod lock;
pub mod memory;
pub mod outbox;
pub mod postgres;
pub mod query;
pub mod record;
pub mod step;
pub mod store;

pub use common::ExecutionId;
pub use error::{ExecutionStoreError, Result};
pub use lock::{InMemoryLockStore, LockStore};
pub use memory::InMemoryExecutionStore;
pub use outbox::{InMemoryOutboxStore, OutboxMessage, OutboxStore};
pub use postgres::{PostgresExecutionStore, PostgresLockStore, PostgresOutboxStore};
pub use query::{Page, PageRequest};
pub use record::{ExecutionRecord, ExecutionStatistics, ExecutionStatus, NewExecution};
pub use step::{NewStepEvent, StepEventRecord, StepStart, StepStatus, StepTermination, Version};
pub use store::{ExecutionStore, ExecutionStoreExt, IdempotencyClaim, StepEventStore};
