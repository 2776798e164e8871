//! Saga-style workflow execution.
//!
//! A [`Workflow`] is a named sequence of [`Step`]s, each with an optional
//! compensation. The [`WorkflowEngine`] persists every run, takes a lock,
//! enforces a timeout and unwinds completed steps in reverse when the run
//! fails. Lifecycle and step events flow through an [`EventPublisher`] to a
//! durable sink, a real-time sink and the step-event store.
//!
//! Named workflows can be extended without modification through
//! [`Customizer`]s and [`StepProvider`]s; see [`extension`].

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod extension;
pub mod outcome;
pub mod publisher;
pub mod registry;
pub mod step;
pub mod workflow;

pub use config::{EngineConfig, WorkflowOptions};
pub use context::ExecutionContext;
pub use engine::WorkflowEngine;
pub use error::{PublishError, Result, StepError, WorkflowError};
pub use events::{EventEnvelope, EventSource, WorkflowEvent};
pub use extension::{
    Customizer, ExtensibleWorkflow, Extended, ExtensionRegistry, ExtensionRegistryBuilder,
    StepPosition, StepProvider, StepRunner,
};
pub use outcome::{Failure, FailureKind, Outcome};
pub use publisher::{
    BroadcastSink, DurableSink, EventPublisher, InMemoryDurableSink, OutboxSink, RealtimeSink,
};
pub use registry::WorkflowInfo;
pub use step::{Compensation, Step, StepAction};
pub use workflow::Workflow;
