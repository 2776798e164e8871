//! Engine-wide defaults and per-call options.

use std::time::Duration;

use execution_store::ExecutionId;

/// Engine defaults.
///
/// Reads from environment variables:
/// - `WORKFLOW_DEFAULT_TIMEOUT_SECS`: body timeout (default: `300`)
/// - `WORKFLOW_DEFAULT_MAX_RETRIES`: retry budget per execution (default: `3`)
/// - `WORKFLOW_LOCK_TTL_SECS`: lock expiry (default: `60`)
/// - `WORKFLOW_EVENTS_TOPIC`: durable sink topic (default: `"workflow-events"`)
/// - `WORKFLOW_BROADCAST_CAPACITY`: real-time channel buffer (default: `1024`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub default_timeout: Duration,
    pub default_max_retries: i32,
    pub lock_ttl: Duration,
    pub events_topic: String,
    pub broadcast_capacity: usize,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_timeout: Duration::from_secs(env_or(
                "WORKFLOW_DEFAULT_TIMEOUT_SECS",
                defaults.default_timeout.as_secs(),
            )),
            default_max_retries: env_or(
                "WORKFLOW_DEFAULT_MAX_RETRIES",
                defaults.default_max_retries,
            ),
            lock_ttl: Duration::from_secs(env_or(
                "WORKFLOW_LOCK_TTL_SECS",
                defaults.lock_ttl.as_secs(),
            )),
            events_topic: std::env::var("WORKFLOW_EVENTS_TOPIC")
                .unwrap_or(defaults.events_topic),
            broadcast_capacity: env_or(
                "WORKFLOW_BROADCAST_CAPACITY",
                defaults.broadcast_capacity,
            ),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            default_max_retries: 3,
            lock_ttl: Duration::from_secs(60),
            events_topic: "workflow-events".to_string(),
            broadcast_capacity: 1024,
        }
    }
}

/// Per-call overrides. Unset fields fall back to [`EngineConfig`].
#[derive(Debug, Clone, Default)]
pub struct WorkflowOptions {
    pub parent_execution_id: Option<ExecutionId>,
    pub correlation_id: Option<String>,
    pub max_retries: Option<i32>,
    pub timeout: Option<Duration>,
    /// Business-entity lock key. Without one each run locks its own execution id.
    pub lock_key: Option<String>,
    pub lock_ttl: Option<Duration>,
}

impl WorkflowOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parent_execution_id(mut self, parent: ExecutionId) -> Self {
        self.parent_execution_id = Some(parent);
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn lock_key(mut self, lock_key: impl Into<String>) -> Self {
        self.lock_key = Some(lock_key.into());
        self
    }

    pub fn lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = Some(lock_ttl);
        self
    }

    pub(crate) fn resolve(self, config: &EngineConfig) -> ResolvedOptions {
        ResolvedOptions {
            parent_execution_id: self.parent_execution_id,
            correlation_id: self.correlation_id,
            max_retries: self.max_retries.unwrap_or(config.default_max_retries),
            timeout: self.timeout.unwrap_or(config.default_timeout),
            lock_key: self.lock_key,
            lock_ttl: self.lock_ttl.unwrap_or(config.lock_ttl),
        }
    }
}

/// Options with every default applied.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedOptions {
    pub parent_execution_id: Option<ExecutionId>,
    pub correlation_id: Option<String>,
    pub max_retries: i32,
    pub timeout: Duration,
    pub lock_key: Option<String>,
    pub lock_ttl: Duration,
}
