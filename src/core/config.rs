use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::activity::RetryPolicy;

/// Well-known name of the queue workers poll for activity and workflow tasks.
pub const TASK_QUEUE_NAME: &str = "latency-optimization-tq";

/// Well-known name of the update handler that returns the phase-1 result.
pub const UPDATE_NAME: &str = "early-return";

/// Orchestration configuration with all tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Queue used for remote activities and workflow tasks
    pub task_queue: String,

    // Phase envelopes
    /// Schedule-to-close budget for Register and Init (phase 1)
    pub init_timeout: Duration,
    /// Start-to-close budget for Cancel and Complete (phase 2)
    pub finalize_timeout: Duration,
    /// Retry policy applied inside the phase-1 envelope
    pub init_retry: RetryPolicy,
    /// Retry policy applied inside the phase-2 envelope
    pub finalize_retry: RetryPolicy,

    /// Bound on a client round trip such as start-with-update
    pub rpc_timeout: Duration,

    // Worker pool
    /// Maximum number of activity tasks executed concurrently by one pool
    pub max_concurrent_activities: usize,
    /// Maximum number of instances driven concurrently by one pool
    pub max_concurrent_workflows: usize,
    /// Maximum number of entries in a ready queue
    pub queue_capacity: usize,
    /// Idle poll interval used when a queue has nothing ready
    pub poll_interval: Duration,

    /// Database path for persistence; a temporary database is used when unset
    pub db_path: Option<PathBuf>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            task_queue: TASK_QUEUE_NAME.to_string(),

            init_timeout: Duration::from_secs(5),
            finalize_timeout: Duration::from_secs(30),
            init_retry: RetryPolicy::default(),
            finalize_retry: RetryPolicy::default(),

            rpc_timeout: Duration::from_secs(5),

            max_concurrent_activities: 16,
            max_concurrent_workflows: 64,
            queue_capacity: 10_000,
            poll_interval: Duration::from_millis(50),

            db_path: None,
        }
    }
}

impl FlowConfig {
    /// Create a new builder for FlowConfig
    pub fn builder() -> FlowConfigBuilder {
        FlowConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.task_queue.trim().is_empty() {
            return Err("task_queue must not be empty".to_string());
        }

        if self.max_concurrent_activities == 0 {
            return Err("max_concurrent_activities must be greater than 0".to_string());
        }
        if self.max_concurrent_workflows == 0 {
            return Err("max_concurrent_workflows must be greater than 0".to_string());
        }
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be greater than 0".to_string());
        }

        if self.init_timeout.is_zero() {
            return Err("init_timeout must be greater than 0".to_string());
        }
        if self.init_timeout > self.finalize_timeout {
            return Err("init_timeout cannot exceed finalize_timeout".to_string());
        }
        if self.rpc_timeout.is_zero() {
            return Err("rpc_timeout must be greater than 0".to_string());
        }

        self.init_retry.validate().map_err(|e| format!("init_retry: {e}"))?;
        self.finalize_retry
            .validate()
            .map_err(|e| format!("finalize_retry: {e}"))?;

        Ok(())
    }

    /// Create a configuration optimized for development/testing
    pub fn development() -> Self {
        Self {
            init_timeout: Duration::from_secs(2),
            finalize_timeout: Duration::from_secs(10),
            max_concurrent_activities: 4,
            max_concurrent_workflows: 8,
            queue_capacity: 100,
            poll_interval: Duration::from_millis(10),
            init_retry: RetryPolicy {
                initial_interval: Duration::from_millis(20),
                maximum_interval: Duration::from_millis(200),
                ..RetryPolicy::default()
            },
            finalize_retry: RetryPolicy {
                initial_interval: Duration::from_millis(20),
                maximum_interval: Duration::from_millis(500),
                ..RetryPolicy::default()
            },
            ..Default::default()
        }
    }

    /// Default configuration with `TXFLOW_*` environment overrides applied.
    pub fn from_env() -> Result<Self, String> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `TXFLOW_*` overrides read through `lookup` and re-validate.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("TXFLOW_DB_PATH").filter(|v| !v.is_empty()) {
            self.db_path = Some(PathBuf::from(path));
        }
        if let Some(queue) = lookup("TXFLOW_TASK_QUEUE").filter(|v| !v.is_empty()) {
            self.task_queue = queue;
        }
        if let Some(ms) = parse_u64(&lookup, "TXFLOW_INIT_TIMEOUT_MS")? {
            self.init_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_u64(&lookup, "TXFLOW_FINALIZE_TIMEOUT_MS")? {
            self.finalize_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_u64(&lookup, "TXFLOW_RPC_TIMEOUT_MS")? {
            self.rpc_timeout = Duration::from_millis(ms);
        }
        if let Some(workers) = parse_u64(&lookup, "TXFLOW_MAX_WORKERS")? {
            self.max_concurrent_activities = workers as usize;
        }

        self.validate()?;
        Ok(self)
    }
}

fn parse_u64<F>(lookup: &F, key: &str) -> Result<Option<u64>, String>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| format!("{key}: invalid value '{raw}': {e}")),
    }
}

/// Builder for FlowConfig
pub struct FlowConfigBuilder {
    config: FlowConfig,
}

impl Default for FlowConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: FlowConfig::default(),
        }
    }

    pub fn task_queue(mut self, name: impl Into<String>) -> Self {
        self.config.task_queue = name.into();
        self
    }

    /// Set the phase-1 and phase-2 envelopes
    pub fn phase_timeouts(mut self, init: Duration, finalize: Duration) -> Self {
        self.config.init_timeout = init;
        self.config.finalize_timeout = finalize;
        self
    }

    pub fn init_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.init_retry = policy;
        self
    }

    pub fn finalize_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.finalize_retry = policy;
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.config.rpc_timeout = timeout;
        self
    }

    /// Set worker concurrency
    pub fn workers(mut self, activities: usize, workflows: usize) -> Self {
        self.config.max_concurrent_activities = activities;
        self.config.max_concurrent_workflows = workflows;
        self
    }

    /// Set queue capacity
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set database path
    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.db_path = Some(path.into());
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<FlowConfig, String> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = FlowConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.task_queue, "latency-optimization-tq");
        assert_eq!(config.init_timeout, Duration::from_secs(5));
        assert_eq!(config.finalize_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_development_config() {
        let config = FlowConfig::development();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_concurrent_activities, 4);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = FlowConfig::default();

        config.max_concurrent_activities = 0;
        assert!(config.validate().is_err());
        config.max_concurrent_activities = 4;

        config.max_concurrent_workflows = 0;
        assert!(config.validate().is_err());
        config.max_concurrent_workflows = 4;

        config.init_timeout = Duration::from_secs(60);
        let err = config.validate().unwrap_err();
        assert!(err.contains("init_timeout"));
    }

    #[test]
    fn test_builder() {
        let config = FlowConfig::builder()
            .task_queue("custom-tq")
            .phase_timeouts(Duration::from_millis(500), Duration::from_secs(3))
            .workers(2, 3)
            .queue_capacity(50)
            .db_path("/tmp/txflow_test_db")
            .build()
            .unwrap();

        assert_eq!(config.task_queue, "custom-tq");
        assert_eq!(config.init_timeout, Duration::from_millis(500));
        assert_eq!(config.max_concurrent_workflows, 3);
        assert_eq!(config.queue_capacity, 50);
        assert!(config.db_path.is_some());

        assert!(FlowConfig::builder().workers(0, 1).build().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TXFLOW_TASK_QUEUE", "env-tq"),
            ("TXFLOW_INIT_TIMEOUT_MS", "250"),
            ("TXFLOW_MAX_WORKERS", "7"),
        ]
        .into_iter()
        .collect();

        let config = FlowConfig::default()
            .with_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.task_queue, "env-tq");
        assert_eq!(config.init_timeout, Duration::from_millis(250));
        assert_eq!(config.max_concurrent_activities, 7);

        let bad = FlowConfig::default().with_overrides(|k| {
            (k == "TXFLOW_RPC_TIMEOUT_MS").then(|| "soon".to_string())
        });
        assert!(bad.is_err());
    }
}
