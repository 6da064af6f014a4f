use std::time::Duration;
use thiserror::Error;

use crate::activity::ActivityError;
use crate::transaction::TransactionError;

/// Unified infrastructure error type for the txflow crate.
///
/// Business outcomes of a transaction are not represented here except through
/// [`FlowError::Transaction`], which carries the terminal result of an
/// instance when a caller asks for it as an error.
#[derive(Debug, Error)]
pub enum FlowError {
    /// sled or another history backend failed
    #[error("Store operation failed: {operation}")]
    Database {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A record could not be encoded or decoded
    #[error("Could not encode or decode {format} data")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("I/O failed during {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Invalid `FlowConfig`, connection or worker settings
    #[error("Invalid configuration: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// A caller-supplied request was malformed
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Instance already exists: {instance_id}")]
    InstanceAlreadyExists { instance_id: String },

    #[error("Instance not found: {instance_id}")]
    InstanceNotFound { instance_id: String },

    /// The instance is persisted but not loaded by any engine in this process
    #[error("Instance not running in this process: {instance_id}")]
    InstanceNotRunning { instance_id: String },

    #[error("Instance already closed: {instance_id}")]
    InstanceClosed { instance_id: String },

    #[error("Unknown update handler '{name}' on instance {instance_id}")]
    UnknownUpdate { instance_id: String, name: String },

    #[error("Queue full: {queue} (capacity {capacity})")]
    QueueFull { queue: String, capacity: usize },

    #[error("{operation} did not finish within {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("{channel} channel failed: {message}")]
    Channel { channel: String, message: String },

    #[error("Engine is shutting down")]
    Shutdown,

    /// Terminal business outcome of an instance
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("Internal engine error: {message}")]
    Internal { message: String },
}

impl FlowError {
    pub fn database<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        operation: S,
        source: E,
    ) -> Self {
        Self::Database {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Configuration error naming the offending field.
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn channel<S: Into<String>, M: Into<String>>(channel: S, message: M) -> Self {
        Self::Channel {
            channel: channel.into(),
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database { .. }
            | Self::Io { .. }
            | Self::QueueFull { .. }
            | Self::Timeout { .. }
            | Self::Channel { .. }
            | Self::InstanceNotRunning { .. } => true,

            Self::Configuration { .. }
            | Self::InvalidRequest { .. }
            | Self::InstanceAlreadyExists { .. }
            | Self::InstanceNotFound { .. }
            | Self::InstanceClosed { .. }
            | Self::UnknownUpdate { .. }
            | Self::Serialization { .. }
            | Self::Transaction(_)
            | Self::Shutdown
            | Self::Internal { .. } => false,
        }
    }

    /// How long a caller should back off before repeating the call.
    pub fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            Self::QueueFull { .. } => Some(Duration::from_millis(100)),
            Self::Database { .. } => Some(Duration::from_secs(2)),
            Self::Io { .. } => Some(Duration::from_secs(1)),
            Self::InstanceNotRunning { .. } => Some(Duration::from_secs(5)),
            _ if self.is_retryable() => Some(Duration::from_secs(1)),
            _ => None,
        }
    }

    /// Short label used as a structured log field.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Database { .. } => "database",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Configuration { .. } => "configuration",
            Self::InvalidRequest { .. } => "request",
            Self::InstanceAlreadyExists { .. }
            | Self::InstanceNotFound { .. }
            | Self::InstanceNotRunning { .. }
            | Self::InstanceClosed { .. }
            | Self::UnknownUpdate { .. } => "instance",
            Self::QueueFull { .. } => "queue",
            Self::Timeout { .. } => "timeout",
            Self::Channel { .. } => "channel",
            Self::Shutdown => "shutdown",
            Self::Transaction(_) => "transaction",
            Self::Internal { .. } => "internal",
        }
    }

    /// Convert a persistence failure into the activity-level transient error
    /// seen by orchestration code.
    pub fn into_activity_error(self, activity: &str) -> ActivityError {
        ActivityError::unavailable(activity, self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;

impl From<std::io::Error> for FlowError {
    fn from(err: std::io::Error) -> Self {
        Self::io("filesystem", err)
    }
}

impl From<sled::Error> for FlowError {
    fn from(err: sled::Error) -> Self {
        Self::database("sled", err)
    }
}

impl From<bincode::Error> for FlowError {
    fn from(err: bincode::Error) -> Self {
        Self::serialization("bincode", err)
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for FlowError {
    fn from(err: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::channel("oneshot", err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for FlowError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::channel("mpsc", err.to_string())
    }
}
