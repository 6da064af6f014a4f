// Core infrastructure shared by the engine, workers and client

pub mod config;
pub mod connection;
pub mod errors;

// Re-export commonly used types
pub use config::{FlowConfig, FlowConfigBuilder, TASK_QUEUE_NAME, UPDATE_NAME};
pub use connection::{ConnectionOptions, TlsOptions};
pub use errors::{FlowError, Result};
