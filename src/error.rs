//! Top-level error type for the telemetry agent
//!
//! Component errors roll up here; `main` logs the error chain and exits
//! non-zero for any of them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Storage initialization failed: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("Network link error: {0}")]
    Link(#[from] crate::link::LinkError),

    #[error("Network '{ssid}' unreachable after {retries} retries")]
    ConnectivityFailed { ssid: String, retries: u32 },

    #[error("Broker session error: {0}")]
    Session(#[from] crate::transport::mqtt::MqttError),

    #[error("Sampling error: {0}")]
    Sampling(#[from] crate::sampling::SamplerError),

    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Failed to install signal handlers: {0}")]
    Signals(#[source] std::io::Error),
}

impl AgentError {
    /// Wrap an error from a [`Transport`](crate::transport::Transport) implementation
    pub fn transport<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport(Box::new(error))
    }

    /// Stable label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Config(_) => "config",
            AgentError::Storage(_) => "storage",
            AgentError::Link(_) => "link",
            AgentError::ConnectivityFailed { .. } => "connectivity_failed",
            AgentError::Session(_) => "session",
            AgentError::Sampling(_) => "sampling",
            AgentError::Transport(_) => "transport",
            AgentError::Signals(_) => "signals",
        }
    }
}

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;
