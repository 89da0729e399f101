//! Pure session state, configuration and validation for the broker client

use crate::config::MqttSection;
use rumqttc::v5::MqttOptions;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Broker session state
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// Client handle not created yet
    NotStarted,
    /// Started, waiting for the first ConnAck
    Connecting,
    /// ConnAck received, publishes are accepted
    Connected,
    Disconnected(String),
    /// Waiting to reconnect (attempt count)
    Reconnecting(u32),
    /// No further reconnects will be attempted
    PermanentlyDisconnected(String),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::NotStarted => f.write_str("not started"),
            SessionState::Connecting => f.write_str("connecting"),
            SessionState::Connected => f.write_str("connected"),
            SessionState::Disconnected(reason) => write!(f, "disconnected ({reason})"),
            SessionState::Reconnecting(attempt) => write!(f, "reconnecting (attempt {attempt})"),
            SessionState::PermanentlyDisconnected(reason) => {
                write!(f, "permanently disconnected ({reason})")
            }
        }
    }
}

/// Broker reconnection policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// When false, the first disconnect is terminal for the session
    pub enabled: bool,
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds, one entry per attempt
    #[serde(rename = "backoff_ms")]
    pub backoff_pattern: Vec<u64>,
    /// Delay used once the pattern is exhausted
    #[serde(rename = "sustained_delay_ms")]
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: Some(10),
            backoff_pattern: vec![250, 500, 1000, 2000],
            sustained_delay: 5000,
        }
    }
}

impl ReconnectConfig {
    /// Single-session behavior: never reconnect
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Backoff delay for a 1-based attempt number
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Unsupported broker URL scheme '{0}', expected mqtt:// or tcp://")]
    UnsupportedScheme(String),
    #[error("Session not started")]
    NotStarted,
    #[error("Session already started")]
    AlreadyStarted,
    #[error("Not connected - current state: {state}")]
    NotConnected { state: SessionState },
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Timed out after {0:?} waiting for broker ConnAck")]
    Timeout(Duration),
}

/// Broker endpoint extracted from the configured URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parse `mqtt://host[:port]` (or `tcp://`), defaulting the port to 1883
pub fn parse_broker_url(broker_url: &str) -> Result<BrokerAddress, MqttError> {
    let url =
        Url::parse(broker_url).map_err(|_| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;

    match url.scheme() {
        "mqtt" | "tcp" => {}
        other => return Err(MqttError::UnsupportedScheme(other.to_string())),
    }

    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;

    Ok(BrokerAddress {
        host: host.to_string(),
        port: url.port().unwrap_or(DEFAULT_MQTT_PORT),
    })
}

/// Client id unique per process so two agents never evict each other
pub fn client_id(agent_id: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{agent_id}-{}", &suffix[..8])
}

pub fn configure_mqtt_options(
    agent_id: &str,
    config: &MqttSection,
) -> Result<MqttOptions, MqttError> {
    let broker = parse_broker_url(&config.broker_url)?;

    let mut mqtt_options = MqttOptions::new(client_id(agent_id), broker.host, broker.port);
    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

    Ok(mqtt_options)
}

/// Publish topics must be concrete: non-empty, no wildcards, no NUL
pub fn validate_topic(topic: &str) -> Result<(), String> {
    if topic.is_empty() {
        return Err("topic must not be empty".to_string());
    }
    if topic.contains(['+', '#']) {
        return Err(format!("topic '{topic}' must not contain MQTT wildcards"));
    }
    if topic.contains('\0') {
        return Err("topic must not contain NUL".to_string());
    }
    Ok(())
}
