//! MQTT broker session
//!
//! Pure decision logic is kept apart from the I/O so it can be tested
//! without a broker:
//!
//! - [`connection`] - session state, reconnect policy, URL and topic validation
//! - [`message_handler`] - event routing and inbound forwarding
//! - [`health_monitor`] - state transitions and reconnection decisions
//! - [`client`] - the rumqttc client and its event-loop task
//!
//! # Usage
//!
//! ```rust,no_run
//! use telemetry_agent::config::MqttSection;
//! use telemetry_agent::transport::mqtt::{MqttSession, ReconnectConfig};
//! use telemetry_agent::transport::Transport;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let config = MqttSection {
//!     broker_url: "mqtt://192.168.1.100".to_string(),
//!     keep_alive_secs: 60,
//!     connect_timeout_secs: 10,
//!     reconnect: ReconnectConfig::default(),
//! };
//!
//! let mut session = MqttSession::new("telemetry-agent", config)?;
//! session.start().await?;
//! session.wait_until_connected(Duration::from_secs(10)).await?;
//! session.publish("Doigt0", b"42".to_vec()).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::MqttSession;
pub use connection::{
    parse_broker_url, validate_topic, BrokerAddress, MqttError, ReconnectConfig, SessionState,
    DEFAULT_MQTT_PORT,
};
pub use health_monitor::{HealthMonitor, ReconnectionDecision, SessionEvent};
pub use message_handler::{EventRoute, InboundMessage, MessageHandler};
