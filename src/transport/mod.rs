//! Broker transport abstraction and its MQTT implementation

use std::time::Duration;

pub mod mqtt;

pub use mqtt::SessionState;

/// Broker session seam
///
/// Lets the sampling loop and the agent run against a fake session in tests.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Create the client and begin connecting; fails if already started
    async fn start(&mut self) -> Result<(), Self::Error>;

    /// Disconnect and stop background work
    async fn stop(&mut self) -> Result<(), Self::Error>;

    /// Fire-and-forget publish at QoS 0, not retained
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Self::Error>;

    /// True once `start` succeeded
    fn is_started(&self) -> bool;

    fn session_state(&self) -> SessionState;

    /// Bounded wait for the broker to acknowledge the session
    async fn wait_until_connected(&self, timeout: Duration) -> Result<(), Self::Error>;
}

/// Type alias for the production transport
pub type MqttTransport = mqtt::MqttSession;
