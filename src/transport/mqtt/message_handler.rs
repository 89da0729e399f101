//! Pure routing of broker events and forwarding of inbound data

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::{ConnectionError, Event};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

pub struct MessageHandler;

impl MessageHandler {
    /// Route a broker event to the reaction it needs
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                },
                Packet::Disconnect(_) => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Render a transport error, with the OS errno when there is one
    pub fn describe_connection_error(error: &ConnectionError) -> String {
        match error {
            ConnectionError::Io(io) => match io.raw_os_error() {
                Some(errno) => format!("transport I/O error (errno {errno}): {io}"),
                None => format!("transport I/O error: {io}"),
            },
            other => other.to_string(),
        }
    }

    /// OS errno carried by a transport error, if any
    pub fn errno(error: &ConnectionError) -> Option<i32> {
        match error {
            ConnectionError::Io(io) => io.raw_os_error(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum EventRoute {
    ConnectionAcknowledged,
    MessageReceived { topic: String, payload: Bytes },
    Disconnected,
    /// PingResp, PubAck and the like
    InfrastructureEvent(String),
    OutgoingEvent,
}

/// Data received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: Bytes) -> Self {
        Self {
            topic: topic.into(),
            payload,
            received_at: Utc::now(),
        }
    }
}

/// Hands inbound messages to an optional subscriber without blocking the event loop
#[derive(Default)]
pub struct MessageForwarder {
    sender: Option<mpsc::Sender<InboundMessage>>,
}

impl MessageForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sender(&mut self, sender: mpsc::Sender<InboundMessage>) {
        self.sender = Some(sender);
    }

    /// Returns true if a subscriber accepted the message
    pub fn forward(&self, message: InboundMessage) -> bool {
        let Some(sender) = &self.sender else {
            debug!(
                topic = %message.topic,
                bytes = message.payload.len(),
                "Inbound message, no subscriber"
            );
            return false;
        };

        match sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                warn!(topic = %message.topic, "Inbound subscriber is full, dropping message");
                false
            }
            Err(TrySendError::Closed(message)) => {
                debug!(topic = %message.topic, "Inbound subscriber gone, dropping message");
                false
            }
        }
    }
}
