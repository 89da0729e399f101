//! Impure broker session: client handle, event-loop task and publishing

use super::connection::{configure_mqtt_options, parse_broker_url, MqttError, SessionState};
use super::health_monitor::{HealthMonitor, ReconnectionDecision, SessionEvent};
use super::message_handler::{EventRoute, InboundMessage, MessageForwarder, MessageHandler};
use super::ReconnectConfig;
use crate::config::MqttSection;
use crate::observability::metrics;
use crate::session_span;
use crate::transport::Transport;
use async_trait::async_trait;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, ConnectionError, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Request queue between the client handle and the event loop
const REQUEST_CAPACITY: usize = 64;

/// Broker session owned by the agent for the whole process lifetime
pub struct MqttSession {
    agent_id: String,
    config: MqttSection,
    client: Option<AsyncClient>,
    state_tx: watch::Sender<SessionState>,
    state_rx: watch::Receiver<SessionState>,
    shutdown_tx: Option<watch::Sender<bool>>,
    stopping: Arc<AtomicBool>,
    event_loop_handle: Option<JoinHandle<()>>,
    forwarder: Arc<Mutex<MessageForwarder>>,
}

impl MqttSession {
    /// Validate the broker URL; no connection is made until [`start`](Self::start)
    pub fn new(agent_id: &str, config: MqttSection) -> Result<Self, MqttError> {
        parse_broker_url(&config.broker_url)?;
        let (state_tx, state_rx) = watch::channel(SessionState::NotStarted);

        Ok(Self {
            agent_id: agent_id.to_string(),
            config,
            client: None,
            state_tx,
            state_rx,
            shutdown_tx: None,
            stopping: Arc::new(AtomicBool::new(false)),
            event_loop_handle: None,
            forwarder: Arc::new(Mutex::new(MessageForwarder::new())),
        })
    }

    /// Receive data the broker delivers on this session
    pub async fn set_inbound_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        self.forwarder.lock().await.set_sender(sender);
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    pub fn is_permanently_disconnected(&self) -> bool {
        HealthMonitor::is_terminal(&self.state_rx.borrow())
    }

    /// Wait for the first ConnAck, or until no ConnAck can arrive anymore
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<SessionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let wait = async {
            loop {
                let state = state_rx.borrow_and_update().clone();
                match state {
                    SessionState::Connected => return Ok(()),
                    SessionState::PermanentlyDisconnected(reason) => {
                        return Err(MqttError::ConnectionLost(reason));
                    }
                    SessionState::NotStarted => return Err(MqttError::NotStarted),
                    _ => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionLost(
                        "state channel closed".to_string(),
                    ));
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| MqttError::Timeout(timeout))?
    }

    /// Sleep that returns false if shutdown was requested meanwhile
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received during reconnection delay, stopping");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }
}

/// State moved into the event-loop task
struct EventLoopContext {
    state_tx: watch::Sender<SessionState>,
    shutdown_rx: watch::Receiver<bool>,
    stopping: Arc<AtomicBool>,
    reconnect: ReconnectConfig,
    forwarder: Arc<Mutex<MessageForwarder>>,
    reconnect_attempts: u32,
}

impl EventLoopContext {
    fn transition(&self, event: SessionEvent) {
        let current = self.state_tx.borrow().clone();
        let next = HealthMonitor::determine_next_state(&current, event);
        let _ = self.state_tx.send(next);
    }

    fn shutdown_requested(&self) -> bool {
        self.stopping.load(Ordering::Relaxed) || *self.shutdown_rx.borrow()
    }

    async fn run(mut self, mut event_loop: EventLoop) {
        info!("Broker event loop started");

        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping broker event loop");
                        break;
                    }
                }
                result = event_loop.poll() => {
                    let keep_going = match result {
                        Ok(event) => {
                            self.handle_route(MessageHandler::route_mqtt_event(&event))
                                .await
                        }
                        Err(e) => self.handle_error(e).await,
                    };
                    if !keep_going {
                        break;
                    }
                }
            }
        }

        if self.state_tx.borrow().clone() == SessionState::Connected {
            metrics().session_disconnected();
            let _ = self
                .state_tx
                .send(SessionState::Disconnected("client stopped".to_string()));
        }
        info!("Broker event loop stopped");
    }

    /// Returns false when the event loop must stop
    async fn handle_route(&mut self, route: EventRoute) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                self.transition(SessionEvent::ConnAckReceived);
                self.reconnect_attempts = 0;
                metrics().session_connected();
                true
            }
            EventRoute::MessageReceived { topic, payload } => {
                debug!(%topic, bytes = payload.len(), "Data received from broker");
                metrics().message_received();
                self.forwarder
                    .lock()
                    .await
                    .forward(InboundMessage::new(topic, payload));
                true
            }
            EventRoute::Disconnected => {
                let was_connected = self.state_tx.borrow().clone() == SessionState::Connected;
                self.transition(SessionEvent::DisconnectedByBroker);
                if was_connected {
                    metrics().session_disconnected();
                }
                self.reconnect_or_stop("broker disconnected").await
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "Broker event: {}", event);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    async fn handle_error(&mut self, error: ConnectionError) -> bool {
        if self.shutdown_requested() {
            debug!(error = %error, "Broker connection closed during shutdown");
            return false;
        }

        let reason = MessageHandler::describe_connection_error(&error);
        let was_connected = self.state_tx.borrow().clone() == SessionState::Connected;
        metrics().session_error();
        if was_connected {
            metrics().session_disconnected();
        }
        if let Some(errno) = MessageHandler::errno(&error) {
            error!(errno, "Broker transport error");
        }
        self.transition(SessionEvent::NetworkError(reason.clone()));

        self.reconnect_or_stop(&reason).await
    }

    async fn reconnect_or_stop(&mut self, reason: &str) -> bool {
        let decision = HealthMonitor::should_attempt_reconnection(
            self.reconnect_attempts,
            &self.reconnect,
            self.shutdown_requested(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                self.reconnect_attempts = attempt;
                self.transition(SessionEvent::ReconnectionStarted(attempt));

                let max_display = self
                    .reconnect
                    .max_attempts
                    .map_or("unlimited".to_string(), |max| max.to_string());
                info!(
                    "Attempting broker reconnection {}/{} after {}ms delay",
                    attempt, max_display, delay_ms
                );

                // The next poll reconnects
                MqttSession::interruptible_sleep(self.shutdown_rx.clone(), delay_ms).await
                    && !self.shutdown_requested()
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown requested, not reconnecting");
                false
            }
            ReconnectionDecision::AbortDisabled => {
                self.transition(SessionEvent::PermanentFailure(format!(
                    "reconnection disabled, last error: {reason}"
                )));
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded { max_attempts } => {
                self.transition(SessionEvent::PermanentFailure(format!(
                    "max reconnection attempts ({max_attempts}) exceeded, last error: {reason}"
                )));
                false
            }
        }
    }
}

#[async_trait]
impl Transport for MqttSession {
    type Error = MqttError;

    async fn start(&mut self) -> Result<(), Self::Error> {
        if self.client.is_some() {
            return Err(MqttError::AlreadyStarted);
        }

        let options = configure_mqtt_options(&self.agent_id, &self.config)?;
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let _ = self.state_tx.send(SessionState::Connecting);
        self.stopping.store(false, Ordering::Relaxed);

        let context = EventLoopContext {
            state_tx: self.state_tx.clone(),
            shutdown_rx,
            stopping: self.stopping.clone(),
            reconnect: self.config.reconnect.clone(),
            forwarder: self.forwarder.clone(),
            reconnect_attempts: 0,
        };
        let span = session_span!(agent_id = %self.agent_id, broker = %self.config.broker_url);
        self.event_loop_handle = Some(tokio::spawn(context.run(event_loop).instrument(span)));
        self.shutdown_tx = Some(shutdown_tx);
        self.client = Some(client);

        info!(broker = %self.config.broker_url, "Broker session started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), Self::Error> {
        let Some(client) = self.client.take() else {
            return Ok(());
        };
        self.stopping.store(true, Ordering::Relaxed);

        if HealthMonitor::can_publish(&self.state_rx.borrow()) {
            if let Err(e) = client.try_disconnect() {
                warn!(error = %e, "Failed to queue broker disconnect");
            }
        }

        if let Some(mut handle) = self.event_loop_handle.take() {
            // Let the disconnect flush before forcing the loop down
            if tokio::time::timeout(Duration::from_millis(500), &mut handle)
                .await
                .is_err()
            {
                if let Some(shutdown_tx) = &self.shutdown_tx {
                    let _ = shutdown_tx.send(true);
                }
                match tokio::time::timeout(Duration::from_secs(2), &mut handle).await {
                    Ok(Ok(())) => debug!("Broker event loop shut down gracefully"),
                    Ok(Err(e)) if !e.is_cancelled() => {
                        warn!("Broker event loop ended with error: {}", e);
                    }
                    Err(_) => {
                        warn!("Broker event loop didn't shut down gracefully, aborting");
                        handle.abort();
                    }
                    _ => {}
                }
            }
        }
        self.shutdown_tx = None;

        if !HealthMonitor::is_terminal(&self.state_rx.borrow()) {
            let _ = self
                .state_tx
                .send(SessionState::Disconnected("client stopped".to_string()));
        }
        info!("Broker session stopped");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Self::Error> {
        let client = self.client.as_ref().ok_or(MqttError::NotStarted)?;

        let state = self.state_rx.borrow().clone();
        if !HealthMonitor::can_publish(&state) {
            return Err(MqttError::NotConnected { state });
        }

        // QoS 0, not retained, never waits on the request queue
        client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))
    }

    fn is_started(&self) -> bool {
        self.client.is_some()
    }

    fn session_state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }

    async fn wait_until_connected(&self, timeout: Duration) -> Result<(), Self::Error> {
        if self.client.is_none() {
            return Err(MqttError::NotStarted);
        }
        Self::wait_for_connection_confirmation(self.state_rx.clone(), timeout).await
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(broker_url: &str) -> MqttSection {
        MqttSection {
            broker_url: broker_url.to_string(),
            keep_alive_secs: 30,
            connect_timeout_secs: 1,
            reconnect: ReconnectConfig::disabled(),
        }
    }

    #[test]
    fn test_new_rejects_bad_urls() {
        assert!(matches!(
            MqttSession::new("bench", test_config("nonsense")),
            Err(MqttError::InvalidBrokerUrl(_))
        ));
        assert!(matches!(
            MqttSession::new("bench", test_config("mqtts://broker")),
            Err(MqttError::UnsupportedScheme(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_success() {
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);

        let waiter = tokio::spawn(MqttSession::wait_for_connection_confirmation(
            state_rx,
            Duration::from_secs(1),
        ));
        state_tx.send(SessionState::Connected).unwrap();

        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_already_connected() {
        let (_state_tx, state_rx) = watch::channel(SessionState::Connected);
        let result =
            MqttSession::wait_for_connection_confirmation(state_rx, Duration::from_millis(10))
                .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_timeout() {
        let (_state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let result =
            MqttSession::wait_for_connection_confirmation(state_rx, Duration::from_millis(20))
                .await;
        assert!(matches!(result, Err(MqttError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_survives_reconnects() {
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let waiter = tokio::spawn(MqttSession::wait_for_connection_confirmation(
            state_rx,
            Duration::from_secs(1),
        ));

        state_tx
            .send(SessionState::Disconnected("refused".to_string()))
            .unwrap();
        state_tx.send(SessionState::Reconnecting(1)).unwrap();
        state_tx.send(SessionState::Connected).unwrap();

        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_permanent_failure() {
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let waiter = tokio::spawn(MqttSession::wait_for_connection_confirmation(
            state_rx,
            Duration::from_secs(1),
        ));
        state_tx
            .send(SessionState::PermanentlyDisconnected("gave up".to_string()))
            .unwrap();

        assert!(matches!(
            waiter.await.unwrap(),
            Err(MqttError::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn test_interruptible_sleep_completes() {
        let (_tx, rx) = watch::channel(false);
        assert!(MqttSession::interruptible_sleep(rx, 5).await);
    }

    #[tokio::test]
    async fn test_interruptible_sleep_interrupted() {
        let (tx, rx) = watch::channel(false);
        let sleeper = tokio::spawn(MqttSession::interruptible_sleep(rx, 10_000));
        tx.send(true).unwrap();
        assert!(!sleeper.await.unwrap());
    }

    #[tokio::test]
    async fn test_publish_before_start_is_rejected() {
        let session = MqttSession::new("bench", test_config("mqtt://localhost")).unwrap();
        assert!(!session.is_started());
        assert_eq!(session.session_state(), SessionState::NotStarted);
        assert!(matches!(
            session.publish("Doigt0", b"1".to_vec()).await,
            Err(MqttError::NotStarted)
        ));
        assert!(matches!(
            session.wait_until_connected(Duration::from_millis(10)).await,
            Err(MqttError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let mut session = MqttSession::new("bench", test_config("mqtt://localhost")).unwrap();
        assert!(session.stop().await.is_ok());
        assert_eq!(session.session_state(), SessionState::NotStarted);
    }
}
