//! Pure session transition and reconnection decision logic

use super::connection::{ReconnectConfig, SessionState};
use tracing::{error, info, warn};

pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether to reconnect after the session dropped
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }
        if !config.enabled {
            return ReconnectionDecision::AbortDisabled;
        }
        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded { max_attempts };
            }
        }

        let attempt = current_attempts + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.calculate_backoff_delay(attempt),
        }
    }

    /// Next session state after an event, logging the transition
    pub fn determine_next_state(current: &SessionState, event: SessionEvent) -> SessionState {
        match event {
            SessionEvent::ConnAckReceived => {
                if matches!(current, SessionState::Reconnecting(_)) {
                    info!("Broker session re-established");
                } else {
                    info!("Broker session connected");
                }
                SessionState::Connected
            }
            SessionEvent::DisconnectedByBroker => {
                warn!(previous = %current, "Broker closed the session");
                SessionState::Disconnected("broker disconnected".to_string())
            }
            SessionEvent::NetworkError(reason) => {
                error!(previous = %current, %reason, "Broker session error");
                SessionState::Disconnected(reason)
            }
            SessionEvent::ReconnectionStarted(attempt) => {
                info!(attempt, "Starting broker reconnection attempt");
                SessionState::Reconnecting(attempt)
            }
            SessionEvent::PermanentFailure(reason) => {
                error!(%reason, "Broker session permanently disconnected");
                SessionState::PermanentlyDisconnected(reason)
            }
        }
    }

    pub fn can_publish(state: &SessionState) -> bool {
        matches!(state, SessionState::Connected)
    }

    /// State from which no further ConnAck will arrive
    pub fn is_terminal(state: &SessionState) -> bool {
        matches!(state, SessionState::PermanentlyDisconnected(_))
    }

    pub fn validate_connection_config(config: &ReconnectConfig) -> Result<(), String> {
        if !config.enabled {
            return Ok(());
        }
        if config.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0 or omitted for unlimited".to_string());
        }
        if config.sustained_delay == 0 {
            return Err("sustained_delay_ms must be greater than 0".to_string());
        }
        if config.backoff_pattern.iter().any(|&delay| delay == 0) {
            return Err("backoff_ms entries must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    /// Reconnection turned off; the drop is terminal
    AbortDisabled,
    AbortMaxAttemptsExceeded { max_attempts: u32 },
}

/// Events that drive [`SessionState`] transitions
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ConnAckReceived,
    DisconnectedByBroker,
    NetworkError(String),
    ReconnectionStarted(u32),
    PermanentFailure(String),
}
