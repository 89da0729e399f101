//! Pure link state machine
//!
//! No I/O happens here: [`LinkStateMachine::handle`] maps a notification to a
//! state transition and the [`LinkAction`] the reaction task must perform.

use super::LinkEvent;
use std::fmt;
use std::net::IpAddr;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Connected,
    Failed,
}

impl ConnectivityState {
    /// Terminal for the startup rendezvous
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectivityState::Connected | ConnectivityState::Failed)
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectivityState::Idle => "idle",
            ConnectivityState::Connecting => "connecting",
            ConnectivityState::Connected => "connected",
            ConnectivityState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Bounded retry counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryCounter {
    count: u32,
    max: u32,
}

impl RetryCounter {
    pub fn new(max: u32) -> Self {
        Self { count: 0, max }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn can_retry(&self) -> bool {
        self.count < self.max
    }

    /// Record one retry and return the new count
    pub fn increment(&mut self) -> u32 {
        self.count = self.count.saturating_add(1);
        self.count
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

/// Work the reaction task performs after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    /// Issue exactly one connect attempt
    Connect,
    Achieved(IpAddr),
    Failed { retries: u32 },
    None,
}

#[derive(Debug, Clone)]
pub struct LinkStateMachine {
    state: ConnectivityState,
    retries: RetryCounter,
    address: Option<IpAddr>,
}

impl LinkStateMachine {
    pub fn new(max_retries: u32) -> Self {
        Self {
            state: ConnectivityState::Idle,
            retries: RetryCounter::new(max_retries),
            address: None,
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn retries(&self) -> RetryCounter {
        self.retries
    }

    pub fn address(&self) -> Option<IpAddr> {
        self.address
    }

    pub fn handle(&mut self, event: &LinkEvent) -> LinkAction {
        match (self.state, event) {
            (ConnectivityState::Idle, LinkEvent::StationStarted) => {
                info!("Station started, issuing first connect attempt");
                self.state = ConnectivityState::Connecting;
                LinkAction::Connect
            }
            (state, LinkEvent::StationStarted) => {
                debug!(%state, "Ignoring station-started notification");
                LinkAction::None
            }
            (state, LinkEvent::StationConnected) => {
                info!(%state, "Associated with access point, waiting for address");
                LinkAction::None
            }
            (ConnectivityState::Connecting, LinkEvent::StationDisconnected { reason }) => {
                self.retry_or_fail(reason)
            }
            (ConnectivityState::Connected, LinkEvent::StationDisconnected { reason }) => {
                warn!(%reason, "Link dropped while connected, reconnecting");
                self.state = ConnectivityState::Connecting;
                self.address = None;
                self.retries.reset();
                self.retry_or_fail(reason)
            }
            (state, LinkEvent::StationDisconnected { reason }) => {
                debug!(%state, %reason, "Ignoring disconnect notification");
                LinkAction::None
            }
            (ConnectivityState::Failed, LinkEvent::AddressAcquired { address }) => {
                warn!(%address, "Address acquired after retries were exhausted, ignoring");
                LinkAction::None
            }
            (_, LinkEvent::AddressAcquired { address }) => {
                self.retries.reset();
                self.state = ConnectivityState::Connected;
                self.address = Some(*address);
                info!(%address, "Address acquired");
                LinkAction::Achieved(*address)
            }
        }
    }

    fn retry_or_fail(&mut self, reason: &str) -> LinkAction {
        if self.retries.can_retry() {
            let attempt = self.retries.increment();
            info!(
                attempt,
                max = self.retries.max(),
                %reason,
                "Link disconnected, retrying"
            );
            LinkAction::Connect
        } else {
            self.state = ConnectivityState::Failed;
            error!(
                retries = self.retries.count(),
                %reason,
                "Link connect failed, retries exhausted"
            );
            LinkAction::Failed {
                retries: self.retries.count(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn disconnect() -> LinkEvent {
        LinkEvent::StationDisconnected {
            reason: "beacon timeout".to_string(),
        }
    }

    fn address() -> LinkEvent {
        LinkEvent::AddressAcquired {
            address: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 42)),
        }
    }

    fn started(max_retries: u32) -> LinkStateMachine {
        let mut machine = LinkStateMachine::new(max_retries);
        assert_eq!(machine.handle(&LinkEvent::StationStarted), LinkAction::Connect);
        machine
    }

    #[test]
    fn test_start_moves_idle_to_connecting() {
        let machine = started(3);
        assert_eq!(machine.state(), ConnectivityState::Connecting);
        assert_eq!(machine.retries().count(), 0);
    }

    #[test]
    fn test_each_disconnect_with_retries_left_issues_one_attempt() {
        let mut machine = started(3);

        for expected in 1..=3 {
            assert_eq!(machine.handle(&disconnect()), LinkAction::Connect);
            assert_eq!(machine.retries().count(), expected);
            assert_eq!(machine.state(), ConnectivityState::Connecting);
        }
    }

    #[test]
    fn test_exhausted_retries_fail_and_stay_failed() {
        let mut machine = started(3);
        for _ in 0..3 {
            machine.handle(&disconnect());
        }

        assert_eq!(
            machine.handle(&disconnect()),
            LinkAction::Failed { retries: 3 }
        );
        assert_eq!(machine.state(), ConnectivityState::Failed);

        // Late notifications are tolerated without further attempts
        assert_eq!(machine.handle(&disconnect()), LinkAction::None);
        assert_eq!(machine.handle(&LinkEvent::StationStarted), LinkAction::None);
        assert_eq!(machine.handle(&address()), LinkAction::None);
        assert_eq!(machine.state(), ConnectivityState::Failed);
        assert_eq!(machine.retries().count(), 3);
    }

    #[test]
    fn test_zero_retries_fails_on_first_disconnect() {
        let mut machine = started(0);
        assert_eq!(
            machine.handle(&disconnect()),
            LinkAction::Failed { retries: 0 }
        );
    }

    #[test]
    fn test_address_resets_retry_counter() {
        let mut machine = started(3);
        machine.handle(&disconnect());
        machine.handle(&disconnect());
        assert_eq!(machine.retries().count(), 2);

        let action = machine.handle(&address());
        assert!(matches!(action, LinkAction::Achieved(_)));
        assert_eq!(machine.retries().count(), 0);
        assert_eq!(machine.state(), ConnectivityState::Connected);
        assert!(machine.address().is_some());
    }

    #[test]
    fn test_drop_while_connected_reenters_connecting() {
        let mut machine = started(3);
        machine.handle(&address());

        assert_eq!(machine.handle(&disconnect()), LinkAction::Connect);
        assert_eq!(machine.state(), ConnectivityState::Connecting);
        assert_eq!(machine.retries().count(), 1);
        assert_eq!(machine.address(), None);
    }

    #[test]
    fn test_station_connected_is_log_only() {
        let mut machine = started(3);
        assert_eq!(machine.handle(&LinkEvent::StationConnected), LinkAction::None);
        assert_eq!(machine.state(), ConnectivityState::Connecting);
    }

    #[test]
    fn test_disconnect_before_start_is_ignored() {
        let mut machine = LinkStateMachine::new(3);
        assert_eq!(machine.handle(&disconnect()), LinkAction::None);
        assert_eq!(machine.state(), ConnectivityState::Idle);
    }

    #[test]
    fn test_terminal_states() {
        assert!(ConnectivityState::Connected.is_terminal());
        assert!(ConnectivityState::Failed.is_terminal());
        assert!(!ConnectivityState::Idle.is_terminal());
        assert!(!ConnectivityState::Connecting.is_terminal());
    }
}
