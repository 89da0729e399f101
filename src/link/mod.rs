//! Network link bring-up with bounded retries
//!
//! The link driver pushes [`LinkEvent`]s onto a channel; the
//! [`LinkManager`] consumes them on its own task, drives the
//! [`LinkStateMachine`], and resolves the startup rendezvous with a single
//! [`LinkOutcome`].
//!
//! - [`state`] - pure state machine and retry bookkeeping
//! - [`manager`] - reaction task, status watch and the timed startup wait
//! - [`host`] - driver for hosts whose network is managed by the OS

use async_trait::async_trait;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod host;
pub mod manager;
pub mod state;

pub use host::HostLinkDriver;
pub use manager::{LinkManager, LinkStatus};
pub use state::{ConnectivityState, LinkAction, LinkStateMachine, RetryCounter};

/// Network join credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    ssid: String,
    passphrase: String,
}

impl Credentials {
    pub fn new(ssid: impl Into<String>, passphrase: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            passphrase: passphrase.into(),
        }
    }

    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    pub fn passphrase(&self) -> &str {
        &self.passphrase
    }
}

// Never print the passphrase
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("passphrase", &"***")
            .finish()
    }
}

/// Notifications delivered by the link driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Station interface is up; the first connect attempt may be issued
    StationStarted,
    /// Associated with the access point, no address yet
    StationConnected,
    StationDisconnected { reason: String },
    AddressAcquired { address: IpAddr },
}

/// Terminal result of a startup connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    ConnectivityAchieved { address: IpAddr },
    ConnectivityFailed { retries: u32 },
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Link manager already started")]
    AlreadyStarted,
    #[error("Link driver failed to start")]
    DriverStart(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Startup timed out after {0:?} waiting for connectivity")]
    StartupTimedOut(Duration),
    #[error("Link reaction task stopped before reaching a terminal state")]
    ReactionStopped,
}

/// Radio/link driver seam
///
/// `connect` only issues an attempt; its result arrives later as a
/// `StationDisconnected` or `AddressAcquired` notification on the channel
/// handed to `start`.
#[async_trait]
pub trait LinkDriver: Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn start(
        &mut self,
        credentials: &Credentials,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<(), Self::Error>;

    async fn connect(&mut self) -> Result<(), Self::Error>;

    async fn stop(&mut self) -> Result<(), Self::Error>;
}
