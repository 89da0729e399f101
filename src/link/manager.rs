//! Link reaction task and the timed startup rendezvous

use super::state::{ConnectivityState, LinkAction, LinkStateMachine};
use super::{Credentials, LinkDriver, LinkError, LinkEvent, LinkOutcome};
use crate::link_span;
use crate::observability::metrics;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Capacity of the driver notification queue
const EVENT_QUEUE_CAPACITY: usize = 32;

/// How long shutdown waits for the reaction task before aborting it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Observable link status, published on every handled notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: ConnectivityState,
    pub retries: u32,
    /// Connect attempts issued since start, including the first one
    pub connect_attempts: u32,
    pub address: Option<IpAddr>,
}

impl LinkStatus {
    fn initial() -> Self {
        Self {
            state: ConnectivityState::Idle,
            retries: 0,
            connect_attempts: 0,
            address: None,
        }
    }
}

pub struct LinkManager<D: LinkDriver> {
    driver: Option<D>,
    status_tx: watch::Sender<LinkStatus>,
    status_rx: watch::Receiver<LinkStatus>,
    shutdown_tx: Option<watch::Sender<bool>>,
    reaction_handle: Option<JoinHandle<D>>,
}

impl<D: LinkDriver> LinkManager<D> {
    pub fn new(driver: D) -> Self {
        let (status_tx, status_rx) = watch::channel(LinkStatus::initial());
        Self {
            driver: Some(driver),
            status_tx,
            status_rx,
            shutdown_tx: None,
            reaction_handle: None,
        }
    }

    /// Start the driver and block until the link reaches a terminal state
    ///
    /// Resolves exactly once with [`LinkOutcome::ConnectivityAchieved`] or
    /// [`LinkOutcome::ConnectivityFailed`]. The reaction task keeps running
    /// after the outcome so that later drops are handled.
    pub async fn connect(
        &mut self,
        credentials: &Credentials,
        max_retries: u32,
        timeout: Duration,
    ) -> Result<LinkOutcome, LinkError> {
        let mut driver = self.driver.take().ok_or(LinkError::AlreadyStarted)?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(ssid = credentials.ssid(), max_retries, "Starting network link");
        driver
            .start(credentials, event_tx)
            .await
            .map_err(|e| LinkError::DriverStart(Box::new(e)))?;

        let reactor = Reactor {
            driver,
            machine: LinkStateMachine::new(max_retries),
            status_tx: self.status_tx.clone(),
            outcome_tx: Some(outcome_tx),
            connect_attempts: 0,
        };
        let span = link_span!(ssid = credentials.ssid());
        self.reaction_handle = Some(tokio::spawn(
            reactor.run(event_rx, shutdown_rx).instrument(span),
        ));
        self.shutdown_tx = Some(shutdown_tx);

        match tokio::time::timeout(timeout, outcome_rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(LinkError::ReactionStopped),
            Err(_) => {
                error!(?timeout, "No link outcome before startup deadline");
                Err(LinkError::StartupTimedOut(timeout))
            }
        }
    }

    pub fn status(&self) -> LinkStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.status_rx.clone()
    }

    /// Stop the reaction task and the driver
    pub async fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }

        let Some(mut handle) = self.reaction_handle.take() else {
            return;
        };

        match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
            Ok(Ok(mut driver)) => {
                if let Err(e) = driver.stop().await {
                    warn!(error = %e, "Link driver failed to stop cleanly");
                }
                info!("Network link stopped");
            }
            Ok(Err(e)) if !e.is_cancelled() => {
                warn!(error = %e, "Link reaction task ended with error");
            }
            Err(_) => {
                warn!("Link reaction task didn't stop in time, aborting");
                handle.abort();
            }
            _ => {}
        }
    }
}

impl<D: LinkDriver> Drop for LinkManager<D> {
    fn drop(&mut self) {
        if let Some(handle) = self.reaction_handle.take() {
            handle.abort();
        }
    }
}

/// State owned by the reaction task
struct Reactor<D: LinkDriver> {
    driver: D,
    machine: LinkStateMachine,
    status_tx: watch::Sender<LinkStatus>,
    outcome_tx: Option<oneshot::Sender<LinkOutcome>>,
    connect_attempts: u32,
}

impl<D: LinkDriver> Reactor<D> {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<LinkEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> D {
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Shutdown signal received, stopping link reaction task");
                        break;
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        warn!("Link driver closed its notification channel");
                        break;
                    };
                    // A driver call stuck in connect must not hold off shutdown
                    tokio::select! {
                        _ = self.react(event) => {}
                        _ = shutdown_rx.changed() => {
                            debug!("Shutdown during link reaction, abandoning it");
                            break;
                        }
                    }
                }
            }
        }
        self.driver
    }

    async fn react(&mut self, event: LinkEvent) {
        debug!(?event, state = %self.machine.state(), "Link notification");
        let was_connected = self.machine.state() == ConnectivityState::Connected;
        let mut action = self.machine.handle(&event);

        if was_connected && self.machine.state() != ConnectivityState::Connected {
            metrics().link_down();
        }

        // A rejected connect call counts as a disconnect for that attempt
        let mut outcome = None;
        loop {
            match action {
                LinkAction::Connect => {
                    self.connect_attempts += 1;
                    metrics().link_connect_attempt();
                    match self.driver.connect().await {
                        Ok(()) => break,
                        Err(e) => {
                            warn!(error = %e, "Link driver rejected connect attempt");
                            action = self.machine.handle(&LinkEvent::StationDisconnected {
                                reason: e.to_string(),
                            });
                        }
                    }
                }
                LinkAction::Achieved(address) => {
                    metrics().link_up();
                    outcome = Some(LinkOutcome::ConnectivityAchieved { address });
                    break;
                }
                LinkAction::Failed { retries } => {
                    metrics().link_failed();
                    outcome = Some(LinkOutcome::ConnectivityFailed { retries });
                    break;
                }
                LinkAction::None => break,
            }
        }

        // Status first so a caller woken by the outcome sees the final state
        self.publish_status();
        if let Some(outcome) = outcome {
            self.resolve(outcome);
        }
    }

    fn resolve(&mut self, outcome: LinkOutcome) {
        if let Some(outcome_tx) = self.outcome_tx.take() {
            let _ = outcome_tx.send(outcome);
        } else {
            debug!(?outcome, "Startup outcome already delivered");
        }
    }

    fn publish_status(&self) {
        let _ = self.status_tx.send(LinkStatus {
            state: self.machine.state(),
            retries: self.machine.retries().count(),
            connect_attempts: self.connect_attempts,
            address: self.machine.address(),
        });
    }
}
