//! Agent startup ordering and teardown
//!
//! The order is fixed: ADC configuration, network link, broker session,
//! sampling. The session is never started when the link fails, and the
//! sampling loop never runs before the session has been started.

use crate::config::AgentConfig;
use crate::error::{AgentError, AgentResult};
use crate::link::{LinkDriver, LinkManager, LinkOutcome, LinkStatus};
use crate::observability::metrics;
use crate::sampling::Sampler;
use crate::sensor::AdcReader;
use crate::transport::Transport;
use crate::{lifecycle_span, sampling_span};
use std::fmt;
use tokio::sync::watch;
use tracing::{error, info, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    Initializing,
    Linking,
    StartingSession,
    Sampling,
    ShuttingDown,
    Stopped,
    Failed,
}

impl AgentPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentPhase::Initializing => "initializing",
            AgentPhase::Linking => "linking",
            AgentPhase::StartingSession => "starting_session",
            AgentPhase::Sampling => "sampling",
            AgentPhase::ShuttingDown => "shutting_down",
            AgentPhase::Stopped => "stopped",
            AgentPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for AgentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolves once the shutdown flag is set or its sender is gone
async fn shutdown_signalled(shutdown_rx: &mut watch::Receiver<bool>) {
    while !*shutdown_rx.borrow_and_update() {
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

pub struct TelemetryAgent<D, T, A>
where
    D: LinkDriver,
    T: Transport,
    A: AdcReader,
{
    config: AgentConfig,
    link: LinkManager<D>,
    transport: T,
    sampler: Sampler<A>,
    phase: AgentPhase,
}

impl<D, T, A> TelemetryAgent<D, T, A>
where
    D: LinkDriver,
    T: Transport,
    A: AdcReader,
{
    pub fn new(config: AgentConfig, driver: D, transport: T, adc: A) -> Self {
        let sampler = Sampler::from_config(adc, &config);
        Self {
            link: LinkManager::new(driver),
            sampler,
            transport,
            config,
            phase: AgentPhase::Initializing,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent.id
    }

    pub fn phase(&self) -> AgentPhase {
        self.phase
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn link_status(&self) -> LinkStatus {
        self.link.status()
    }

    fn set_phase(&mut self, phase: AgentPhase) {
        info!(from = %self.phase, to = %phase, "Agent phase change");
        self.phase = phase;
        metrics().set_agent_state(phase.as_str());
    }

    /// Run until shutdown is signalled, then tear everything down
    ///
    /// Returns the number of completed sampling iterations.
    pub async fn run(&mut self, shutdown_rx: watch::Receiver<bool>) -> AgentResult<u64> {
        let result = self.start_and_sample(shutdown_rx).await;
        let failed = result.is_err();
        if let Err(e) = &result {
            error!(
                agent_id = %self.config.agent.id,
                kind = e.kind(),
                error = %e,
                "Agent stopped on error"
            );
        }

        self.shutdown().await;
        if failed {
            self.set_phase(AgentPhase::Failed);
        }
        result
    }

    async fn start_and_sample(
        &mut self,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> AgentResult<u64> {
        // Fail on a missing converter before touching the network
        self.sampler.configure()?;

        self.set_phase(AgentPhase::Linking);
        let credentials = self.config.link.credentials();
        let connect = self.link.connect(
            &credentials,
            self.config.link.max_retries,
            self.config.link.startup_timeout(),
        );

        let outcome = tokio::select! {
            outcome = connect.instrument(lifecycle_span!(phase = "link")) => outcome?,
            _ = shutdown_signalled(&mut shutdown_rx) => {
                info!("Shutdown requested while bringing up the link");
                return Ok(0);
            }
        };

        match outcome {
            LinkOutcome::ConnectivityAchieved { address } => {
                info!(%address, ssid = credentials.ssid(), "Connectivity achieved");
            }
            LinkOutcome::ConnectivityFailed { retries } => {
                return Err(AgentError::ConnectivityFailed {
                    ssid: credentials.ssid().to_string(),
                    retries,
                });
            }
        }

        self.set_phase(AgentPhase::StartingSession);
        self.transport
            .start()
            .instrument(lifecycle_span!(phase = "session"))
            .await
            .map_err(AgentError::transport)?;

        let connect_timeout = self.config.mqtt.connect_timeout();
        if let Err(e) = self.transport.wait_until_connected(connect_timeout).await {
            warn!(
                error = %e,
                state = %self.transport.session_state(),
                "Broker not connected yet, sampling anyway"
            );
        }

        self.set_phase(AgentPhase::Sampling);
        let span = sampling_span!(
            agent_id = %self.config.agent.id,
            channels = self.sampler.channels().len()
        );
        let iterations = self
            .sampler
            .run(&self.transport, shutdown_rx)
            .instrument(span)
            .await?;

        Ok(iterations)
    }

    async fn shutdown(&mut self) {
        self.set_phase(AgentPhase::ShuttingDown);

        if self.transport.is_started() {
            if let Err(e) = self.transport.stop().await {
                warn!(error = %e, "Broker session did not stop cleanly");
            }
        }
        self.link.shutdown().await;

        self.set_phase(AgentPhase::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{MockAdc, MockTransport, ScriptedLinkDriver};
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_phase_labels() {
        assert_eq!(AgentPhase::StartingSession.to_string(), "starting_session");
        assert_eq!(AgentPhase::Failed.as_str(), "failed");
    }

    #[tokio::test]
    async fn test_shutdown_before_link_returns_cleanly() {
        // Driver never reports anything, so only the shutdown can end the wait
        let driver = ScriptedLinkDriver::silent();
        let transport = MockTransport::new();
        let mut agent = TelemetryAgent::new(
            AgentConfig::reference(),
            driver,
            transport.clone(),
            MockAdc::reference(),
        );

        let (tx, rx) = watch::channel(true);
        let iterations = agent.run(rx).await.unwrap();
        drop(tx);

        assert_eq!(iterations, 0);
        assert_eq!(agent.phase(), AgentPhase::Stopped);
        assert!(transport.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_adc_channel_fails_before_linking() {
        let driver = ScriptedLinkDriver::new(vec![crate::link::LinkEvent::AddressAcquired {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }]);
        let connects = driver.connect_counter();
        let transport = MockTransport::new();
        let mut agent = TelemetryAgent::new(
            AgentConfig::reference(),
            driver,
            transport.clone(),
            MockAdc::new().rejecting_configuration(),
        );

        let (_tx, rx) = watch::channel(false);
        let result = agent.run(rx).await;

        assert!(matches!(result, Err(AgentError::Sampling(_))));
        assert_eq!(agent.phase(), AgentPhase::Failed);
        assert_eq!(connects.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert!(transport.calls().await.is_empty());
    }
}
