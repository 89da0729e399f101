//! Link driver for hosts whose network is managed by the operating system
//!
//! Association itself is outside the agent's control, so a connect attempt is
//! a TCP reachability probe of the broker. A successful probe reports the
//! local address the kernel picked for the route; a failed probe reports a
//! disconnect after a short settle delay.

use super::{Credentials, LinkDriver, LinkEvent};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info};

const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum HostLinkError {
    #[error("Host link driver not started")]
    NotStarted,
    #[error("Host link driver already started")]
    AlreadyStarted,
    #[error("Link notification channel closed")]
    ChannelClosed,
}

pub struct HostLinkDriver {
    host: String,
    port: u16,
    probe_timeout: Duration,
    settle_delay: Duration,
    events: Option<mpsc::Sender<LinkEvent>>,
}

impl HostLinkDriver {
    pub fn new(host: impl Into<String>, port: u16, probe_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            probe_timeout,
            settle_delay: DEFAULT_SETTLE_DELAY,
            events: None,
        }
    }

    /// Delay between a failed probe and its disconnect notification
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    async fn probe(
        host: String,
        port: u16,
        probe_timeout: Duration,
        settle_delay: Duration,
    ) -> Vec<LinkEvent> {
        let probe = TcpStream::connect((host.as_str(), port));
        let reason = match tokio::time::timeout(probe_timeout, probe).await {
            Ok(Ok(stream)) => match stream.local_addr() {
                Ok(local) => {
                    return vec![
                        LinkEvent::StationConnected,
                        LinkEvent::AddressAcquired {
                            address: local.ip(),
                        },
                    ];
                }
                Err(e) => format!("no local address: {e}"),
            },
            Ok(Err(e)) => format!("{host}:{port} unreachable: {e}"),
            Err(_) => format!("{host}:{port} probe timed out after {probe_timeout:?}"),
        };

        tokio::time::sleep(settle_delay).await;
        vec![LinkEvent::StationDisconnected { reason }]
    }
}

#[async_trait]
impl LinkDriver for HostLinkDriver {
    type Error = HostLinkError;

    async fn start(
        &mut self,
        credentials: &Credentials,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<(), Self::Error> {
        if self.events.is_some() {
            return Err(HostLinkError::AlreadyStarted);
        }

        info!(
            ssid = credentials.ssid(),
            target = %format!("{}:{}", self.host, self.port),
            "Network association is managed by the host, probing broker reachability"
        );
        events
            .send(LinkEvent::StationStarted)
            .await
            .map_err(|_| HostLinkError::ChannelClosed)?;
        self.events = Some(events);
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), Self::Error> {
        let events = self.events.clone().ok_or(HostLinkError::NotStarted)?;
        let probe = Self::probe(
            self.host.clone(),
            self.port,
            self.probe_timeout,
            self.settle_delay,
        );

        tokio::spawn(async move {
            for event in probe.await {
                if events.send(event).await.is_err() {
                    debug!("Link manager gone, dropping probe result");
                    break;
                }
            }
        });
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), Self::Error> {
        self.events = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_reachable_target_reports_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut driver = HostLinkDriver::new("127.0.0.1", port, Duration::from_secs(1));
        let (tx, mut rx) = mpsc::channel(8);
        driver
            .start(&Credentials::new("lab", ""), tx)
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(LinkEvent::StationStarted));

        driver.connect().await.unwrap();
        assert_eq!(rx.recv().await, Some(LinkEvent::StationConnected));
        match rx.recv().await {
            Some(LinkEvent::AddressAcquired { address }) => assert!(address.is_loopback()),
            other => panic!("expected address, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_target_reports_disconnect() {
        // Bind then drop to get a port nothing listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut driver = HostLinkDriver::new("127.0.0.1", port, Duration::from_millis(500))
            .with_settle_delay(Duration::from_millis(10));
        let (tx, mut rx) = mpsc::channel(8);
        driver
            .start(&Credentials::new("lab", ""), tx)
            .await
            .unwrap();
        rx.recv().await;

        driver.connect().await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(LinkEvent::StationDisconnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_before_start_fails() {
        let mut driver = HostLinkDriver::new("127.0.0.1", 1883, Duration::from_millis(10));
        assert!(matches!(
            driver.connect().await,
            Err(HostLinkError::NotStarted)
        ));
    }
}
