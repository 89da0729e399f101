//! Mock implementations for testing
//!
//! Provides a recording broker transport, a scripted link driver, an
//! in-memory ADC and a fallible storage backend so the agent can be
//! exercised without hardware, radios or a broker.

use crate::link::{Credentials, LinkDriver, LinkEvent};
use crate::sensor::{AdcChannel, AdcReader, AdcWidth, Attenuation, SensorError};
use crate::storage::{NonVolatileStorage, StorageError};
use crate::transport::mqtt::MqttError;
use crate::transport::{SessionState, Transport};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// One call observed by [`MockTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Start,
    Publish {
        topic: String,
        payload: Vec<u8>,
        at: Instant,
    },
    Stop,
}

/// Recording transport; clones share the same journal
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    calls: Arc<Mutex<Vec<TransportCall>>>,
    started: Arc<AtomicBool>,
    failing_topics: HashSet<String>,
    never_connects: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that already went through `start`
    pub fn started() -> Self {
        let transport = Self::default();
        transport.started.store(true, Ordering::SeqCst);
        transport
    }

    /// Publishes to `topic` fail after being recorded
    pub fn failing_topic(mut self, topic: &str) -> Self {
        self.failing_topics.insert(topic.to_string());
        self
    }

    /// `wait_until_connected` always times out
    pub fn never_connecting(mut self) -> Self {
        self.never_connects = true;
        self
    }

    pub async fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().await.clone()
    }

    /// Successful publishes as `(topic, payload)` in order
    pub async fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|call| match call {
                TransportCall::Publish { topic, payload, .. }
                    if !self.failing_topics.contains(topic) =>
                {
                    Some((topic.clone(), payload.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Publish timestamps for one topic
    pub async fn publish_times(&self, topic: &str) -> Vec<Instant> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|call| match call {
                TransportCall::Publish { topic: t, at, .. } if t == topic => Some(*at),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MqttError;

    async fn start(&mut self) -> Result<(), Self::Error> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(MqttError::AlreadyStarted);
        }
        self.calls.lock().await.push(TransportCall::Start);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), Self::Error> {
        self.started.store(false, Ordering::SeqCst);
        self.calls.lock().await.push(TransportCall::Stop);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Self::Error> {
        if !self.is_started() {
            return Err(MqttError::NotStarted);
        }

        self.calls.lock().await.push(TransportCall::Publish {
            topic: topic.to_string(),
            payload,
            at: Instant::now(),
        });

        if self.failing_topics.contains(topic) {
            return Err(MqttError::NotConnected {
                state: SessionState::Reconnecting(1),
            });
        }
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn session_state(&self) -> SessionState {
        if !self.is_started() {
            SessionState::NotStarted
        } else if self.never_connects {
            SessionState::Connecting
        } else {
            SessionState::Connected
        }
    }

    async fn wait_until_connected(&self, timeout: Duration) -> Result<(), Self::Error> {
        if !self.is_started() {
            return Err(MqttError::NotStarted);
        }
        if self.never_connects {
            tokio::time::sleep(timeout).await;
            return Err(MqttError::Timeout(timeout));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum MockLinkError {
    #[error("Driver start rejected")]
    StartRejected,
    #[error("Connect rejected")]
    ConnectRejected,
}

type SharedEventSender = Arc<std::sync::Mutex<Option<mpsc::Sender<LinkEvent>>>>;

/// Delivers unsolicited notifications, such as a drop while connected
#[derive(Clone)]
pub struct LinkEventInjector {
    events: SharedEventSender,
}

impl LinkEventInjector {
    /// Returns false if the driver is not started or the queue is full
    pub fn inject(&self, event: LinkEvent) -> bool {
        match self.events.lock() {
            Ok(guard) => guard
                .as_ref()
                .map(|events| events.try_send(event).is_ok())
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

/// Link driver that replays one scripted notification per connect attempt
pub struct ScriptedLinkDriver {
    script: VecDeque<LinkEvent>,
    events: SharedEventSender,
    announce_start: bool,
    reject_start: bool,
    reject_connect: bool,
    connect_delay: Option<Duration>,
    connect_calls: Arc<AtomicU32>,
    stopped: Arc<AtomicBool>,
}

impl ScriptedLinkDriver {
    pub fn new(script: Vec<LinkEvent>) -> Self {
        Self {
            script: script.into(),
            events: Arc::new(std::sync::Mutex::new(None)),
            announce_start: true,
            reject_start: false,
            reject_connect: false,
            connect_delay: None,
            connect_calls: Arc::new(AtomicU32::new(0)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A driver that never reports anything, not even its own start
    pub fn silent() -> Self {
        Self {
            announce_start: false,
            ..Self::new(Vec::new())
        }
    }

    /// A network that drops every attempt
    pub fn always_failing(attempts: usize) -> Self {
        Self::new(
            (0..attempts)
                .map(|_| LinkEvent::StationDisconnected {
                    reason: "no_ap_found".to_string(),
                })
                .collect(),
        )
    }

    /// Connects after `failures` dropped attempts
    pub fn succeeding_after(failures: usize) -> Self {
        let mut script: Vec<LinkEvent> = (0..failures)
            .map(|_| LinkEvent::StationDisconnected {
                reason: "auth_fail".to_string(),
            })
            .collect();
        script.push(LinkEvent::StationConnected);
        script.push(LinkEvent::AddressAcquired {
            address: IpAddr::V4(Ipv4Addr::new(192, 168, 4, 2)),
        });
        Self::new(script)
    }

    pub fn rejecting_start(mut self) -> Self {
        self.reject_start = true;
        self
    }

    pub fn rejecting_connect(mut self) -> Self {
        self.reject_connect = true;
        self
    }

    /// Every connect call stalls this long before doing anything
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    pub fn connect_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.connect_calls)
    }

    pub fn stopped_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stopped)
    }

    pub fn injector(&self) -> LinkEventInjector {
        LinkEventInjector {
            events: Arc::clone(&self.events),
        }
    }

    fn set_events(&self, events: Option<mpsc::Sender<LinkEvent>>) {
        if let Ok(mut guard) = self.events.lock() {
            *guard = events;
        }
    }

    /// Pop scripted events until one that settles the current attempt
    fn next_events(&mut self) -> Vec<LinkEvent> {
        let mut batch = Vec::new();
        while let Some(event) = self.script.pop_front() {
            let settles = !matches!(event, LinkEvent::StationConnected);
            batch.push(event);
            if settles {
                break;
            }
        }
        batch
    }
}

#[async_trait]
impl LinkDriver for ScriptedLinkDriver {
    type Error = MockLinkError;

    async fn start(
        &mut self,
        _credentials: &Credentials,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<(), Self::Error> {
        if self.reject_start {
            return Err(MockLinkError::StartRejected);
        }
        if self.announce_start {
            let _ = events.try_send(LinkEvent::StationStarted);
        }
        self.set_events(Some(events));
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), Self::Error> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if self.reject_connect {
            return Err(MockLinkError::ConnectRejected);
        }

        let injector = self.injector();
        for event in self.next_events() {
            injector.inject(event);
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), Self::Error> {
        self.stopped.store(true, Ordering::SeqCst);
        self.set_events(None);
        Ok(())
    }
}

/// Configuration calls observed by [`MockAdc`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AdcConfigLog {
    pub width: Option<AdcWidth>,
    pub channels: Vec<(AdcChannel, Attenuation)>,
}

/// In-memory converter with fixed per-channel samples
#[derive(Debug, Default)]
pub struct MockAdc {
    values: HashMap<AdcChannel, u16>,
    failing: HashSet<AdcChannel>,
    reject_configuration: bool,
    log: Arc<std::sync::Mutex<AdcConfigLog>>,
}

impl MockAdc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mid-scale samples on every channel of the default table
    pub fn reference() -> Self {
        [4, 6, 0, 7, 3]
            .into_iter()
            .fold(Self::new(), |adc, ch| adc.with_value(AdcChannel(ch), 2048))
    }

    pub fn with_value(mut self, channel: AdcChannel, raw: u16) -> Self {
        self.values.insert(channel, raw);
        self
    }

    pub fn failing(mut self, channel: AdcChannel) -> Self {
        self.failing.insert(channel);
        self
    }

    pub fn rejecting_configuration(mut self) -> Self {
        self.reject_configuration = true;
        self
    }

    pub fn configuration(&self) -> Arc<std::sync::Mutex<AdcConfigLog>> {
        Arc::clone(&self.log)
    }

    fn record<F: FnOnce(&mut AdcConfigLog)>(&self, f: F) {
        if let Ok(mut log) = self.log.lock() {
            f(&mut log);
        }
    }
}

impl AdcReader for MockAdc {
    fn configure_width(&mut self, width: AdcWidth) -> Result<(), SensorError> {
        if self.reject_configuration {
            return Err(SensorError::DeviceUnavailable("mock converter offline".to_string()));
        }
        self.record(|log| log.width = Some(width));
        Ok(())
    }

    fn configure_channel(
        &mut self,
        channel: AdcChannel,
        attenuation: Attenuation,
    ) -> Result<(), SensorError> {
        if self.reject_configuration {
            return Err(SensorError::UnknownChannel(channel));
        }
        self.record(|log| log.channels.push((channel, attenuation)));
        Ok(())
    }

    fn read_raw(&mut self, channel: AdcChannel) -> Result<u16, SensorError> {
        if self.failing.contains(&channel) {
            return Err(SensorError::ReadFailed {
                channel,
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "conversion timeout"),
            });
        }
        self.values
            .get(&channel)
            .copied()
            .ok_or(SensorError::UnknownChannel(channel))
    }
}

/// Storage backend that fails `init` with queued errors, then succeeds
#[derive(Debug, Default)]
pub struct MemoryStorage {
    failures: VecDeque<StorageError>,
    init_calls: u32,
    erase_calls: u32,
    initialized: bool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_with(failures: Vec<StorageError>) -> Self {
        Self {
            failures: failures.into(),
            ..Self::default()
        }
    }

    pub fn init_calls(&self) -> u32 {
        self.init_calls
    }

    pub fn erase_calls(&self) -> u32 {
        self.erase_calls
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

impl NonVolatileStorage for MemoryStorage {
    fn init(&mut self) -> Result<(), StorageError> {
        self.init_calls += 1;
        match self.failures.pop_front() {
            Some(e) => Err(e),
            None => {
                self.initialized = true;
                Ok(())
            }
        }
    }

    fn erase(&mut self) -> Result<(), StorageError> {
        self.erase_calls += 1;
        self.initialized = false;
        Ok(())
    }
}
