//! Sampling and publish loop
//!
//! Each iteration reads every configured channel in table order, calibrates
//! the raw sample and publishes the decimal value on the channel's topic.
//! A channel whose read fails is skipped for that iteration only; a publish
//! failure is logged and the loop moves on. Between bursts the loop sleeps
//! for the configured interval, watching the shutdown signal.

use crate::config::{AgentConfig, ChannelConfig};
use crate::observability::metrics;
use crate::sensor::{AdcChannel, AdcReader, AdcWidth, Attenuation, Calibration, SensorError};
use crate::transport::Transport;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("Broker session has not been started")]
    SessionNotStarted,
    #[error("ADC configuration failed")]
    Configure(#[from] SensorError),
    #[error("No sensor channels configured")]
    NoChannels,
}

/// One analog input and where its readings go
#[derive(Debug, Clone, PartialEq)]
pub struct SensorChannel {
    pub label: String,
    pub adc_channel: AdcChannel,
    pub topic: String,
    pub calibration: Calibration,
    pub attenuation: Attenuation,
}

impl SensorChannel {
    pub fn from_config(config: &ChannelConfig, default_attenuation: Attenuation) -> Self {
        Self {
            label: config.label.clone(),
            adc_channel: config.adc_channel,
            topic: config.topic.clone(),
            calibration: config.calibration,
            attenuation: config.attenuation.unwrap_or(default_attenuation),
        }
    }
}

/// All channels of a configuration, in publish order
pub fn channels_from_config(config: &AgentConfig) -> Vec<SensorChannel> {
    config
        .channels
        .iter()
        .map(|channel| SensorChannel::from_config(channel, config.adc.attenuation))
        .collect()
}

/// A calibrated sample on its way to the broker
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleReading<'a> {
    pub channel: &'a SensorChannel,
    pub raw: u16,
    pub value: i32,
}

impl<'a> SampleReading<'a> {
    pub fn new(channel: &'a SensorChannel, raw: u16) -> Self {
        Self {
            channel,
            raw,
            value: channel.calibration.apply(raw),
        }
    }

    /// Wire payload: signed decimal ASCII, no terminator
    pub fn payload(&self) -> String {
        self.value.to_string()
    }
}

/// What one pass over the channel table did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IterationReport {
    /// Calibrated values of the channels that were read, by topic
    pub values: Vec<(String, i32)>,
    pub read_failures: usize,
    pub published: usize,
    pub publish_failures: usize,
}

impl IterationReport {
    /// Publish calls attempted this iteration
    pub fn publish_attempts(&self) -> usize {
        self.published + self.publish_failures
    }
}

pub struct Sampler<A: AdcReader> {
    adc: A,
    channels: Vec<SensorChannel>,
    width: AdcWidth,
    interval: Duration,
    stats_every: u64,
    configured: bool,
    iterations: u64,
    /// Per-channel flag so a dead sensor warns once, not every iteration
    read_failing: Vec<bool>,
    publish_failure_streak: u64,
}

impl<A: AdcReader> Sampler<A> {
    pub fn new(adc: A, channels: Vec<SensorChannel>, width: AdcWidth, interval: Duration) -> Self {
        let read_failing = vec![false; channels.len()];
        Self {
            adc,
            channels,
            width,
            interval,
            stats_every: 0,
            configured: false,
            iterations: 0,
            read_failing,
            publish_failure_streak: 0,
        }
    }

    pub fn from_config(adc: A, config: &AgentConfig) -> Self {
        Self::new(
            adc,
            channels_from_config(config),
            config.adc.width,
            config.sampling.interval(),
        )
        .with_stats_every(config.sampling.stats_every)
    }

    /// Log a stats line every `n` iterations (0 disables)
    pub fn with_stats_every(mut self, n: u64) -> Self {
        self.stats_every = n;
        self
    }

    pub fn channels(&self) -> &[SensorChannel] {
        &self.channels
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Configure converter width and per-channel attenuation
    pub fn configure(&mut self) -> Result<(), SamplerError> {
        if self.channels.is_empty() {
            return Err(SamplerError::NoChannels);
        }

        self.adc.configure_width(self.width)?;
        for channel in &self.channels {
            self.adc
                .configure_channel(channel.adc_channel, channel.attenuation)?;
        }

        self.configured = true;
        info!(
            channels = self.channels.len(),
            bits = self.width.bits(),
            "ADC configured"
        );
        Ok(())
    }

    fn read_checked(adc: &mut A, width: AdcWidth, channel: AdcChannel) -> Result<u16, SensorError> {
        let raw = adc.read_raw(channel)?;
        let max = width.max_raw();
        if raw > max {
            return Err(SensorError::OutOfRange { channel, raw, max });
        }
        Ok(raw)
    }

    /// Read, calibrate and publish every channel once
    pub async fn sample_once<T: Transport>(&mut self, transport: &T) -> IterationReport {
        let mut report = IterationReport::default();

        for (index, channel) in self.channels.iter().enumerate() {
            let raw = match Self::read_checked(&mut self.adc, self.width, channel.adc_channel) {
                Ok(raw) => {
                    metrics().sample_read();
                    if std::mem::replace(&mut self.read_failing[index], false) {
                        info!(channel = %channel.label, "Sensor read recovered");
                    }
                    raw
                }
                Err(e) => {
                    metrics().sample_read_failed();
                    report.read_failures += 1;
                    if std::mem::replace(&mut self.read_failing[index], true) {
                        debug!(channel = %channel.label, error = %e, "Sensor read still failing");
                    } else {
                        warn!(
                            channel = %channel.label,
                            error = %e,
                            "Sensor read failed, skipping channel"
                        );
                    }
                    continue;
                }
            };

            let reading = SampleReading::new(channel, raw);
            report.values.push((channel.topic.clone(), reading.value));

            match transport
                .publish(&channel.topic, reading.payload().into_bytes())
                .await
            {
                Ok(()) => {
                    metrics().reading_published();
                    report.published += 1;
                    if self.publish_failure_streak > 0 {
                        info!(
                            failed = self.publish_failure_streak,
                            "Publishing recovered"
                        );
                        self.publish_failure_streak = 0;
                    }
                }
                Err(e) => {
                    metrics().reading_publish_failed();
                    report.publish_failures += 1;
                    if self.publish_failure_streak == 0 {
                        warn!(topic = %channel.topic, error = %e, "Publish failed, continuing");
                    } else {
                        debug!(topic = %channel.topic, error = %e, "Publish failed");
                    }
                    self.publish_failure_streak += 1;
                }
            }
        }

        debug!(values = ?report.values, "Sampling iteration");
        report
    }

    /// Sample forever, returning the iteration count once shutdown is signalled
    ///
    /// Refuses to run against a transport that was never started so that no
    /// reading can be published before the session exists.
    pub async fn run<T: Transport>(
        &mut self,
        transport: &T,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<u64, SamplerError> {
        if !transport.is_started() {
            return Err(SamplerError::SessionNotStarted);
        }
        if !self.configured {
            self.configure()?;
        }

        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Sampling loop started"
        );

        while !*shutdown_rx.borrow() {
            let started = Instant::now();
            self.sample_once(transport).await;
            self.iterations += 1;
            metrics().iteration_completed(started.elapsed());

            if self.stats_every > 0 && self.iterations % self.stats_every == 0 {
                let snapshot = metrics().get_metrics();
                info!(
                    iterations = self.iterations,
                    published = snapshot.sampling.readings_published,
                    publish_failures = snapshot.sampling.publish_failures,
                    read_failures = snapshot.sampling.read_failures,
                    avg_iteration_ms = snapshot.sampling.avg_iteration_ms,
                    "Sampling stats"
                );
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        debug!("Shutdown sender dropped, stopping sampling loop");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!(iterations = self.iterations, "Sampling loop stopped");
        Ok(self.iterations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{MockAdc, MockTransport};

    fn channel(label: &str, adc: u8, topic: &str) -> SensorChannel {
        SensorChannel {
            label: label.to_string(),
            adc_channel: AdcChannel(adc),
            topic: topic.to_string(),
            calibration: Calibration::REFERENCE,
            attenuation: Attenuation::Db11,
        }
    }

    fn two_channels() -> Vec<SensorChannel> {
        vec![channel("a", 1, "t0"), channel("b", 2, "t1")]
    }

    #[test]
    fn test_reading_payload_is_plain_decimal() {
        let ch = channel("a", 1, "t0");
        assert_eq!(SampleReading::new(&ch, 1600).payload(), "0");
        assert_eq!(SampleReading::new(&ch, 0).payload(), "-160");
        assert_eq!(SampleReading::new(&ch, 4095).payload(), "249");
        assert!(!SampleReading::new(&ch, 17).payload().contains('\n'));
    }

    #[tokio::test]
    async fn test_sample_once_publishes_in_table_order() {
        let adc = MockAdc::new().with_value(AdcChannel(1), 1600).with_value(AdcChannel(2), 2600);
        let transport = MockTransport::started();
        let mut sampler =
            Sampler::new(adc, two_channels(), AdcWidth::Bits12, Duration::from_millis(1));

        let report = sampler.sample_once(&transport).await;

        assert_eq!(report.published, 2);
        assert_eq!(report.values, vec![("t0".to_string(), 0), ("t1".to_string(), 100)]);
        assert_eq!(
            transport.published().await,
            vec![
                ("t0".to_string(), b"0".to_vec()),
                ("t1".to_string(), b"100".to_vec())
            ]
        );
    }

    #[tokio::test]
    async fn test_out_of_range_sample_is_skipped() {
        let adc = MockAdc::new()
            .with_value(AdcChannel(1), 1024)
            .with_value(AdcChannel(2), 100);
        let transport = MockTransport::started();
        let mut sampler =
            Sampler::new(adc, two_channels(), AdcWidth::Bits10, Duration::from_millis(1));

        let report = sampler.sample_once(&transport).await;

        assert_eq!(report.read_failures, 1);
        assert_eq!(report.published, 1);
        assert_eq!(transport.published().await[0].0, "t1");
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_stop_iteration() {
        let adc = MockAdc::new().with_value(AdcChannel(1), 1).with_value(AdcChannel(2), 2);
        let transport = MockTransport::started().failing_topic("t0");
        let mut sampler =
            Sampler::new(adc, two_channels(), AdcWidth::Bits12, Duration::from_millis(1));

        let report = sampler.sample_once(&transport).await;

        assert_eq!(report.publish_failures, 1);
        assert_eq!(report.published, 1);
        assert_eq!(report.publish_attempts(), 2);
    }

    #[tokio::test]
    async fn test_run_refuses_unstarted_transport() {
        let transport = MockTransport::new();
        let mut sampler = Sampler::new(
            MockAdc::new(),
            two_channels(),
            AdcWidth::Bits12,
            Duration::from_millis(1),
        );
        let (_tx, rx) = watch::channel(false);

        assert!(matches!(
            sampler.run(&transport, rx).await,
            Err(SamplerError::SessionNotStarted)
        ));
        assert!(transport.published().await.is_empty());
    }

    #[test]
    fn test_configure_requires_channels() {
        let mut sampler = Sampler::new(
            MockAdc::new(),
            Vec::new(),
            AdcWidth::Bits12,
            Duration::from_millis(1),
        );
        assert!(matches!(sampler.configure(), Err(SamplerError::NoChannels)));
    }

    #[test]
    fn test_configure_applies_width_and_attenuation() {
        let adc = MockAdc::new();
        let log = adc.configuration();
        let mut channels = two_channels();
        channels[1].attenuation = Attenuation::Db6;
        let mut sampler = Sampler::new(adc, channels, AdcWidth::Bits11, Duration::from_millis(1));

        sampler.configure().unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.width, Some(AdcWidth::Bits11));
        assert_eq!(
            log.channels,
            vec![
                (AdcChannel(1), Attenuation::Db11),
                (AdcChannel(2), Attenuation::Db6)
            ]
        );
    }

    #[test]
    fn test_channels_from_config_use_default_attenuation() {
        let mut config = AgentConfig::reference();
        config.adc.attenuation = Attenuation::Db2_5;
        config.channels[0].attenuation = Some(Attenuation::Db0);

        let channels = channels_from_config(&config);
        assert_eq!(channels.len(), 5);
        assert_eq!(channels[0].attenuation, Attenuation::Db0);
        assert_eq!(channels[1].attenuation, Attenuation::Db2_5);
        assert_eq!(channels[0].topic, "Doigt0");
        assert_eq!(channels[0].adc_channel, AdcChannel(4));
    }
}
