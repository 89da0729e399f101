//! Agent configuration
//!
//! Configuration is loaded from a TOML file. When no file is supplied the
//! compiled-in reference table ([`AgentConfig::reference`]) is used, which
//! matches the five-channel flex sensor deployment.

use crate::link::Credentials;
use crate::sensor::{AdcChannel, AdcWidth, Attenuation, Calibration};
use crate::transport::mqtt::health_monitor::HealthMonitor;
use crate::transport::mqtt::{validate_topic, ReconnectConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main agent configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub link: LinkSection,
    pub mqtt: MqttSection,
    #[serde(default)]
    pub sampling: SamplingSection,
    #[serde(default)]
    pub adc: AdcSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSection {
    /// Agent identifier (must match [a-zA-Z0-9._-]+), used as MQTT client id prefix
    pub id: String,
    #[serde(default)]
    pub description: String,
}

/// Network join parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkSection {
    pub ssid: String,
    #[serde(default)]
    pub passphrase: String,
    /// Environment variable that overrides `passphrase` when set
    pub passphrase_env: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Upper bound on the startup rendezvous with the link driver
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    /// Host driver only: timeout of one reachability probe
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    2000
}

impl LinkSection {
    /// Resolve join credentials, preferring the passphrase environment variable
    pub fn credentials(&self) -> Credentials {
        let passphrase = self
            .passphrase_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
            .unwrap_or_else(|| self.passphrase.clone());
        Credentials::new(self.ssid.clone(), passphrase)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Broker session parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL, `mqtt://host[:port]`
    pub broker_url: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// How long startup waits for the first ConnAck before sampling anyway
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

impl MqttSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SamplingSection {
    /// Delay between the end of one publish burst and the next read
    #[serde(default = "default_interval")]
    pub interval_ms: u64,
    /// Log a stats line every N iterations (0 disables)
    #[serde(default = "default_stats_every")]
    pub stats_every: u64,
}

fn default_interval() -> u64 {
    100
}

fn default_stats_every() -> u64 {
    600
}

impl Default for SamplingSection {
    fn default() -> Self {
        Self {
            interval_ms: default_interval(),
            stats_every: default_stats_every(),
        }
    }
}

impl SamplingSection {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdcBackend {
    #[default]
    Simulated,
    Iio,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdcSection {
    #[serde(default)]
    pub backend: AdcBackend,
    #[serde(default = "default_iio_device")]
    pub iio_device: PathBuf,
    #[serde(default)]
    pub width: AdcWidth,
    /// Attenuation for channels that do not set their own
    #[serde(default)]
    pub attenuation: Attenuation,
}

fn default_iio_device() -> PathBuf {
    PathBuf::from(crate::sensor::iio::DEFAULT_IIO_DEVICE)
}

impl Default for AdcSection {
    fn default() -> Self {
        Self {
            backend: AdcBackend::default(),
            iio_device: default_iio_device(),
            width: AdcWidth::default(),
            attenuation: Attenuation::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageSection {
    /// Directory holding the agent's persistent state
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("state")
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

/// One analog input mapped to one calibration and one publish topic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelConfig {
    pub label: String,
    pub adc_channel: AdcChannel,
    pub topic: String,
    #[serde(default)]
    pub calibration: Calibration,
    pub attenuation: Option<Attenuation>,
}

impl ChannelConfig {
    pub fn new(label: &str, adc_channel: u8, topic: &str) -> Self {
        Self {
            label: label.to_string(),
            adc_channel: AdcChannel(adc_channel),
            topic: topic.to_string(),
            calibration: Calibration::REFERENCE,
            attenuation: None,
        }
    }
}

/// Reference channel table, in publish order
fn default_channels() -> Vec<ChannelConfig> {
    vec![
        ChannelConfig::new("little", 4, "Doigt0"),
        ChannelConfig::new("ring", 6, "Doigt1"),
        ChannelConfig::new("middle", 0, "Doigt2"),
        ChannelConfig::new("index", 7, "Doigt3"),
        ChannelConfig::new("thumb", 3, "Doigt4"),
    ]
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid agent ID format: {0}")]
    InvalidAgentId(String),
    #[error("Invalid channel table: {0}")]
    InvalidChannels(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AgentConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Compiled-in configuration used when no file is supplied
    pub fn reference() -> Self {
        Self {
            agent: AgentSection {
                id: "telemetry-agent".to_string(),
                description: "Five channel flex sensor telemetry".to_string(),
            },
            link: LinkSection {
                ssid: "telemetry-ap".to_string(),
                passphrase: String::new(),
                passphrase_env: Some("TELEMETRY_LINK_PASSPHRASE".to_string()),
                max_retries: default_max_retries(),
                startup_timeout_secs: default_startup_timeout(),
                probe_timeout_ms: default_probe_timeout(),
            },
            mqtt: MqttSection {
                broker_url: "mqtt://192.168.1.100".to_string(),
                keep_alive_secs: default_keep_alive(),
                connect_timeout_secs: default_connect_timeout(),
                reconnect: ReconnectConfig::default(),
            },
            sampling: SamplingSection::default(),
            adc: AdcSection::default(),
            storage: StorageSection::default(),
            channels: default_channels(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_agent_id(&self.agent.id)?;

        if self.link.ssid.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "link.ssid must not be empty".to_string(),
            ));
        }
        if self.link.startup_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "link.startup_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.mqtt.keep_alive_secs < 5 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.keep_alive_secs must be at least 5".to_string(),
            ));
        }
        HealthMonitor::validate_connection_config(&self.mqtt.reconnect)
            .map_err(|e| ConfigError::InvalidConfig(format!("mqtt.reconnect: {e}")))?;
        if self.sampling.interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "sampling.interval_ms must be greater than 0".to_string(),
            ));
        }

        validate_channels(&self.channels)
    }
}

/// Validate agent ID format
fn validate_agent_id(agent_id: &str) -> Result<(), ConfigError> {
    let valid_chars = agent_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if agent_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidAgentId(format!(
            "Agent ID '{agent_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}

fn validate_channels(channels: &[ChannelConfig]) -> Result<(), ConfigError> {
    if channels.is_empty() {
        return Err(ConfigError::InvalidChannels(
            "at least one channel is required".to_string(),
        ));
    }

    let mut topics = HashSet::new();
    for channel in channels {
        validate_topic(&channel.topic).map_err(|e| {
            ConfigError::InvalidChannels(format!("channel '{}': {e}", channel.label))
        })?;
        if !topics.insert(channel.topic.as_str()) {
            return Err(ConfigError::InvalidChannels(format!(
                "topic '{}' is used by more than one channel",
                channel.topic
            )));
        }
        if !channel.calibration.is_finite() {
            return Err(ConfigError::InvalidChannels(format!(
                "channel '{}' has a non-finite calibration",
                channel.label
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[agent]
id = "bench-01"

[link]
ssid = "lab"

[mqtt]
broker_url = "mqtt://localhost:1883"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = AgentConfig::from_toml_str(MINIMAL).unwrap();

        assert_eq!(config.agent.id, "bench-01");
        assert_eq!(config.link.max_retries, 3);
        assert_eq!(config.link.startup_timeout_secs, 30);
        assert_eq!(config.mqtt.keep_alive_secs, 60);
        assert_eq!(config.sampling.interval_ms, 100);
        assert_eq!(config.adc.backend, AdcBackend::Simulated);
        assert_eq!(config.adc.width, AdcWidth::Bits12);
        assert_eq!(config.adc.attenuation, Attenuation::Db11);
        assert_eq!(config.channels, default_channels());
    }

    #[test]
    fn test_reference_config_is_valid() {
        let config = AgentConfig::reference();
        assert!(config.validate().is_ok());
        assert_eq!(config.channels.len(), 5);
        assert_eq!(config.channels[0].adc_channel, AdcChannel(4));
        assert_eq!(config.channels[4].adc_channel, AdcChannel(3));
        assert!(config
            .channels
            .iter()
            .all(|c| c.calibration == Calibration::REFERENCE));
    }

    #[test]
    fn test_reference_config_round_trips_through_toml() {
        let config = AgentConfig::reference();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let parsed = AgentConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_invalid_agent_id() {
        assert!(validate_agent_id("invalid@agent").is_err());
        assert!(validate_agent_id("").is_err());
        assert!(validate_agent_id("valid-agent_123.test").is_ok());
    }

    #[test]
    fn test_duplicate_topics_rejected() {
        let mut channels = default_channels();
        channels[1].topic = channels[0].topic.clone();
        assert!(matches!(
            validate_channels(&channels),
            Err(ConfigError::InvalidChannels(_))
        ));
    }

    #[test]
    fn test_wildcard_topic_rejected() {
        let channels = vec![ChannelConfig::new("a", 0, "sensors/+/value")];
        assert!(validate_channels(&channels).is_err());
    }

    #[test]
    fn test_empty_channel_table_rejected() {
        assert!(validate_channels(&[]).is_err());
    }

    #[test]
    fn test_passphrase_env_overrides_file_value() {
        let mut link = AgentConfig::reference().link;
        link.passphrase = "from-file".to_string();
        link.passphrase_env = Some("TELEMETRY_TEST_PASSPHRASE_OVERRIDE".to_string());

        std::env::remove_var("TELEMETRY_TEST_PASSPHRASE_OVERRIDE");
        assert_eq!(link.credentials().passphrase(), "from-file");

        std::env::set_var("TELEMETRY_TEST_PASSPHRASE_OVERRIDE", "from-env");
        assert_eq!(link.credentials().passphrase(), "from-env");

        std::env::remove_var("TELEMETRY_TEST_PASSPHRASE_OVERRIDE");
    }
}
