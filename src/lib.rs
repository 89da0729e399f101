//! Telemetry Agent
//!
//! A sensor telemetry agent that brings up a network link, keeps an MQTT
//! session to a broker and publishes calibrated analog readings at a fixed
//! cadence.
//!
//! # Overview
//!
//! - [`link`] - network join with a bounded retry budget
//! - [`transport`] - MQTT session lifecycle and QoS 0 publishing
//! - [`sampling`] - the read, calibrate and publish loop
//! - [`sensor`] - ADC seam, calibration and host converter backends
//! - [`agent`] - startup ordering and teardown
//!
//! # Quick Start
//!
//! ```rust
//! use telemetry_agent::sensor::{calibrate, Calibration};
//! use telemetry_agent::AgentConfig;
//!
//! let config = AgentConfig::reference();
//! assert_eq!(config.channels.len(), 5);
//!
//! // Zero point of the bench calibration
//! assert_eq!(Calibration::REFERENCE.apply(1600), 0);
//! assert_eq!(calibrate(4095, 0.1, -160.0), 249);
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod link;
pub mod observability;
pub mod sampling;
pub mod sensor;
pub mod storage;
pub mod testing;
pub mod transport;

pub use agent::TelemetryAgent;
pub use config::*;
pub use error::{AgentError, AgentResult};
pub use link::{HostLinkDriver, LinkManager, LinkOutcome};
pub use sampling::Sampler;
pub use transport::mqtt::MqttSession;
