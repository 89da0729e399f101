//! Analog sensor channels and the ADC seam
//!
//! The sampling loop talks to the converter hardware only through
//! [`AdcReader`]. Two host backends are provided:
//!
//! - [`iio::IioAdc`] - Linux Industrial I/O sysfs (`in_voltageN_raw`)
//! - [`simulated::SimulatedAdc`] - deterministic waveform for bench runs

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod calibration;
pub mod iio;
pub mod simulated;

pub use calibration::{calibrate, Calibration};

/// Physical ADC input identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdcChannel(pub u8);

impl fmt::Display for AdcChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "adc{}", self.0)
    }
}

/// Conversion width, configured once for the whole converter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AdcWidth {
    Bits9,
    Bits10,
    Bits11,
    Bits12,
}

impl AdcWidth {
    pub fn bits(self) -> u8 {
        match self {
            AdcWidth::Bits9 => 9,
            AdcWidth::Bits10 => 10,
            AdcWidth::Bits11 => 11,
            AdcWidth::Bits12 => 12,
        }
    }

    /// Largest raw value a conversion at this width can produce
    pub fn max_raw(self) -> u16 {
        (1u16 << self.bits()) - 1
    }
}

impl Default for AdcWidth {
    fn default() -> Self {
        AdcWidth::Bits12
    }
}

impl TryFrom<u8> for AdcWidth {
    type Error = String;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            9 => Ok(AdcWidth::Bits9),
            10 => Ok(AdcWidth::Bits10),
            11 => Ok(AdcWidth::Bits11),
            12 => Ok(AdcWidth::Bits12),
            other => Err(format!("unsupported ADC width {other} (expected 9..=12)")),
        }
    }
}

impl From<AdcWidth> for u8 {
    fn from(width: AdcWidth) -> Self {
        width.bits()
    }
}

/// Input attenuation, configured per channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Attenuation {
    #[serde(rename = "0db")]
    Db0,
    #[serde(rename = "2.5db")]
    Db2_5,
    #[serde(rename = "6db")]
    Db6,
    #[serde(rename = "11db")]
    Db11,
}

impl Default for Attenuation {
    fn default() -> Self {
        Attenuation::Db11
    }
}

impl fmt::Display for Attenuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Attenuation::Db0 => "0dB",
            Attenuation::Db2_5 => "2.5dB",
            Attenuation::Db6 => "6dB",
            Attenuation::Db11 => "11dB",
        };
        f.write_str(label)
    }
}

/// ADC driver errors
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("Read failed on {channel}")]
    ReadFailed {
        channel: AdcChannel,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid sample on {channel}: {value:?}")]
    InvalidData { channel: AdcChannel, value: String },
    #[error("Sample {raw} on {channel} exceeds {max} for the configured width")]
    OutOfRange {
        channel: AdcChannel,
        raw: u16,
        max: u16,
    },
    #[error("Unknown channel {0}")]
    UnknownChannel(AdcChannel),
    #[error("ADC device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Blocking raw-sample access to the converter
///
/// Reads are expected to be bounded by hardware conversion time, so the
/// sampling loop calls them directly from its task.
pub trait AdcReader: Send {
    fn configure_width(&mut self, width: AdcWidth) -> Result<(), SensorError>;

    fn configure_channel(
        &mut self,
        channel: AdcChannel,
        attenuation: Attenuation,
    ) -> Result<(), SensorError>;

    fn read_raw(&mut self, channel: AdcChannel) -> Result<u16, SensorError>;
}

impl<A: AdcReader + ?Sized> AdcReader for Box<A> {
    fn configure_width(&mut self, width: AdcWidth) -> Result<(), SensorError> {
        (**self).configure_width(width)
    }

    fn configure_channel(
        &mut self,
        channel: AdcChannel,
        attenuation: Attenuation,
    ) -> Result<(), SensorError> {
        (**self).configure_channel(channel, attenuation)
    }

    fn read_raw(&mut self, channel: AdcChannel) -> Result<u16, SensorError> {
        (**self).read_raw(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_width_max_raw() {
        assert_eq!(AdcWidth::Bits9.max_raw(), 511);
        assert_eq!(AdcWidth::Bits10.max_raw(), 1023);
        assert_eq!(AdcWidth::Bits11.max_raw(), 2047);
        assert_eq!(AdcWidth::Bits12.max_raw(), 4095);
    }

    #[test]
    fn test_width_from_bits() {
        assert_eq!(AdcWidth::try_from(12), Ok(AdcWidth::Bits12));
        assert_eq!(AdcWidth::try_from(9), Ok(AdcWidth::Bits9));
        assert!(AdcWidth::try_from(8).is_err());
        assert!(AdcWidth::try_from(16).is_err());
    }

    #[test]
    fn test_channel_display() {
        assert_eq!(AdcChannel(4).to_string(), "adc4");
    }

    #[test]
    fn test_attenuation_display() {
        assert_eq!(Attenuation::Db11.to_string(), "11dB");
        assert_eq!(Attenuation::Db2_5.to_string(), "2.5dB");
    }
}
