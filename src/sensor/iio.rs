//! Linux Industrial I/O (IIO) sysfs backend
//!
//! Each channel is read from `<device>/in_voltage<N>_raw`. Resolution and
//! attenuation are owned by the kernel driver, so configuration only checks
//! that the device and channel attributes exist.

use super::{AdcChannel, AdcReader, AdcWidth, Attenuation, SensorError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default IIO device directory on most single-board computers
pub const DEFAULT_IIO_DEVICE: &str = "/sys/bus/iio/devices/iio:device0";

pub struct IioAdc {
    device_dir: PathBuf,
}

impl IioAdc {
    pub fn new(device_dir: impl Into<PathBuf>) -> Self {
        Self {
            device_dir: device_dir.into(),
        }
    }

    pub fn device_dir(&self) -> &Path {
        &self.device_dir
    }

    fn raw_path(&self, channel: AdcChannel) -> PathBuf {
        self.device_dir
            .join(format!("in_voltage{}_raw", channel.0))
    }

    /// Parse the contents of a `*_raw` attribute
    pub fn parse_raw(channel: AdcChannel, contents: &str) -> Result<u16, SensorError> {
        let trimmed = contents.trim();
        trimmed.parse::<u16>().map_err(|_| SensorError::InvalidData {
            channel,
            value: trimmed.to_string(),
        })
    }
}

impl AdcReader for IioAdc {
    fn configure_width(&mut self, width: AdcWidth) -> Result<(), SensorError> {
        if !self.device_dir.is_dir() {
            return Err(SensorError::DeviceUnavailable(
                self.device_dir.display().to_string(),
            ));
        }
        info!(
            device = %self.device_dir.display(),
            bits = width.bits(),
            "Using IIO ADC device (resolution is fixed by the kernel driver)"
        );
        Ok(())
    }

    fn configure_channel(
        &mut self,
        channel: AdcChannel,
        attenuation: Attenuation,
    ) -> Result<(), SensorError> {
        if !self.raw_path(channel).exists() {
            return Err(SensorError::UnknownChannel(channel));
        }
        debug!(%channel, %attenuation, "IIO channel available");
        Ok(())
    }

    fn read_raw(&mut self, channel: AdcChannel) -> Result<u16, SensorError> {
        let contents = fs::read_to_string(self.raw_path(channel))
            .map_err(|source| SensorError::ReadFailed { channel, source })?;
        Self::parse_raw(channel, &contents)
    }
}
