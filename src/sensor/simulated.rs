//! Deterministic ADC stand-in for bench runs without hardware

use super::{AdcChannel, AdcReader, AdcWidth, Attenuation, SensorError};
use std::collections::HashMap;
use tracing::debug;

/// Raw-count increment per read
const DEFAULT_STEP: u16 = 37;

/// Triangle-wave generator, one phase per channel
///
/// Each channel starts at a phase derived from its identifier so that
/// neighbouring channels do not report identical values.
pub struct SimulatedAdc {
    width: AdcWidth,
    step: u16,
    positions: HashMap<AdcChannel, u32>,
}

impl SimulatedAdc {
    pub fn new(width: AdcWidth) -> Self {
        Self {
            width,
            step: DEFAULT_STEP,
            positions: HashMap::new(),
        }
    }

    pub fn with_step(mut self, step: u16) -> Self {
        self.step = step.max(1);
        self
    }

    fn triangle(position: u32, max: u16) -> u16 {
        let max = u32::from(max);
        let period = 2 * max;
        let phase = position % period;
        let value = if phase <= max { phase } else { period - phase };
        // value <= max, which came from a u16
        value as u16
    }
}

impl AdcReader for SimulatedAdc {
    fn configure_width(&mut self, width: AdcWidth) -> Result<(), SensorError> {
        self.width = width;
        debug!(bits = width.bits(), "Simulated ADC width configured");
        Ok(())
    }

    fn configure_channel(
        &mut self,
        channel: AdcChannel,
        attenuation: Attenuation,
    ) -> Result<(), SensorError> {
        let max = u32::from(self.width.max_raw());
        self.positions
            .entry(channel)
            .or_insert(u32::from(channel.0) * max / 5);
        debug!(%channel, %attenuation, "Simulated ADC channel configured");
        Ok(())
    }

    fn read_raw(&mut self, channel: AdcChannel) -> Result<u16, SensorError> {
        let position = self
            .positions
            .get_mut(&channel)
            .ok_or(SensorError::UnknownChannel(channel))?;
        let value = Self::triangle(*position, self.width.max_raw());
        *position = position.wrapping_add(u32::from(self.step));
        Ok(value)
    }
}
