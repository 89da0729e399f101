//! Linear calibration from raw samples to physical units

use serde::{Deserialize, Serialize};

/// Slope/offset pair applied as `trunc(slope * raw + offset)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub slope: f64,
    pub offset: f64,
}

impl Calibration {
    /// Flex sensor calibration used by the reference channel table
    pub const REFERENCE: Self = Self {
        slope: 0.1,
        offset: -160.0,
    };

    pub const fn new(slope: f64, offset: f64) -> Self {
        Self { slope, offset }
    }

    #[inline]
    pub fn apply(&self, raw: u16) -> i32 {
        calibrate(raw, self.slope, self.offset)
    }

    pub fn is_finite(&self) -> bool {
        self.slope.is_finite() && self.offset.is_finite()
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self::REFERENCE
    }
}

/// Calibrate a raw sample, truncating toward zero
///
/// Downstream consumers compare against values produced with a truncating
/// integer cast, so this must never round.
pub fn calibrate(raw: u16, slope: f64, offset: f64) -> i32 {
    // `as` saturates at the i32 bounds and maps NaN to 0
    (slope * f64::from(raw) + offset).trunc() as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_reference_points() {
        assert_eq!(calibrate(1600, 0.1, -160.0), 0);
        assert_eq!(calibrate(0, 0.1, -160.0), -160);
        assert_eq!(calibrate(4095, 0.1, -160.0), 249);
    }

    #[test]
    fn test_truncates_toward_zero_for_negative_values() {
        // -159.9 truncates to -159, a floor would give -160
        assert_eq!(calibrate(1, 0.1, -160.0), -159);
        // -0.5 truncates to 0
        assert_eq!(calibrate(1595, 0.1, -160.0), 0);
    }

    #[test]
    fn test_does_not_round_up() {
        // 249.5 stays 249
        assert_eq!(Calibration::REFERENCE.apply(4095), 249);
        // 0.9 stays 0
        assert_eq!(Calibration::REFERENCE.apply(1609), 0);
    }

    #[test]
    fn test_saturates_instead_of_wrapping() {
        assert_eq!(calibrate(u16::MAX, 1.0e9, 0.0), i32::MAX);
        assert_eq!(calibrate(u16::MAX, -1.0e9, 0.0), i32::MIN);
    }

    #[test]
    fn test_finite_check() {
        assert!(Calibration::REFERENCE.is_finite());
        assert!(!Calibration::new(f64::NAN, 0.0).is_finite());
        assert!(!Calibration::new(1.0, f64::INFINITY).is_finite());
    }

    proptest! {
        #[test]
        fn prop_calibration_is_pure(
            raw in any::<u16>(),
            slope in -10.0f64..10.0,
            offset in -1000.0f64..1000.0
        ) {
            prop_assert_eq!(calibrate(raw, slope, offset), calibrate(raw, slope, offset));
        }

        #[test]
        fn prop_result_is_within_one_of_exact(
            raw in any::<u16>(),
            slope in -10.0f64..10.0,
            offset in -1000.0f64..1000.0
        ) {
            let exact = slope * f64::from(raw) + offset;
            let value = f64::from(calibrate(raw, slope, offset));
            prop_assert!((exact - value).abs() < 1.0);
            // Truncation never moves away from zero
            prop_assert!(value.abs() <= exact.abs());
        }
    }
}
