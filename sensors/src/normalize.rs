//! Signal Normalization
//!
//! Turns a raw peripheral sample into a bounded percentage using the
//! calibration offset and the user sensitivity setting.

use crate::{Result, SensorError};
use serde::{Deserialize, Serialize};

/// Raw-sample scale emitted by a firmware generation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalScale {
    /// Largest raw value the peripheral emits
    pub upper_bound: f64,
    /// Demo random-walk step size
    pub demo_step: f64,
}

impl SignalScale {
    /// 0 - 30000 integer readings (current firmware)
    pub const PULSE_30K: SignalScale = SignalScale {
        upper_bound: 30000.0,
        demo_step: 2000.0,
    };

    /// 0 - 100 percentage-like readings (early firmware)
    pub const PERCENT: SignalScale = SignalScale {
        upper_bound: 100.0,
        demo_step: 20.0 / 3.0,
    };

    pub fn new(upper_bound: f64, demo_step: f64) -> Result<Self> {
        if !upper_bound.is_finite() || upper_bound <= 0.0 {
            return Err(SensorError::InvalidConfig(format!(
                "raw scale upper bound must be positive, got {}",
                upper_bound
            )));
        }
        if !demo_step.is_finite() || demo_step < 0.0 {
            return Err(SensorError::InvalidConfig(format!(
                "demo step must be non-negative, got {}",
                demo_step
            )));
        }
        Ok(Self {
            upper_bound,
            demo_step,
        })
    }
}

impl Default for SignalScale {
    fn default() -> Self {
        Self::PULSE_30K
    }
}

pub const MIN_SENSITIVITY: f64 = 10.0;
pub const MAX_SENSITIVITY: f64 = 100.0;
pub const DEFAULT_SENSITIVITY: f64 = 80.0;

pub const MIN_FREQUENCY: f64 = 50.0;
pub const MAX_FREQUENCY: f64 = 200.0;
pub const DEFAULT_FREQUENCY: f64 = 100.0;

/// Sensitivity percentage, clamped to the slider range
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Sensitivity(f64);

impl Sensitivity {
    /// Returns `None` for non-finite input
    pub fn new(value: f64) -> Option<Self> {
        value
            .is_finite()
            .then(|| Self(value.clamp(MIN_SENSITIVITY, MAX_SENSITIVITY)))
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl Default for Sensitivity {
    fn default() -> Self {
        Self(DEFAULT_SENSITIVITY)
    }
}

/// Pulse frequency in Hz. Display only; never sent to the peripheral.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Frequency(f64);

impl Frequency {
    /// Returns `None` for non-finite input
    pub fn new(value: f64) -> Option<Self> {
        value
            .is_finite()
            .then(|| Self(value.clamp(MIN_FREQUENCY, MAX_FREQUENCY)))
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl Default for Frequency {
    fn default() -> Self {
        Self(DEFAULT_FREQUENCY)
    }
}

/// NaN and negative readings count as zero
fn sanitize(value: f64) -> f64 {
    if value.is_nan() || value < 0.0 {
        0.0
    } else {
        value
    }
}

/// Percentage computation for a fixed raw scale
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    scale: SignalScale,
}

impl Normalizer {
    pub fn new(scale: SignalScale) -> Self {
        Self { scale }
    }

    pub fn scale(&self) -> SignalScale {
        self.scale
    }

    /// Map a raw sample to `[0, 100]`.
    ///
    /// Higher sensitivity shrinks the full-scale value, so the same adjusted
    /// reading yields a higher percentage. Sensitivity that is not a positive
    /// finite number yields 0; values above 100 are treated as 100.
    pub fn normalize(&self, raw: f64, offset: f64, sensitivity: f64) -> f64 {
        if !sensitivity.is_finite() || sensitivity <= 0.0 {
            return 0.0;
        }
        let sensitivity = sensitivity.min(MAX_SENSITIVITY);

        let adjusted = (sanitize(raw) - sanitize(offset)).max(0.0);
        let full_scale = self.scale.upper_bound / (sensitivity / 100.0);
        let percentage = (adjusted / full_scale) * 100.0;

        if percentage.is_nan() {
            0.0
        } else {
            percentage.clamp(0.0, 100.0)
        }
    }
}

/// [`Normalizer::normalize`] on the default 0 - 30000 scale
pub fn normalize(raw: f64, offset: f64, sensitivity: f64) -> f64 {
    Normalizer::default().normalize(raw, offset, sensitivity)
}

/// Ground-baseline offset. Only [`Calibration::calibrate`] changes it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    offset: f64,
}

impl Calibration {
    /// Zero the ground against the current raw sample
    pub fn calibrate(&mut self, current_raw: f64) -> f64 {
        self.offset = sanitize(current_raw);
        self.offset
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_scale_at_full_sensitivity() {
        assert_eq!(normalize(15000.0, 0.0, 100.0), 50.0);
    }

    #[test]
    fn zero_signal_is_zero_percent() {
        assert_eq!(normalize(0.0, 0.0, 80.0), 0.0);
    }

    #[test]
    fn stays_within_bounds() {
        let raws = [0.0, 1.0, 299.0, 15000.0, 30000.0, 45000.0, 1e12];
        let offsets = [0.0, 100.0, 14999.0];
        let sensitivities = [0.5, 10.0, 55.0, 80.0, 100.0];

        for &raw in &raws {
            for &offset in &offsets {
                for &s in &sensitivities {
                    let p = normalize(raw, offset, s);
                    assert!((0.0..=100.0).contains(&p), "raw={} offset={} s={} -> {}", raw, offset, s, p);
                }
            }
        }
    }

    #[test]
    fn monotonic_in_raw_and_sensitivity() {
        let mut previous = 0.0;
        for step in 0..=400 {
            let p = normalize(step as f64 * 100.0, 500.0, 70.0);
            assert!(p >= previous);
            previous = p;
        }

        let mut previous = 0.0;
        for s in 1..=100 {
            let p = normalize(9000.0, 0.0, s as f64);
            assert!(p >= previous);
            previous = p;
        }
    }

    #[test]
    fn below_offset_clamps_to_zero() {
        assert_eq!(normalize(100.0, 2000.0, 100.0), 0.0);
    }

    #[test]
    fn malformed_inputs_are_contained() {
        assert_eq!(normalize(f64::NAN, 0.0, 80.0), 0.0);
        assert_eq!(normalize(1000.0, 0.0, f64::NAN), 0.0);
        assert_eq!(normalize(1000.0, 0.0, -20.0), 0.0);
        assert_eq!(normalize(1000.0, 0.0, 0.0), 0.0);
        assert_eq!(normalize(-1000.0, 0.0, 80.0), 0.0);
        assert_eq!(normalize(f64::INFINITY, 0.0, 80.0), 100.0);
        assert_eq!(normalize(30000.0, f64::NAN, 250.0), 100.0);
    }

    #[test]
    fn calibration_zeroes_current_sample() {
        let mut calibration = Calibration::default();
        let raw = 12345.0;
        calibration.calibrate(raw);

        assert_eq!(calibration.offset(), raw);
        assert_eq!(normalize(raw, calibration.offset(), 100.0), 0.0);
        assert!(normalize(raw + 3000.0, calibration.offset(), 100.0) > 0.0);
    }

    #[test]
    fn percent_scale_generation() {
        let normalizer = Normalizer::new(SignalScale::PERCENT);
        assert_eq!(normalizer.normalize(40.0, 0.0, 100.0), 40.0);
        assert_eq!(normalizer.normalize(40.0, 0.0, 50.0), 20.0);
    }

    #[test]
    fn parameters_clamp_and_reject() {
        assert_eq!(Sensitivity::new(5.0).unwrap().value(), MIN_SENSITIVITY);
        assert_eq!(Sensitivity::new(150.0).unwrap().value(), MAX_SENSITIVITY);
        assert!(Sensitivity::new(f64::NAN).is_none());
        assert_eq!(Frequency::new(20.0).unwrap().value(), MIN_FREQUENCY);
        assert_eq!(Frequency::new(120.0).unwrap().value(), 120.0);
        assert!(Frequency::new(f64::INFINITY).is_none());
        assert!(SignalScale::new(0.0, 10.0).is_err());
        assert!(SignalScale::new(100.0, -1.0).is_err());
    }
}
