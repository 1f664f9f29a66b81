//! Ground Stability
//!
//! Simulated soil-mineralisation indicator. Drifts as a symmetric random walk
//! while a link is up and snaps back to 100 % on calibration.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const GROUND_STABLE: f64 = 100.0;

/// Stability indicator in `[0, 100]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroundStability {
    value: f64,
    step: f64,
}

impl Default for GroundStability {
    fn default() -> Self {
        Self {
            value: GROUND_STABLE,
            step: 10.0,
        }
    }
}

impl GroundStability {
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Advance the walk with a uniform draw `u` in `[0, 1)`
    pub fn drift(&mut self, u: f64) -> f64 {
        let change = (u - 0.5) * self.step;
        self.value = (self.value + change).clamp(0.0, GROUND_STABLE);
        self.value
    }

    pub fn reset(&mut self) {
        self.value = GROUND_STABLE;
    }

    /// Coarse rating used by displays
    pub fn rating(&self) -> StabilityRating {
        match self.value {
            v if v > 70.0 => StabilityRating::Stable,
            v if v > 40.0 => StabilityRating::Moderate,
            _ => StabilityRating::Unstable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StabilityRating {
    Stable,
    Moderate,
    Unstable,
}

impl fmt::Display for StabilityRating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StabilityRating::Stable => "Stable",
            StabilityRating::Moderate => "Moderate",
            StabilityRating::Unstable => "Unstable",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drift_is_bounded() {
        let mut ground = GroundStability::default();
        for _ in 0..50 {
            ground.drift(0.99);
        }
        assert_eq!(ground.value(), 100.0);

        for _ in 0..50 {
            ground.drift(0.0);
        }
        assert_eq!(ground.value(), 0.0);
        assert_eq!(ground.rating(), StabilityRating::Unstable);
    }

    #[test]
    fn drift_step_size() {
        let mut ground = GroundStability::default();
        assert_eq!(ground.drift(0.0), 95.0);
        assert_eq!(ground.drift(0.25), 92.5);
        assert_eq!(ground.rating(), StabilityRating::Stable);

        ground.reset();
        assert_eq!(ground.value(), GROUND_STABLE);
    }

    #[test]
    fn rating_bands() {
        let mut ground = GroundStability::default();
        for _ in 0..6 {
            ground.drift(0.0);
        }
        assert_eq!(ground.value(), 70.0);
        assert_eq!(ground.rating(), StabilityRating::Moderate);
        assert_eq!(ground.rating().to_string(), "Moderate");

        for _ in 0..6 {
            ground.drift(0.0);
        }
        assert_eq!(ground.value(), 40.0);
        assert_eq!(ground.rating(), StabilityRating::Unstable);
    }
}
