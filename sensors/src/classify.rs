//! Target Identification
//!
//! Cosmetic discrimination of a target from signal percentage and raw
//! reading. This is not a physical model; it only has to be deterministic.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Target size band
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TargetSize {
    None,
    Small,
    Medium,
    Large,
}

/// Simulated material identification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Material {
    None,
    Iron,
    GoldCopper,
    SilverPrecious,
}

/// Ferrous / non-ferrous hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetalKind {
    Unknown,
    NonFerrous,
    Ferrous,
}

impl fmt::Display for TargetSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TargetSize::None => "No Target",
            TargetSize::Small => "Small Metal",
            TargetSize::Medium => "Medium Metal",
            TargetSize::Large => "Large Target!",
        };
        f.write_str(label)
    }
}

impl fmt::Display for Material {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Material::None => "No Target",
            Material::Iron => "Iron / Scrap",
            Material::GoldCopper => "Gold / Copper",
            Material::SilverPrecious => "Silver / Precious Metal",
        };
        f.write_str(label)
    }
}

impl fmt::Display for MetalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MetalKind::Unknown => "-",
            MetalKind::NonFerrous => "Non-ferrous",
            MetalKind::Ferrous => "Ferrous",
        };
        f.write_str(label)
    }
}

/// Band boundaries, in percent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierBands {
    /// Below this nothing is reported
    pub detect_threshold: f64,
    pub small_below: f64,
    pub medium_below: f64,

    /// Modulus applied to the raw reading for material perturbation
    pub material_modulus: f64,
    pub iron_below: f64,
    pub iron_mod_below: f64,
    pub gold_below: f64,
    pub gold_mod_below: f64,

    pub ferrous_above: f64,
    pub non_ferrous_above: f64,

    /// Depth in cm at 0 %
    pub depth_base_cm: f64,
    pub depth_cm_per_percent: f64,
}

impl Default for ClassifierBands {
    fn default() -> Self {
        Self {
            detect_threshold: 10.0,
            small_below: 30.0,
            medium_below: 60.0,
            material_modulus: 100.0,
            iron_below: 35.0,
            iron_mod_below: 25.0,
            gold_below: 65.0,
            gold_mod_below: 60.0,
            ferrous_above: 50.0,
            non_ferrous_above: 20.0,
            depth_base_cm: 30.0,
            depth_cm_per_percent: 0.25,
        }
    }
}

/// Full target read-out
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetReport {
    pub size: TargetSize,
    pub material: Material,
    pub metal: MetalKind,
    /// Estimated depth in cm, `None` below the detection threshold
    pub depth_cm: Option<f64>,
}

impl TargetReport {
    pub fn none() -> Self {
        Self {
            size: TargetSize::None,
            material: Material::None,
            metal: MetalKind::Unknown,
            depth_cm: None,
        }
    }

    pub fn is_target(&self) -> bool {
        self.size != TargetSize::None
    }
}

/// Target classifier
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    bands: ClassifierBands,
}

impl Classifier {
    pub fn new(bands: ClassifierBands) -> Self {
        Self { bands }
    }

    pub fn bands(&self) -> &ClassifierBands {
        &self.bands
    }

    /// Classify a reading
    pub fn classify(&self, percentage: f64, raw: f64) -> TargetReport {
        if !percentage.is_finite() || percentage < self.bands.detect_threshold {
            return TargetReport::none();
        }

        TargetReport {
            size: self.size(percentage),
            material: self.material(percentage, raw),
            metal: self.metal(percentage),
            depth_cm: self.depth_cm(percentage),
        }
    }

    pub fn size(&self, percentage: f64) -> TargetSize {
        let b = &self.bands;
        match percentage {
            p if p.is_nan() || p < b.detect_threshold => TargetSize::None,
            p if p < b.small_below => TargetSize::Small,
            p if p < b.medium_below => TargetSize::Medium,
            _ => TargetSize::Large,
        }
    }

    /// Material band, shifted by `raw mod modulus` within a percentage band
    pub fn material(&self, percentage: f64, raw: f64) -> Material {
        let b = &self.bands;
        if percentage.is_nan() || percentage < b.detect_threshold {
            return Material::None;
        }

        let signal_mod = if raw.is_finite() && b.material_modulus > 0.0 {
            raw.rem_euclid(b.material_modulus)
        } else {
            0.0
        };

        if percentage < b.iron_below || signal_mod < b.iron_mod_below {
            Material::Iron
        } else if percentage < b.gold_below || signal_mod < b.gold_mod_below {
            Material::GoldCopper
        } else {
            Material::SilverPrecious
        }
    }

    pub fn metal(&self, percentage: f64) -> MetalKind {
        let b = &self.bands;
        match percentage {
            p if p > b.ferrous_above => MetalKind::Ferrous,
            p if p > b.non_ferrous_above => MetalKind::NonFerrous,
            _ => MetalKind::Unknown,
        }
    }

    /// Affine depth estimate, whole centimetres
    pub fn depth_cm(&self, percentage: f64) -> Option<f64> {
        let b = &self.bands;
        (percentage > b.detect_threshold)
            .then(|| (b.depth_base_cm - percentage * b.depth_cm_per_percent).round())
    }
}

/// [`Classifier::classify`] with default bands
pub fn classify(percentage: f64, raw: f64) -> TargetReport {
    Classifier::default().classify(percentage, raw)
}
