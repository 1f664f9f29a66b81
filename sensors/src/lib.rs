//! Thattia-PI Signal Pipeline
//!
//! Acquires raw readings from the detector head over Bluetooth LE (or a
//! synthetic demo walk when no head is reachable) and turns them into a
//! bounded signal percentage, target classification and depth estimate.

pub mod classify;
pub mod ground;
pub mod link;
pub mod normalize;
pub mod session;

pub use classify::{classify, Classifier, ClassifierBands, Material, MetalKind, TargetReport, TargetSize};
pub use ground::{GroundStability, StabilityRating};
pub use link::{ConnectionState, FallbackReason, LinkConfig, LinkManager, LinkStage, LinkStatus};
pub use normalize::{normalize, Calibration, Frequency, Normalizer, Sensitivity, SignalScale};
pub use session::{DetectorSession, Frame, Intent, SessionConfig};

use thattia_hal::HalError;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("HAL error: {0}")]
    Hal(#[from] HalError),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Sample source already active: {0}")]
    SourceConflict(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, SensorError>;
