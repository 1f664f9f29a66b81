//! Thattia-PI Hardware Abstraction Layer
//!
//! Provides the platform capabilities the detector pipeline depends on,
//! without tying it to a concrete Bluetooth stack.
//!
//! # Modules
//!
//! - [`ble`] - Bluetooth LE adapter trait, service contract and payload parsing
//! - [`loopback`] - In-memory peripheral for tests and bench simulation
//! - [`audio`] - Signal-to-tone mapping and PCM tone synthesis
//! - `btle` - btleplug backend (feature `btleplug`)
//!
//! # Example
//!
//! ```rust,no_run
//! use thattia_hal::{BleAdapter, BleConfig, DeviceFilter, UnavailableAdapter};
//!
//! #[tokio::main]
//! async fn main() {
//!     let adapter = UnavailableAdapter;
//!     let config = BleConfig::default();
//!
//!     if let Err(e) = adapter.request_device(&DeviceFilter::from(&config)).await {
//!         println!("no peripheral: {}", e);
//!     }
//! }
//! ```

use std::time::Duration;
use uuid::Uuid;

pub mod audio;
pub mod ble;
pub mod loopback;

#[cfg(feature = "btleplug")]
pub mod btle;

// Re-exports for convenience
pub use audio::{rms_level, AudioFormat, Beep, Tone, ToneMapper};
pub use ble::{
    parse_sample, BleAdapter, DeviceFilter, DeviceId, DeviceInfo, DisconnectHandler,
    NotificationHandler, UnavailableAdapter, SIGNAL_CHARACTERISTIC_UUID, SIGNAL_SERVICE_UUID,
};
pub use loopback::{FailPoint, LoopbackAdapter};

#[cfg(feature = "btleplug")]
pub use btle::BtleplugAdapter;

/// HAL Error types
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HalError {
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("Bluetooth adapter is disabled")]
    AdapterDisabled,

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("No matching peripheral found")]
    NoDevice,

    #[error("Device selection cancelled")]
    Cancelled,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(Uuid),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Communication error: {0}")]
    CommunicationError(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),
}

/// BLE configuration shared by adapters
#[derive(Debug, Clone)]
pub struct BleConfig {
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    pub scan_timeout: Duration,
    pub connect_timeout: Duration,
    /// Optional advertised-name prefix used alongside the service filter
    pub name_prefix: Option<String>,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            service_uuid: SIGNAL_SERVICE_UUID,
            characteristic_uuid: SIGNAL_CHARACTERISTIC_UUID,
            scan_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            name_prefix: None,
        }
    }
}
