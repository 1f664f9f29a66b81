//! Bluetooth LE interface for Thattia-PI HAL
//! Abstract adapter contract and the ESP32 signal service definition

use crate::{BleConfig, HalError};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// ESP32 UART-style service carrying the detector signal
pub const SIGNAL_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);

/// Notify characteristic on [`SIGNAL_SERVICE_UUID`]
pub const SIGNAL_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

/// Called by the adapter when the peer drops the link
pub type DisconnectHandler = Arc<dyn Fn(&DeviceId) + Send + Sync>;

/// Called by the adapter with every notification payload
pub type NotificationHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Platform identifier of a peripheral (UUID on macOS/Windows, MAC on Linux)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A peripheral returned by discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: Option<String>,
    pub services: Vec<Uuid>,
}

/// Discovery filter
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceFilter {
    pub services: Vec<Uuid>,
    pub name_prefix: Option<String>,
}

impl DeviceFilter {
    /// Filter on a single advertised service
    pub fn service(uuid: Uuid) -> Self {
        Self {
            services: vec![uuid],
            name_prefix: None,
        }
    }

    /// Check whether a discovered peripheral satisfies this filter
    pub fn matches(&self, device: &DeviceInfo) -> bool {
        let service_ok = self.services.is_empty()
            || self.services.iter().any(|s| device.services.contains(s));

        let name_ok = match &self.name_prefix {
            Some(prefix) if !prefix.is_empty() => device
                .name
                .as_deref()
                .map(|n| n.starts_with(prefix.as_str()))
                .unwrap_or(false),
            _ => true,
        };

        service_ok && name_ok
    }
}

impl From<&BleConfig> for DeviceFilter {
    fn from(config: &BleConfig) -> Self {
        Self {
            services: vec![config.service_uuid],
            name_prefix: config.name_prefix.clone(),
        }
    }
}

/// Platform Bluetooth LE capability.
///
/// Operations are awaited one at a time by the caller; implementations do
/// not need to support overlapping calls against the same peripheral.
pub trait BleAdapter: Send + Sync + 'static {
    /// Backend name, for logs
    fn name(&self) -> &str;

    /// Bring up the platform stack
    fn initialize(&self) -> BoxFuture<'_, Result<(), HalError>>;

    /// Check if the radio is powered on
    fn is_enabled(&self) -> BoxFuture<'_, Result<bool, HalError>>;

    /// Ask the platform to power the radio on
    fn request_enable(&self) -> BoxFuture<'_, Result<(), HalError>>;

    /// Discover and select exactly one peripheral matching `filter`
    fn request_device<'a>(
        &'a self,
        filter: &'a DeviceFilter,
    ) -> BoxFuture<'a, Result<DeviceInfo, HalError>>;

    /// Open a GATT connection; `on_disconnect` fires if the peer drops it
    fn connect<'a>(
        &'a self,
        id: &'a DeviceId,
        on_disconnect: DisconnectHandler,
    ) -> BoxFuture<'a, Result<(), HalError>>;

    /// Close the GATT connection
    fn disconnect<'a>(&'a self, id: &'a DeviceId) -> BoxFuture<'a, Result<(), HalError>>;

    /// Look up service and characteristic, then subscribe to notifications
    fn start_notifications<'a>(
        &'a self,
        id: &'a DeviceId,
        service: Uuid,
        characteristic: Uuid,
        on_value: NotificationHandler,
    ) -> BoxFuture<'a, Result<(), HalError>>;

    /// Unsubscribe from notifications
    fn stop_notifications<'a>(
        &'a self,
        id: &'a DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> BoxFuture<'a, Result<(), HalError>>;
}

/// Adapter for runtimes with no Bluetooth capability at all.
/// Every operation fails with [`HalError::AdapterUnavailable`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableAdapter;

impl UnavailableAdapter {
    fn error() -> HalError {
        HalError::AdapterUnavailable("no Bluetooth capability in this runtime".to_string())
    }
}

impl BleAdapter for UnavailableAdapter {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn initialize(&self) -> BoxFuture<'_, Result<(), HalError>> {
        Box::pin(async { Err(Self::error()) })
    }

    fn is_enabled(&self) -> BoxFuture<'_, Result<bool, HalError>> {
        Box::pin(async { Err(Self::error()) })
    }

    fn request_enable(&self) -> BoxFuture<'_, Result<(), HalError>> {
        Box::pin(async { Err(Self::error()) })
    }

    fn request_device<'a>(
        &'a self,
        _filter: &'a DeviceFilter,
    ) -> BoxFuture<'a, Result<DeviceInfo, HalError>> {
        Box::pin(async { Err(Self::error()) })
    }

    fn connect<'a>(
        &'a self,
        _id: &'a DeviceId,
        _on_disconnect: DisconnectHandler,
    ) -> BoxFuture<'a, Result<(), HalError>> {
        Box::pin(async { Err(Self::error()) })
    }

    fn disconnect<'a>(&'a self, _id: &'a DeviceId) -> BoxFuture<'a, Result<(), HalError>> {
        Box::pin(async { Err(Self::error()) })
    }

    fn start_notifications<'a>(
        &'a self,
        _id: &'a DeviceId,
        _service: Uuid,
        _characteristic: Uuid,
        _on_value: NotificationHandler,
    ) -> BoxFuture<'a, Result<(), HalError>> {
        Box::pin(async { Err(Self::error()) })
    }

    fn stop_notifications<'a>(
        &'a self,
        _id: &'a DeviceId,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> BoxFuture<'a, Result<(), HalError>> {
        Box::pin(async { Err(Self::error()) })
    }
}

/// Decode a notification payload into a raw signal sample.
///
/// The peripheral sends ASCII decimal text, e.g. `"1234\r\n"`. Surrounding
/// whitespace is ignored and trailing garbage after the digits is cut off.
/// Returns `None` for empty, non-numeric, negative or overflowing payloads.
pub fn parse_sample(payload: &[u8]) -> Option<u32> {
    let text = std::str::from_utf8(payload).ok()?.trim();
    let digits = text.strip_prefix('+').unwrap_or(text);

    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }

    digits[..end].parse().ok()
}
