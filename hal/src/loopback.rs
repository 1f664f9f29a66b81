//! Loopback BLE adapter
//!
//! An in-memory peripheral that speaks the [`BleAdapter`] contract without a
//! radio. Payloads are injected with [`LoopbackAdapter::push`] and a
//! peer-initiated disconnect with [`LoopbackAdapter::drop_link`]. Any stage of
//! the connection chain can be made to fail with [`FailPoint`], and
//! [`FailPoint::DropDuringSetup`] makes the peer vanish right after the
//! subscription is armed.
//!
//! Like a real stack, an explicit `disconnect` also fires the disconnect
//! handler registered at connect time.

use crate::ble::{
    BleAdapter, DeviceFilter, DeviceId, DeviceInfo, DisconnectHandler, NotificationHandler,
    SIGNAL_CHARACTERISTIC_UUID, SIGNAL_SERVICE_UUID,
};
use crate::HalError;
use futures::future::BoxFuture;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Stage at which the loopback peripheral refuses to cooperate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    Initialize,
    Enable,
    Discovery,
    Connect,
    ServiceLookup,
    CharacteristicLookup,
    Subscribe,
    /// Subscription succeeds, then the peer drops the link
    DropDuringSetup,
}

struct LoopbackState {
    powered: bool,
    fail_at: Option<FailPoint>,
    connected: bool,
    on_disconnect: Option<DisconnectHandler>,
    on_value: Option<NotificationHandler>,
    calls: Vec<&'static str>,
}

/// In-memory BLE peripheral
pub struct LoopbackAdapter {
    device: DeviceInfo,
    service: Uuid,
    characteristic: Uuid,
    state: Mutex<LoopbackState>,
}

impl LoopbackAdapter {
    /// Create a powered-on loopback exposing the signal service
    pub fn new(name: &str) -> Self {
        Self {
            device: DeviceInfo {
                id: DeviceId::new(format!("LOOPBACK-{}", name)),
                name: Some(name.to_string()),
                services: vec![SIGNAL_SERVICE_UUID],
            },
            service: SIGNAL_SERVICE_UUID,
            characteristic: SIGNAL_CHARACTERISTIC_UUID,
            state: Mutex::new(LoopbackState {
                powered: true,
                fail_at: None,
                connected: false,
                on_disconnect: None,
                on_value: None,
                calls: Vec::new(),
            }),
        }
    }

    /// Fail at the given stage
    pub fn with_fail_point(self, fail_at: FailPoint) -> Self {
        self.lock().fail_at = Some(fail_at);
        self
    }

    /// Start with the radio powered off
    pub fn powered_off(self) -> Self {
        self.lock().powered = false;
        self
    }

    /// Descriptor of the simulated peripheral
    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    /// Deliver a notification payload. Returns false if nobody is subscribed.
    pub fn push(&self, payload: &[u8]) -> bool {
        let handler = self.lock().on_value.clone();
        match handler {
            Some(on_value) => {
                on_value(payload);
                true
            }
            None => false,
        }
    }

    /// Simulate the peer dropping the link
    pub fn drop_link(&self) {
        let handler = {
            let mut state = self.lock();
            state.connected = false;
            state.on_value = None;
            state.on_disconnect.take()
        };

        if let Some(on_disconnect) = handler {
            tracing::debug!("Loopback peer {} dropped the link", self.device.id);
            on_disconnect(&self.device.id);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn is_subscribed(&self) -> bool {
        self.lock().on_value.is_some()
    }

    /// Adapter operations invoked so far, in order
    pub fn calls(&self) -> Vec<&'static str> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a call and report whether it is scripted to fail
    fn enter(&self, call: &'static str, point: Option<FailPoint>) -> bool {
        let mut state = self.lock();
        state.calls.push(call);
        point.is_some() && state.fail_at == point
    }
}

impl BleAdapter for LoopbackAdapter {
    fn name(&self) -> &str {
        "loopback"
    }

    fn initialize(&self) -> BoxFuture<'_, Result<(), HalError>> {
        Box::pin(async move {
            if self.enter("initialize", Some(FailPoint::Initialize)) {
                return Err(HalError::AdapterUnavailable("loopback init refused".to_string()));
            }
            Ok(())
        })
    }

    fn is_enabled(&self) -> BoxFuture<'_, Result<bool, HalError>> {
        Box::pin(async move {
            self.enter("is_enabled", None);
            Ok(self.lock().powered)
        })
    }

    fn request_enable(&self) -> BoxFuture<'_, Result<(), HalError>> {
        Box::pin(async move {
            if self.enter("request_enable", Some(FailPoint::Enable)) {
                return Err(HalError::AdapterDisabled);
            }
            self.lock().powered = true;
            Ok(())
        })
    }

    fn request_device<'a>(
        &'a self,
        filter: &'a DeviceFilter,
    ) -> BoxFuture<'a, Result<DeviceInfo, HalError>> {
        Box::pin(async move {
            if self.enter("request_device", Some(FailPoint::Discovery)) {
                return Err(HalError::Cancelled);
            }
            if !self.lock().powered {
                return Err(HalError::AdapterDisabled);
            }
            if !filter.matches(&self.device) {
                return Err(HalError::NoDevice);
            }
            Ok(self.device.clone())
        })
    }

    fn connect<'a>(
        &'a self,
        id: &'a DeviceId,
        on_disconnect: DisconnectHandler,
    ) -> BoxFuture<'a, Result<(), HalError>> {
        Box::pin(async move {
            if self.enter("connect", Some(FailPoint::Connect)) {
                return Err(HalError::CommunicationError("GATT connect refused".to_string()));
            }
            if *id != self.device.id {
                return Err(HalError::DeviceNotFound(id.to_string()));
            }

            let mut state = self.lock();
            state.connected = true;
            state.on_disconnect = Some(on_disconnect);
            Ok(())
        })
    }

    fn disconnect<'a>(&'a self, id: &'a DeviceId) -> BoxFuture<'a, Result<(), HalError>> {
        Box::pin(async move {
            self.enter("disconnect", None);
            if *id != self.device.id {
                return Err(HalError::DeviceNotFound(id.to_string()));
            }

            let handler = {
                let mut state = self.lock();
                if !state.connected {
                    return Err(HalError::NotConnected(id.to_string()));
                }
                state.connected = false;
                state.on_value = None;
                state.on_disconnect.take()
            };

            if let Some(on_disconnect) = handler {
                on_disconnect(id);
            }
            Ok(())
        })
    }

    fn start_notifications<'a>(
        &'a self,
        id: &'a DeviceId,
        service: Uuid,
        characteristic: Uuid,
        on_value: NotificationHandler,
    ) -> BoxFuture<'a, Result<(), HalError>> {
        Box::pin(async move {
            self.enter("start_notifications", None);
            let fail_at = {
                let state = self.lock();
                if !state.connected || *id != self.device.id {
                    return Err(HalError::NotConnected(id.to_string()));
                }
                state.fail_at
            };

            if service != self.service || fail_at == Some(FailPoint::ServiceLookup) {
                return Err(HalError::ServiceNotFound(service));
            }
            if characteristic != self.characteristic
                || fail_at == Some(FailPoint::CharacteristicLookup)
            {
                return Err(HalError::CharacteristicNotFound(characteristic));
            }
            if fail_at == Some(FailPoint::Subscribe) {
                return Err(HalError::CommunicationError("CCCD write rejected".to_string()));
            }

            self.lock().on_value = Some(on_value);
            if fail_at == Some(FailPoint::DropDuringSetup) {
                self.drop_link();
            }
            Ok(())
        })
    }

    fn stop_notifications<'a>(
        &'a self,
        id: &'a DeviceId,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> BoxFuture<'a, Result<(), HalError>> {
        Box::pin(async move {
            self.enter("stop_notifications", None);
            let mut state = self.lock();
            if !state.connected || *id != self.device.id {
                return Err(HalError::NotConnected(id.to_string()));
            }
            state.on_value = None;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn counting_handler(fired: &Arc<AtomicUsize>) -> DisconnectHandler {
        let counter = fired.clone();
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    async fn subscribe(adapter: &LoopbackAdapter, id: &DeviceId, seen: Arc<AtomicU32>) -> Result<(), HalError> {
        adapter
            .start_notifications(
                id,
                SIGNAL_SERVICE_UUID,
                SIGNAL_CHARACTERISTIC_UUID,
                Arc::new(move |payload| {
                    if let Some(v) = crate::parse_sample(payload) {
                        seen.store(v, Ordering::SeqCst);
                    }
                }),
            )
            .await
    }

    #[tokio::test]
    async fn delivers_pushed_payloads() {
        let adapter = LoopbackAdapter::new("THATTIA-PI");
        let seen = Arc::new(AtomicU32::new(0));

        assert!(!adapter.push(b"10"));
        let filter = DeviceFilter::service(SIGNAL_SERVICE_UUID);
        let device = assert_ok!(adapter.request_device(&filter).await);
        assert_ok!(adapter.connect(&device.id, Arc::new(|_| {})).await);
        assert_ok!(subscribe(&adapter, &device.id, seen.clone()).await);

        assert!(adapter.push(b"2048\n"));
        assert_eq!(seen.load(Ordering::SeqCst), 2048);
        assert_eq!(
            adapter.calls(),
            vec!["request_device", "connect", "start_notifications"]
        );
    }

    #[tokio::test]
    async fn drop_link_fires_disconnect_handler() {
        let adapter = LoopbackAdapter::new("THATTIA-PI");
        let fired = Arc::new(AtomicUsize::new(0));
        let id = adapter.device().id.clone();

        assert_ok!(adapter.connect(&id, counting_handler(&fired)).await);

        adapter.drop_link();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!adapter.is_connected());

        adapter.drop_link();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn scripted_failures_surface_as_typed_errors() {
        let adapter = LoopbackAdapter::new("sensor").with_fail_point(FailPoint::Connect);
        let id = adapter.device().id.clone();
        let err = assert_err!(adapter.connect(&id, Arc::new(|_| {})).await);
        assert!(matches!(err, HalError::CommunicationError(_)));

        let adapter = LoopbackAdapter::new("sensor").with_fail_point(FailPoint::CharacteristicLookup);
        assert_ok!(adapter.connect(&id, Arc::new(|_| {})).await);
        let err = assert_err!(subscribe(&adapter, &id, Arc::new(AtomicU32::new(0))).await);
        assert_eq!(err, HalError::CharacteristicNotFound(SIGNAL_CHARACTERISTIC_UUID));
    }

    #[tokio::test]
    async fn peer_can_vanish_after_subscribing() {
        let adapter = LoopbackAdapter::new("THATTIA-PI").with_fail_point(FailPoint::DropDuringSetup);
        let id = adapter.device().id.clone();
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicU32::new(0));

        assert_ok!(adapter.connect(&id, counting_handler(&fired)).await);
        assert_ok!(subscribe(&adapter, &id, seen.clone()).await);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!adapter.is_connected());
        assert!(!adapter.push(b"100"));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn powered_off_radio_can_be_enabled() {
        let adapter = LoopbackAdapter::new("sensor").powered_off();
        assert!(!assert_ok!(adapter.is_enabled().await));

        let filter = DeviceFilter::service(SIGNAL_SERVICE_UUID);
        let err = assert_err!(adapter.request_device(&filter).await);
        assert_eq!(err, HalError::AdapterDisabled);

        assert_ok!(adapter.request_enable().await);
        assert!(assert_ok!(adapter.is_enabled().await));
    }
}
