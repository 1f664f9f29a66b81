//! btleplug backend for Thattia-PI HAL
//! BlueZ on Linux, CoreBluetooth on macOS, WinRT on Windows

use crate::ble::{
    BleAdapter, DeviceFilter, DeviceId, DeviceInfo, DisconnectHandler, NotificationHandler,
};
use crate::{BleConfig, HalError};
use btleplug::api::{Central, CentralEvent, CentralState, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

impl From<btleplug::Error> for HalError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::DeviceNotFound => HalError::DeviceNotFound("btleplug".to_string()),
            btleplug::Error::NotConnected => HalError::NotConnected("btleplug".to_string()),
            btleplug::Error::TimedOut(d) => HalError::Timeout(d),
            other => HalError::CommunicationError(other.to_string()),
        }
    }
}

/// Open GATT link and its background tasks
struct Link {
    peripheral: Peripheral,
    watcher: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

/// Native Bluetooth LE adapter
pub struct BtleplugAdapter {
    config: BleConfig,
    adapter: tokio::sync::Mutex<Option<Adapter>>,
    discovered: Mutex<HashMap<DeviceId, Peripheral>>,
    links: Mutex<HashMap<DeviceId, Link>>,
}

impl BtleplugAdapter {
    pub fn new(config: BleConfig) -> Self {
        Self {
            config,
            adapter: tokio::sync::Mutex::new(None),
            discovered: Mutex::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
        }
    }

    /// First platform adapter, opened lazily
    async fn adapter(&self) -> Result<Adapter, HalError> {
        let mut slot = self.adapter.lock().await;
        if let Some(adapter) = slot.as_ref() {
            return Ok(adapter.clone());
        }

        let manager = Manager::new()
            .await
            .map_err(|e| HalError::AdapterUnavailable(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| HalError::AdapterUnavailable(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| HalError::AdapterUnavailable("no Bluetooth adapter found".to_string()))?;

        if let Ok(info) = adapter.adapter_info().await {
            tracing::info!("Using Bluetooth adapter: {}", info);
        }

        *slot = Some(adapter.clone());
        Ok(adapter)
    }

    fn discovered(&self) -> MutexGuard<'_, HashMap<DeviceId, Peripheral>> {
        self.discovered.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn links(&self) -> MutexGuard<'_, HashMap<DeviceId, Link>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn linked_peripheral(&self, id: &DeviceId) -> Result<Peripheral, HalError> {
        self.links()
            .get(id)
            .map(|link| link.peripheral.clone())
            .ok_or_else(|| HalError::NotConnected(id.to_string()))
    }

    async fn find_match(
        adapter: &Adapter,
        filter: &DeviceFilter,
    ) -> Result<Option<(DeviceInfo, Peripheral)>, HalError> {
        for peripheral in adapter.peripherals().await? {
            let props = match peripheral.properties().await {
                Ok(Some(props)) => props,
                _ => continue,
            };

            let info = DeviceInfo {
                id: DeviceId::new(peripheral.id().to_string()),
                name: props.local_name,
                services: props.services,
            };

            if filter.matches(&info) {
                return Ok(Some((info, peripheral)));
            }
        }
        Ok(None)
    }

    async fn scan(&self, filter: &DeviceFilter) -> Result<DeviceInfo, HalError> {
        let adapter = self.adapter().await?;
        adapter
            .start_scan(ScanFilter {
                services: filter.services.clone(),
            })
            .await?;

        tracing::info!("Scanning for peripherals (timeout: {:?})", self.config.scan_timeout);
        let deadline = tokio::time::Instant::now() + self.config.scan_timeout;

        let found = loop {
            match Self::find_match(&adapter, filter).await {
                Ok(Some(found)) => break Ok(found),
                Ok(None) => {}
                Err(e) => break Err(e),
            }
            if tokio::time::Instant::now() >= deadline {
                break Err(HalError::Timeout(self.config.scan_timeout));
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        };

        // Every exit path above lands here
        if let Err(e) = adapter.stop_scan().await {
            tracing::debug!("Failed to stop scan: {}", e);
        }

        let (info, peripheral) = found?;
        tracing::info!("Found peripheral {} ({:?})", info.id, info.name);
        self.discovered().insert(info.id.clone(), peripheral);
        Ok(info)
    }

    async fn open(&self, id: &DeviceId, on_disconnect: DisconnectHandler) -> Result<(), HalError> {
        let peripheral = self
            .discovered()
            .get(id)
            .cloned()
            .ok_or_else(|| HalError::DeviceNotFound(id.to_string()))?;
        let adapter = self.adapter().await?;

        // Subscribe first so a drop racing the connect is already buffered
        let events = adapter.events().await?;

        // BlueZ can block forever on Device1.Connect when the peer is out of range
        tokio::time::timeout(self.config.connect_timeout, peripheral.connect())
            .await
            .map_err(|_| HalError::Timeout(self.config.connect_timeout))??;

        // BlueZ reports the connection before the GATT cache is populated
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        peripheral.discover_services().await?;

        let disconnected = events.filter_map(|event| async move {
            match event {
                CentralEvent::DeviceDisconnected(pid) => Some(pid),
                _ => None,
            }
        });
        let watcher = tokio::spawn(watch_disconnects(
            Box::pin(disconnected),
            peripheral.id(),
            id.clone(),
            on_disconnect,
        ));

        let stale = self.links().insert(
            id.clone(),
            Link {
                peripheral,
                watcher: Some(watcher),
                pump: None,
            },
        );
        // Peer-initiated drops leave the previous entry behind
        if let Some(stale) = stale {
            stale.watcher.into_iter().chain(stale.pump).for_each(|task| task.abort());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        on_value: NotificationHandler,
    ) -> Result<(), HalError> {
        let peripheral = self.linked_peripheral(id)?;

        if !peripheral.services().iter().any(|s| s.uuid == service) {
            return Err(HalError::ServiceNotFound(service));
        }
        let target = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == characteristic)
            .ok_or(HalError::CharacteristicNotFound(characteristic))?;

        peripheral.subscribe(&target).await?;
        let mut notifications = peripheral.notifications().await?;

        let pump = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == characteristic {
                    on_value(&notification.value);
                }
            }
            tracing::debug!("Notification stream for {} ended", characteristic);
        });

        match self.links().get_mut(id) {
            Some(link) => {
                if let Some(old) = link.pump.replace(pump) {
                    old.abort();
                }
                Ok(())
            }
            None => {
                pump.abort();
                Err(HalError::NotConnected(id.to_string()))
            }
        }
    }

    async fn unsubscribe(&self, id: &DeviceId, service: Uuid, characteristic: Uuid) -> Result<(), HalError> {
        let peripheral = self.linked_peripheral(id)?;

        if let Some(pump) = self.links().get_mut(id).and_then(|link| link.pump.take()) {
            pump.abort();
        }

        let target = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == characteristic)
            .ok_or(HalError::CharacteristicNotFound(characteristic))?;
        peripheral.unsubscribe(&target).await?;
        Ok(())
    }

    async fn close(&self, id: &DeviceId) -> Result<(), HalError> {
        let link = self
            .links()
            .remove(id)
            .ok_or_else(|| HalError::NotConnected(id.to_string()))?;

        if let Some(pump) = link.pump {
            pump.abort();
        }
        let result = link.peripheral.disconnect().await;
        if let Some(watcher) = link.watcher {
            watcher.abort();
        }
        result.map_err(HalError::from)
    }
}

/// Fire `on_disconnect` the first time `target` appears in `disconnected`
async fn watch_disconnects<S, I>(
    mut disconnected: S,
    target: I,
    device_id: DeviceId,
    on_disconnect: DisconnectHandler,
) where
    S: Stream<Item = I> + Unpin,
    I: PartialEq,
{
    while let Some(id) = disconnected.next().await {
        if id == target {
            tracing::info!("Peripheral {} disconnected", device_id);
            on_disconnect(&device_id);
            return;
        }
    }
    tracing::debug!("Adapter event stream for {} ended", device_id);
}

impl BleAdapter for BtleplugAdapter {
    fn name(&self) -> &str {
        "btleplug"
    }

    fn initialize(&self) -> BoxFuture<'_, Result<(), HalError>> {
        Box::pin(async move { self.adapter().await.map(|_| ()) })
    }

    fn is_enabled(&self) -> BoxFuture<'_, Result<bool, HalError>> {
        Box::pin(async move {
            let adapter = self.adapter().await?;
            Ok(matches!(adapter.adapter_state().await?, CentralState::PoweredOn))
        })
    }

    fn request_enable(&self) -> BoxFuture<'_, Result<(), HalError>> {
        Box::pin(async {
            Err(HalError::Unsupported(
                "btleplug cannot power on the radio".to_string(),
            ))
        })
    }

    fn request_device<'a>(
        &'a self,
        filter: &'a DeviceFilter,
    ) -> BoxFuture<'a, Result<DeviceInfo, HalError>> {
        Box::pin(self.scan(filter))
    }

    fn connect<'a>(
        &'a self,
        id: &'a DeviceId,
        on_disconnect: DisconnectHandler,
    ) -> BoxFuture<'a, Result<(), HalError>> {
        Box::pin(self.open(id, on_disconnect))
    }

    fn disconnect<'a>(&'a self, id: &'a DeviceId) -> BoxFuture<'a, Result<(), HalError>> {
        Box::pin(self.close(id))
    }

    fn start_notifications<'a>(
        &'a self,
        id: &'a DeviceId,
        service: Uuid,
        characteristic: Uuid,
        on_value: NotificationHandler,
    ) -> BoxFuture<'a, Result<(), HalError>> {
        Box::pin(self.subscribe(id, service, characteristic, on_value))
    }

    fn stop_notifications<'a>(
        &'a self,
        id: &'a DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> BoxFuture<'a, Result<(), HalError>> {
        Box::pin(self.unsubscribe(id, service, characteristic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_handler(fired: &Arc<AtomicUsize>) -> DisconnectHandler {
        let counter = fired.clone();
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn disconnect_queued_before_watcher_runs_is_seen() {
        let fired = Arc::new(AtomicUsize::new(0));
        // The drop was broadcast before the watcher task was first polled
        let events = futures::stream::iter(vec![3_u8, 7, 7]);

        let watcher = tokio::spawn(watch_disconnects(
            events,
            7,
            DeviceId::new("THATTIA-PI"),
            counting_handler(&fired),
        ));
        tokio_test::assert_ok!(watcher.await);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn other_peripherals_do_not_fire() {
        let fired = Arc::new(AtomicUsize::new(0));
        let events = futures::stream::iter(vec![1_u8, 2]);

        watch_disconnects(events, 9, DeviceId::new("THATTIA-PI"), counting_handler(&fired)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
