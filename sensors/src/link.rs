//! Link Manager
//!
//! Owns the single connection to the detector head and is the only writer
//! of the current raw sample. `connect()` always ends connected: when any
//! step of the Bluetooth chain fails it falls back to a synthetic random
//! walk and records why.
//!
//! Every sample source (notification handler or demo task) captures the
//! link epoch it was started under. Tearing a source down bumps the epoch,
//! so a sample that races the teardown is dropped instead of applied.

use crate::normalize::SignalScale;
use crate::{Result, SensorError};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thattia_hal::{
    parse_sample, BleAdapter, BleConfig, DeviceFilter, DeviceId, DisconnectHandler, HalError,
    NotificationHandler,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Demo walk bias. Below 0.5 the walk drifts upward.
pub const DEMO_BIAS: f64 = 0.3;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    ConnectedReal,
    ConnectedDemo,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::ConnectedReal | ConnectionState::ConnectedDemo)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::ConnectedReal => "connected",
            ConnectionState::ConnectedDemo => "demo",
        };
        f.write_str(label)
    }
}

/// Step of the connection chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkStage {
    Availability,
    Enable,
    Discovery,
    Connect,
    ServiceLookup,
    CharacteristicLookup,
    Subscribe,
    Setup,
}

/// Why `connect()` ended in demo mode
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FallbackReason {
    /// No Bluetooth capability, or the radio is off and stays off
    #[error("adapter unavailable at {stage:?}: {error}")]
    AdapterUnavailable { stage: LinkStage, error: HalError },

    /// Timeout, user cancellation, no matching peripheral
    #[error("discovery failed: {0}")]
    Discovery(HalError),

    /// GATT connect, service/characteristic lookup, subscription
    #[error("connection chain failed at {stage:?}: {error}")]
    ConnectionChain { stage: LinkStage, error: HalError },

    /// Peer dropped the link before setup completed
    #[error("peripheral disconnected during setup")]
    PeerLost,
}

impl FallbackReason {
    /// Classify a HAL failure at the given stage
    pub fn from_hal(stage: LinkStage, error: HalError) -> Self {
        match (stage, &error) {
            (LinkStage::Availability | LinkStage::Enable, _)
            | (_, HalError::AdapterUnavailable(_)) => {
                FallbackReason::AdapterUnavailable { stage, error }
            }
            (LinkStage::Discovery, _) => FallbackReason::Discovery(error),
            (_, HalError::ServiceNotFound(_)) => FallbackReason::ConnectionChain {
                stage: LinkStage::ServiceLookup,
                error,
            },
            (_, HalError::CharacteristicNotFound(_)) => FallbackReason::ConnectionChain {
                stage: LinkStage::CharacteristicLookup,
                error,
            },
            _ => FallbackReason::ConnectionChain { stage, error },
        }
    }

    pub fn stage(&self) -> LinkStage {
        match self {
            FallbackReason::AdapterUnavailable { stage, .. } => *stage,
            FallbackReason::Discovery(_) => LinkStage::Discovery,
            FallbackReason::ConnectionChain { stage, .. } => *stage,
            FallbackReason::PeerLost => LinkStage::Setup,
        }
    }
}

/// Link Manager configuration
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub ble: BleConfig,
    pub scale: SignalScale,
    pub demo_interval: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ble: BleConfig::default(),
            scale: SignalScale::default(),
            demo_interval: Duration::from_millis(100),
        }
    }
}

/// Snapshot published to subscribers on every change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkStatus {
    pub state: ConnectionState,
    pub raw: f64,
    pub device: Option<DeviceId>,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            raw: 0.0,
            device: None,
        }
    }
}

/// The one active producer of raw samples
enum SampleSource {
    Idle,
    Notifications(DeviceId),
    Demo(JoinHandle<()>),
}

impl SampleSource {
    fn describe(&self) -> String {
        match self {
            SampleSource::Idle => "idle".to_string(),
            SampleSource::Notifications(id) => format!("notifications from {}", id),
            SampleSource::Demo(_) => "demo generator".to_string(),
        }
    }
}

struct LinkInner {
    state: ConnectionState,
    raw: f64,
    device: Option<DeviceId>,
    source: SampleSource,
    epoch: u64,
    peer_lost: bool,
    last_fallback: Option<FallbackReason>,
}

impl LinkInner {
    fn status(&self) -> LinkStatus {
        LinkStatus {
            state: self.state,
            raw: self.raw,
            device: self.device.clone(),
        }
    }

    /// Install a sample source; refuses while another one is active
    fn install(&mut self, source: SampleSource) -> Result<()> {
        if !matches!(self.source, SampleSource::Idle) {
            return Err(SensorError::SourceConflict(self.source.describe()));
        }
        self.source = source;
        Ok(())
    }

    /// Detach the current source and invalidate its epoch
    fn detach(&mut self) -> SampleSource {
        self.epoch += 1;
        std::mem::replace(&mut self.source, SampleSource::Idle)
    }
}

struct Shared {
    inner: Mutex<LinkInner>,
    status: watch::Sender<LinkStatus>,
    rng: Mutex<Box<dyn RngCore + Send>>,
    scale: SignalScale,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LinkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, inner: &LinkInner) {
        self.status.send_replace(inner.status());
    }

    /// Notification handler body
    fn apply_payload(&self, epoch: u64, payload: &[u8]) {
        let Some(value) = parse_sample(payload) else {
            tracing::trace!("Dropping malformed payload {:?}", String::from_utf8_lossy(payload));
            return;
        };

        let mut inner = self.lock();
        let live = matches!(
            inner.state,
            ConnectionState::Connecting | ConnectionState::ConnectedReal
        );
        if inner.epoch != epoch || !live {
            tracing::trace!("Dropping late sample {}", value);
            return;
        }

        inner.raw = value as f64;
        self.publish(&inner);
    }

    /// Disconnect handler body
    fn peer_disconnected(&self, epoch: u64, id: &DeviceId) {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            tracing::debug!("Ignoring stale disconnect from {}", id);
            return;
        }

        match inner.state {
            ConnectionState::Connecting => {
                tracing::warn!("Peripheral {} dropped the link during setup", id);
                inner.peer_lost = true;
            }
            ConnectionState::ConnectedReal => {
                tracing::warn!("Peripheral {} disconnected", id);
                inner.detach();
                inner.state = ConnectionState::Disconnected;
                inner.raw = 0.0;
                inner.device = None;
                self.publish(&inner);
            }
            _ => {}
        }
    }

    /// One demo tick. Returns false once the task's epoch is stale.
    fn demo_step(&self, epoch: u64) -> bool {
        let mut inner = self.lock();
        if inner.epoch != epoch || !matches!(inner.source, SampleSource::Demo(_)) {
            return false;
        }

        let u: f64 = self.rng.lock().unwrap_or_else(PoisonError::into_inner).gen();
        let next = inner.raw + (u - DEMO_BIAS) * self.scale.demo_step;
        inner.raw = next.clamp(0.0, self.scale.upper_bound);
        self.publish(&inner);
        true
    }
}

/// Link Manager
pub struct LinkManager<A: BleAdapter> {
    adapter: Arc<A>,
    config: LinkConfig,
    shared: Arc<Shared>,
    op_lock: tokio::sync::Mutex<()>,
}

impl<A: BleAdapter> LinkManager<A> {
    /// Create a manager with an entropy-seeded demo generator
    pub fn new(adapter: Arc<A>, config: LinkConfig) -> Self {
        Self::with_rng(adapter, config, StdRng::from_entropy())
    }

    /// Create a manager with an explicit demo random source
    pub fn with_rng(adapter: Arc<A>, config: LinkConfig, rng: impl RngCore + Send + 'static) -> Self {
        let inner = LinkInner {
            state: ConnectionState::Disconnected,
            raw: 0.0,
            device: None,
            source: SampleSource::Idle,
            epoch: 0,
            peer_lost: false,
            last_fallback: None,
        };
        let (status, _) = watch::channel(inner.status());

        Self {
            adapter,
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                status,
                rng: Mutex::new(Box::new(rng)),
                scale: config.scale,
            }),
            config,
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn adapter(&self) -> &Arc<A> {
        &self.adapter
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Last raw sample, 0 while disconnected
    pub fn raw(&self) -> f64 {
        self.shared.lock().raw
    }

    pub fn status(&self) -> LinkStatus {
        self.shared.lock().status()
    }

    /// Receive a [`LinkStatus`] on every state change and sample
    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.shared.status.subscribe()
    }

    /// Diagnostic reason for the most recent demo fallback
    pub fn last_fallback(&self) -> Option<FallbackReason> {
        self.shared.lock().last_fallback.clone()
    }

    /// Connect to the detector head, or fall back to demo mode.
    ///
    /// No-op unless disconnected. Always settles in `ConnectedReal` or
    /// `ConnectedDemo`.
    pub async fn connect(&self) -> ConnectionState {
        {
            let inner = self.shared.lock();
            if inner.state != ConnectionState::Disconnected {
                tracing::debug!("connect() ignored while {}", inner.state);
                return inner.state;
            }
        }

        let _op = self.op_lock.lock().await;
        let epoch = {
            let mut inner = self.shared.lock();
            if inner.state != ConnectionState::Disconnected {
                return inner.state;
            }
            inner.epoch += 1;
            inner.state = ConnectionState::Connecting;
            inner.peer_lost = false;
            self.shared.publish(&inner);
            inner.epoch
        };

        tracing::info!("Connecting to detector head via {} adapter", self.adapter.name());

        match self.establish(epoch).await {
            Ok(device) => self.go_live(device).await,
            Err(reason) => self.fall_back(reason),
        }
    }

    /// Run the Bluetooth chain up to an active subscription
    async fn establish(&self, epoch: u64) -> std::result::Result<DeviceId, FallbackReason> {
        if let Err(e) = self.adapter.initialize().await {
            tracing::warn!("Bluetooth initialization failed, continuing with discovery: {}", e);
        }

        match self.adapter.is_enabled().await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!("Bluetooth is disabled, requesting enable");
                self.adapter
                    .request_enable()
                    .await
                    .map_err(|e| FallbackReason::from_hal(LinkStage::Enable, e))?;
            }
            Err(e) => return Err(FallbackReason::from_hal(LinkStage::Availability, e)),
        }

        let filter = DeviceFilter::from(&self.config.ble);
        let device = self
            .adapter
            .request_device(&filter)
            .await
            .map_err(|e| FallbackReason::from_hal(LinkStage::Discovery, e))?;
        tracing::info!(
            "Selected peripheral {} ({})",
            device.id,
            device.name.as_deref().unwrap_or("unnamed")
        );

        let weak = Arc::downgrade(&self.shared);
        let on_disconnect: DisconnectHandler = Arc::new(move |id: &DeviceId| {
            if let Some(shared) = Weak::upgrade(&weak) {
                shared.peer_disconnected(epoch, id);
            }
        });
        self.adapter
            .connect(&device.id, on_disconnect)
            .await
            .map_err(|e| FallbackReason::from_hal(LinkStage::Connect, e))?;

        let weak = Arc::downgrade(&self.shared);
        let on_value: NotificationHandler = Arc::new(move |payload: &[u8]| {
            if let Some(shared) = Weak::upgrade(&weak) {
                shared.apply_payload(epoch, payload);
            }
        });
        let subscribed = self
            .adapter
            .start_notifications(
                &device.id,
                self.config.ble.service_uuid,
                self.config.ble.characteristic_uuid,
                on_value,
            )
            .await;

        if let Err(e) = subscribed {
            // Close the half-open link before the demo walk takes over
            if let Err(close) = self.adapter.disconnect(&device.id).await {
                tracing::debug!("Closing {} after failed subscription: {}", device.id, close);
            }
            return Err(FallbackReason::from_hal(LinkStage::Subscribe, e));
        }

        Ok(device.id)
    }

    async fn go_live(&self, device: DeviceId) -> ConnectionState {
        let installed = {
            let mut inner = self.shared.lock();
            if inner.peer_lost {
                Err(FallbackReason::PeerLost)
            } else {
                match inner.install(SampleSource::Notifications(device.clone())) {
                    Ok(()) => {
                        inner.state = ConnectionState::ConnectedReal;
                        inner.device = Some(device.clone());
                        inner.last_fallback = None;
                        self.shared.publish(&inner);
                        Ok(())
                    }
                    Err(e) => {
                        tracing::error!("Refusing to start notifications: {}", e);
                        Err(FallbackReason::ConnectionChain {
                            stage: LinkStage::Setup,
                            error: HalError::CommunicationError(e.to_string()),
                        })
                    }
                }
            }
        };

        match installed {
            Ok(()) => {
                tracing::info!("Streaming signal from {}", device);
                ConnectionState::ConnectedReal
            }
            Err(reason) => {
                if let Err(e) = self.adapter.disconnect(&device).await {
                    tracing::debug!("Closing {} after aborted setup: {}", device, e);
                }
                self.fall_back(reason)
            }
        }
    }

    fn fall_back(&self, reason: FallbackReason) -> ConnectionState {
        tracing::warn!(
            stage = ?reason.stage(),
            "Bluetooth link unavailable, switching to demo mode: {}",
            reason
        );

        let mut inner = self.shared.lock();
        if !matches!(inner.source, SampleSource::Idle) {
            // Keep the live source and settle on the state it implies
            tracing::error!("Demo generator not started, {} still active", inner.source.describe());
            inner.state = match inner.source {
                SampleSource::Notifications(_) => ConnectionState::ConnectedReal,
                _ => ConnectionState::ConnectedDemo,
            };
            self.shared.publish(&inner);
            return inner.state;
        }

        // Invalidates any notification handler registered during setup
        inner.epoch += 1;
        let epoch = inner.epoch;
        inner.source = SampleSource::Demo(self.spawn_demo(epoch));

        inner.state = ConnectionState::ConnectedDemo;
        inner.device = None;
        inner.last_fallback = Some(reason);
        self.shared.publish(&inner);
        ConnectionState::ConnectedDemo
    }

    fn spawn_demo(&self, epoch: u64) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.shared);
        let period = self.config.demo_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(shared) = Weak::upgrade(&weak) else {
                    break;
                };
                if !shared.demo_step(epoch) {
                    break;
                }
            }
            tracing::trace!("Demo generator for epoch {} stopped", epoch);
        })
    }

    /// Tear down whichever source is active. Safe from any state.
    pub async fn disconnect(&self) {
        let _op = self.op_lock.lock().await;

        let source = {
            let mut inner = self.shared.lock();
            if inner.state == ConnectionState::Disconnected
                && matches!(inner.source, SampleSource::Idle)
            {
                tracing::debug!("disconnect() ignored, already disconnected");
                return;
            }

            let source = inner.detach();
            inner.state = ConnectionState::Disconnected;
            inner.raw = 0.0;
            inner.device = None;
            inner.peer_lost = false;
            self.shared.publish(&inner);
            source
        };

        match source {
            SampleSource::Demo(task) => {
                task.abort();
                tracing::info!("Demo generator stopped");
            }
            SampleSource::Notifications(device) => {
                let ble = &self.config.ble;
                if let Err(e) = self
                    .adapter
                    .stop_notifications(&device, ble.service_uuid, ble.characteristic_uuid)
                    .await
                {
                    tracing::warn!("Failed to stop notifications on {}: {}", device, e);
                }
                if let Err(e) = self.adapter.disconnect(&device).await {
                    tracing::warn!("Failed to disconnect {}: {}", device, e);
                }
                tracing::info!("Disconnected from {}", device);
            }
            SampleSource::Idle => {}
        }
    }
}

impl<A: BleAdapter> Drop for LinkManager<A> {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        match inner.detach() {
            SampleSource::Demo(task) => task.abort(),
            SampleSource::Notifications(device) => {
                tracing::debug!("Link manager dropped with {} still connected", device);
            }
            SampleSource::Idle => {}
        }
    }
}
