//! Detector Session
//!
//! Wires the [`LinkManager`] to the normalizer, classifier, user parameters
//! and audio mapping. Every link status change is turned into a [`Frame`]
//! for display collaborators; user actions arrive as [`Intent`]s.

use crate::classify::{Classifier, ClassifierBands, TargetReport};
use crate::ground::{GroundStability, StabilityRating};
use crate::link::{ConnectionState, LinkConfig, LinkManager, LinkStatus};
use crate::normalize::{Calibration, Frequency, Normalizer, Sensitivity};
use crate::{Result, SensorError};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thattia_hal::{BleAdapter, Beep, Tone, ToneMapper};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// User actions accepted by the session
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Intent {
    Connect,
    Disconnect,
    SetSensitivity(f64),
    SetFrequency(f64),
    Calibrate,
    ToggleAudio,
}

/// Everything a display needs for one refresh
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    pub state: ConnectionState,
    pub raw: f64,
    pub offset: f64,
    pub percentage: f64,
    pub target: TargetReport,
    pub ground_stability: f64,
    pub ground_rating: StabilityRating,
    pub sensitivity: f64,
    pub frequency: f64,
    pub audio_enabled: bool,
    pub tone: Option<Tone>,
    pub timestamp: DateTime<Utc>,
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub link: LinkConfig,
    pub ground_interval: Duration,
    pub sensitivity: Sensitivity,
    pub frequency: Frequency,
    pub audio_enabled: bool,
    pub bands: ClassifierBands,
    pub tone: ToneMapper,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            ground_interval: Duration::from_secs(2),
            sensitivity: Sensitivity::default(),
            frequency: Frequency::default(),
            audio_enabled: true,
            bands: ClassifierBands::default(),
            tone: ToneMapper::default(),
        }
    }
}

struct Controls {
    sensitivity: Sensitivity,
    frequency: Frequency,
    calibration: Calibration,
    audio_enabled: bool,
    ground: GroundStability,
}

struct Pipeline {
    normalizer: Normalizer,
    classifier: Classifier,
    tone: ToneMapper,
    controls: Mutex<Controls>,
    link_status: watch::Receiver<LinkStatus>,
    frames: watch::Sender<Frame>,
    beeps: broadcast::Sender<Beep>,
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl Pipeline {
    fn controls(&self) -> MutexGuard<'_, Controls> {
        self.controls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn compute(&self, controls: &Controls, status: &LinkStatus) -> Frame {
        let offset = controls.calibration.offset();
        let percentage = self
            .normalizer
            .normalize(status.raw, offset, controls.sensitivity.value());

        let target = if status.state.is_connected() {
            self.classifier.classify(percentage, status.raw)
        } else {
            TargetReport::none()
        };

        Frame {
            state: status.state,
            raw: status.raw,
            offset,
            percentage,
            target,
            ground_stability: controls.ground.value(),
            ground_rating: controls.ground.rating(),
            sensitivity: controls.sensitivity.value(),
            frequency: controls.frequency.value(),
            audio_enabled: controls.audio_enabled,
            tone: self.tone.tone_for(percentage, controls.audio_enabled),
            timestamp: Utc::now(),
        }
    }

    /// Recompute from the live link status and publish.
    ///
    /// The controls lock serializes publishers, so the last frame sent
    /// always reflects the latest link status.
    fn render(&self) -> Frame {
        let controls = self.controls();
        let status = self.link_status.borrow().clone();
        let frame = self.compute(&controls, &status);
        self.frames.send_replace(frame.clone());
        frame
    }

    /// One ground tick; skipped unless the link is connected right now
    fn drift_ground(&self) -> Option<Frame> {
        let u: f64 = self.rng.lock().unwrap_or_else(PoisonError::into_inner).gen();

        let mut controls = self.controls();
        let status = self.link_status.borrow().clone();
        if !status.state.is_connected() {
            return None;
        }

        let value = controls.ground.drift(u);
        tracing::trace!("Ground stability {:.1}%", value);
        let frame = self.compute(&controls, &status);
        self.frames.send_replace(frame.clone());
        Some(frame)
    }
}

/// Owned detector session
pub struct DetectorSession<A: BleAdapter> {
    link: Arc<LinkManager<A>>,
    pipeline: Arc<Pipeline>,
    pump: JoinHandle<()>,
}

impl<A: BleAdapter> DetectorSession<A> {
    /// Create a session; must be called inside a tokio runtime
    pub fn new(adapter: Arc<A>, config: SessionConfig) -> Self {
        let link = LinkManager::new(adapter, config.link.clone());
        Self::from_parts(link, config, StdRng::from_entropy())
    }

    /// Create a session around an existing link with an explicit
    /// random source for ground drift
    pub fn from_parts(
        link: LinkManager<A>,
        config: SessionConfig,
        rng: impl RngCore + Send + 'static,
    ) -> Self {
        let link = Arc::new(link);
        let controls = Controls {
            sensitivity: config.sensitivity,
            frequency: config.frequency,
            calibration: Calibration::default(),
            audio_enabled: config.audio_enabled,
            ground: GroundStability::default(),
        };

        let normalizer = Normalizer::new(link.config().scale);
        let (frames, _) = watch::channel(Frame {
            state: ConnectionState::Disconnected,
            raw: 0.0,
            offset: 0.0,
            percentage: 0.0,
            target: TargetReport::none(),
            ground_stability: controls.ground.value(),
            ground_rating: controls.ground.rating(),
            sensitivity: controls.sensitivity.value(),
            frequency: controls.frequency.value(),
            audio_enabled: controls.audio_enabled,
            tone: None,
            timestamp: Utc::now(),
        });
        let (beeps, _) = broadcast::channel(8);

        let pipeline = Arc::new(Pipeline {
            normalizer,
            classifier: Classifier::new(config.bands),
            tone: config.tone,
            controls: Mutex::new(controls),
            link_status: link.subscribe(),
            frames,
            beeps,
            rng: Mutex::new(Box::new(rng)),
        });

        let pump = spawn_pump(&pipeline, link.subscribe(), config.ground_interval);

        Self {
            link,
            pipeline,
            pump,
        }
    }

    pub fn link(&self) -> &Arc<LinkManager<A>> {
        &self.link
    }

    /// Current frame, recomputed from the live link status
    pub fn frame(&self) -> Frame {
        self.pipeline.render()
    }

    /// Receive every published frame
    pub fn frames(&self) -> watch::Receiver<Frame> {
        self.pipeline.frames.subscribe()
    }

    /// Confirmation beeps emitted by calibration
    pub fn beeps(&self) -> broadcast::Receiver<Beep> {
        self.pipeline.beeps.subscribe()
    }

    /// Apply a user action and return the resulting frame
    pub async fn apply(&self, intent: Intent) -> Result<Frame> {
        tracing::debug!("Intent: {:?}", intent);

        match intent {
            Intent::Connect => {
                self.link.connect().await;
            }
            Intent::Disconnect => {
                self.link.disconnect().await;
            }
            Intent::SetSensitivity(value) => {
                let sensitivity = Sensitivity::new(value).ok_or_else(|| {
                    SensorError::InvalidParameter(format!("sensitivity {}", value))
                })?;
                self.pipeline.controls().sensitivity = sensitivity;
            }
            Intent::SetFrequency(value) => {
                let frequency = Frequency::new(value).ok_or_else(|| {
                    SensorError::InvalidParameter(format!("frequency {}", value))
                })?;
                self.pipeline.controls().frequency = frequency;
            }
            Intent::Calibrate => self.calibrate()?,
            Intent::ToggleAudio => {
                let mut controls = self.pipeline.controls();
                controls.audio_enabled = !controls.audio_enabled;
                tracing::info!(
                    "Audio {}",
                    if controls.audio_enabled { "enabled" } else { "muted" }
                );
            }
        }

        Ok(self.frame())
    }

    fn calibrate(&self) -> Result<()> {
        let status = self.link.status();
        if !status.state.is_connected() {
            return Err(SensorError::NotConnected(format!(
                "cannot calibrate while {}",
                status.state
            )));
        }

        let audio_enabled = {
            let mut controls = self.pipeline.controls();
            controls.calibration.calibrate(status.raw);
            controls.ground.reset();
            controls.audio_enabled
        };
        tracing::info!("Ground calibrated at raw {:.0}", status.raw);

        if audio_enabled {
            // No listener is fine
            let _ = self.pipeline.beeps.send(self.pipeline.tone.calibration_beep());
        }
        Ok(())
    }
}

impl<A: BleAdapter> Drop for DetectorSession<A> {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Recompute a frame on every link change and keep ground drift running
/// exactly while connected
fn spawn_pump(
    pipeline: &Arc<Pipeline>,
    mut status: watch::Receiver<LinkStatus>,
    ground_interval: Duration,
) -> JoinHandle<()> {
    let pipeline = Arc::downgrade(pipeline);

    tokio::spawn(async move {
        let mut ground = GroundTask(None);

        loop {
            let current = status.borrow_and_update().clone();
            let Some(pipeline) = Weak::upgrade(&pipeline) else {
                break;
            };

            match (current.state.is_connected(), ground.0.is_some()) {
                (true, false) => {
                    ground.0 = Some(spawn_ground(&pipeline, ground_interval));
                }
                (false, true) => {
                    ground.stop();
                    tracing::debug!("Ground drift stopped");
                }
                _ => {}
            }

            pipeline.render();
            drop(pipeline);

            if status.changed().await.is_err() {
                break;
            }
        }
    })
}

/// Aborts the drift task when the pump ends or is aborted
struct GroundTask(Option<JoinHandle<()>>);

impl GroundTask {
    fn stop(&mut self) {
        if let Some(task) = self.0.take() {
            task.abort();
        }
    }
}

impl Drop for GroundTask {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_ground(pipeline: &Arc<Pipeline>, period: Duration) -> JoinHandle<()> {
    let pipeline = Arc::downgrade(pipeline);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(pipeline) = Weak::upgrade(&pipeline) else {
                break;
            };

            pipeline.drift_ground();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;
    use thattia_hal::{LoopbackAdapter, UnavailableAdapter};

    fn test_config() -> SessionConfig {
        SessionConfig {
            link: LinkConfig {
                demo_interval: Duration::from_millis(10),
                ..Default::default()
            },
            ground_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn loopback_session() -> (Arc<LoopbackAdapter>, DetectorSession<LoopbackAdapter>) {
        loopback_session_with(test_config())
    }

    /// Ground ticks only when a test drives them
    fn manual_ground_session() -> (Arc<LoopbackAdapter>, DetectorSession<LoopbackAdapter>) {
        loopback_session_with(SessionConfig {
            ground_interval: Duration::from_secs(3600),
            ..test_config()
        })
    }

    fn loopback_session_with(
        config: SessionConfig,
    ) -> (Arc<LoopbackAdapter>, DetectorSession<LoopbackAdapter>) {
        let adapter = Arc::new(LoopbackAdapter::new("THATTIA-PI"));
        let link = LinkManager::with_rng(adapter.clone(), config.link.clone(), StepRng::new(0, 0));
        let session = DetectorSession::from_parts(link, config, StepRng::new(0, 0));
        (adapter, session)
    }

    #[tokio::test]
    async fn initial_frame_is_silent() {
        let (_, session) = loopback_session();
        let frame = session.frame();

        assert_eq!(frame.state, ConnectionState::Disconnected);
        assert_eq!(frame.percentage, 0.0);
        assert_eq!(frame.sensitivity, 80.0);
        assert_eq!(frame.frequency, 100.0);
        assert!(frame.audio_enabled);
        assert_eq!(frame.tone, None);
        assert!(!frame.target.is_target());
        assert_eq!(frame.ground_rating, StabilityRating::Stable);
    }

    #[tokio::test]
    async fn frames_follow_samples() {
        let (adapter, session) = loopback_session();
        session.apply(Intent::Connect).await.unwrap();
        session.apply(Intent::SetSensitivity(100.0)).await.unwrap();

        adapter.push(b"15000");
        let frame = session.frame();
        assert_eq!(frame.state, ConnectionState::ConnectedReal);
        assert_eq!(frame.percentage, 50.0);
        assert_eq!(frame.target.depth_cm, Some(18.0));
        assert_eq!(frame.tone.map(|t| t.frequency_hz), Some(700.0));
    }

    #[tokio::test]
    async fn calibrate_requires_connection() {
        let (_, session) = loopback_session();
        let err = session.apply(Intent::Calibrate).await.unwrap_err();
        assert!(matches!(err, SensorError::NotConnected(_)));
    }

    #[tokio::test]
    async fn calibrate_zeroes_and_beeps() {
        let (adapter, session) = loopback_session();
        let mut beeps = session.beeps();
        session.apply(Intent::Connect).await.unwrap();
        adapter.push(b"12000");

        let frame = session.apply(Intent::Calibrate).await.unwrap();
        assert_eq!(frame.offset, 12000.0);
        assert_eq!(frame.percentage, 0.0);
        assert_eq!(frame.ground_stability, 100.0);

        let beep = beeps.try_recv().unwrap();
        assert_eq!(beep.frequency_hz, 800.0);
    }

    #[tokio::test]
    async fn parameters_are_bounded() {
        let (_, session) = loopback_session();

        let frame = session.apply(Intent::SetSensitivity(500.0)).await.unwrap();
        assert_eq!(frame.sensitivity, 100.0);
        let frame = session.apply(Intent::SetFrequency(10.0)).await.unwrap();
        assert_eq!(frame.frequency, 50.0);

        assert!(session.apply(Intent::SetSensitivity(f64::NAN)).await.is_err());
        assert_eq!(session.frame().sensitivity, 100.0);
    }

    #[tokio::test]
    async fn toggle_audio_silences_tone() {
        let (adapter, session) = loopback_session();
        session.apply(Intent::Connect).await.unwrap();
        adapter.push(b"20000");
        assert!(session.frame().tone.is_some());

        let frame = session.apply(Intent::ToggleAudio).await.unwrap();
        assert!(!frame.audio_enabled);
        assert_eq!(frame.tone, None);
    }

    #[tokio::test]
    async fn ground_drifts_only_while_connected() {
        // StepRng(0) always draws 0.0, so every tick lowers stability by 5
        let (_, session) = loopback_session();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.frame().ground_stability, 100.0);

        session.apply(Intent::Connect).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        let drifted = session.frame().ground_stability;
        assert!(drifted < 100.0);

        session.apply(Intent::Disconnect).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let settled = session.frame().ground_stability;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.frame().ground_stability, settled);
    }

    #[tokio::test]
    async fn ground_tick_after_disconnect_is_dropped() {
        let (_, session) = manual_ground_session();
        session.apply(Intent::Connect).await.unwrap();
        let frame = session.pipeline.drift_ground().unwrap();
        assert_eq!(frame.state, ConnectionState::ConnectedReal);
        assert_eq!(frame.ground_stability, 95.0);

        session.apply(Intent::Disconnect).await.unwrap();
        let settled = session.frame();
        assert!(session.pipeline.drift_ground().is_none());

        let published = session.frames().borrow().clone();
        assert_eq!(published.state, ConnectionState::Disconnected);
        assert_eq!(published.ground_stability, settled.ground_stability);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stalled_ground_tick_cannot_republish_connected() {
        let config = test_config();
        let link = LinkManager::with_rng(
            Arc::new(UnavailableAdapter),
            config.link.clone(),
            StepRng::new(u64::MAX / 10 * 9, 0),
        );
        let session = DetectorSession::from_parts(link, config, StepRng::new(0, 0));
        session.apply(Intent::Connect).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        // Park the next ground tick on the random source
        let stall = session.pipeline.rng.lock().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        session.link().disconnect().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let settled = session.frames().borrow().clone();
        assert_eq!(settled.state, ConnectionState::Disconnected);

        drop(stall);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let published = session.frames().borrow().clone();
        assert_eq!(published.state, ConnectionState::Disconnected);
        assert_eq!(published.raw, 0.0);
        assert_eq!(published.ground_stability, settled.ground_stability);
    }

    #[tokio::test]
    async fn frames_carry_ground_rating() {
        let (_, session) = manual_ground_session();
        session.apply(Intent::Connect).await.unwrap();

        // 100 -> 65 after seven ticks at -5
        for _ in 0..7 {
            session.pipeline.drift_ground();
        }
        let frame = session.frame();
        assert_eq!(frame.ground_stability, 65.0);
        assert_eq!(frame.ground_rating, StabilityRating::Moderate);

        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["ground_rating"], "Moderate");
    }

    #[tokio::test]
    async fn published_frames_track_demo_mode() {
        let config = test_config();
        let link = LinkManager::with_rng(
            Arc::new(UnavailableAdapter),
            config.link.clone(),
            StepRng::new(u64::MAX / 10 * 9, 0),
        );
        let session = DetectorSession::from_parts(link, config, StepRng::new(0, 0));
        let mut frames = session.frames();

        session.apply(Intent::Connect).await.unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                frames.changed().await.unwrap();
                let frame = frames.borrow_and_update().clone();
                if frame.raw > 0.0 {
                    break frame;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(frame.state, ConnectionState::ConnectedDemo);
        assert!(frame.percentage > 0.0);
    }
}
