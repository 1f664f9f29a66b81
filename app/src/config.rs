// Application Configuration

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thattia_hal::{BleConfig, ToneMapper, SIGNAL_CHARACTERISTIC_UUID, SIGNAL_SERVICE_UUID};
use thattia_sensors::{
    ClassifierBands, Frequency, LinkConfig, Sensitivity, SessionConfig, SignalScale,
};
use uuid::Uuid;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Initial sensitivity, 10 - 100 %
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f64,

    /// Initial pulse frequency, 50 - 200 Hz (display only)
    #[serde(default = "default_frequency")]
    pub frequency: f64,

    /// Audio feedback on start
    #[serde(default = "default_audio")]
    pub audio_enabled: bool,

    /// Largest raw value the detector head emits
    #[serde(default = "default_raw_upper_bound")]
    pub raw_upper_bound: f64,

    /// Demo random-walk step
    #[serde(default = "default_demo_step")]
    pub demo_step: f64,

    /// Demo sample period in milliseconds
    #[serde(default = "default_demo_interval")]
    pub demo_interval_ms: u64,

    /// Ground stability drift period in milliseconds
    #[serde(default = "default_ground_interval")]
    pub ground_interval_ms: u64,

    /// BLE scan timeout in seconds
    #[serde(default = "default_timeout")]
    pub scan_timeout_secs: u64,

    /// GATT connect timeout in seconds
    #[serde(default = "default_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_service_uuid")]
    pub service_uuid: Uuid,

    #[serde(default = "default_characteristic_uuid")]
    pub characteristic_uuid: Uuid,

    /// Only accept peripherals whose name starts with this
    #[serde(default)]
    pub device_name_prefix: Option<String>,

    /// How often the monitor logs a frame, in milliseconds
    #[serde(default = "default_frame_log_interval")]
    pub frame_log_interval_ms: u64,

    /// Path to config file (for reference)
    #[serde(skip)]
    pub config_path: PathBuf,
}

fn default_sensitivity() -> f64 { 80.0 }
fn default_frequency() -> f64 { 100.0 }
fn default_audio() -> bool { true }
fn default_raw_upper_bound() -> f64 { SignalScale::PULSE_30K.upper_bound }
fn default_demo_step() -> f64 { SignalScale::PULSE_30K.demo_step }
fn default_demo_interval() -> u64 { 100 }
fn default_ground_interval() -> u64 { 2000 }
fn default_timeout() -> u64 { 10 }
fn default_service_uuid() -> Uuid { SIGNAL_SERVICE_UUID }
fn default_characteristic_uuid() -> Uuid { SIGNAL_CHARACTERISTIC_UUID }
fn default_frame_log_interval() -> u64 { 1000 }

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sensitivity: default_sensitivity(),
            frequency: default_frequency(),
            audio_enabled: default_audio(),
            raw_upper_bound: default_raw_upper_bound(),
            demo_step: default_demo_step(),
            demo_interval_ms: default_demo_interval(),
            ground_interval_ms: default_ground_interval(),
            scan_timeout_secs: default_timeout(),
            connect_timeout_secs: default_timeout(),
            service_uuid: default_service_uuid(),
            characteristic_uuid: default_characteristic_uuid(),
            device_name_prefix: None,
            frame_log_interval_ms: default_frame_log_interval(),
            config_path: PathBuf::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from standard paths
    pub fn load() -> Result<Self> {
        let config_paths = [
            PathBuf::from("/etc/thattia/config.toml"),
            dirs::config_dir()
                .map(|p| p.join("thattia/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("./config.toml"),
        ];

        for path in &config_paths {
            if path.is_file() {
                return Self::load_from(path);
            }
        }

        tracing::warn!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: AppConfig = toml::from_str(&content)?;
        config.config_path = path.to_path_buf();
        Ok(config)
    }

    /// Generate example configuration
    pub fn example() -> String {
        let config = Self {
            device_name_prefix: Some("THATTIA".to_string()),
            ..Default::default()
        };

        let body = toml::to_string_pretty(&config).unwrap_or_default();
        format!(
            "# Thattia-PI Configuration File\n\
             #\n\
             # Copy this file to /etc/thattia/config.toml or ~/.config/thattia/config.toml\n\n{}",
            body
        )
    }

    pub fn frame_log_interval(&self) -> Duration {
        Duration::from_millis(self.frame_log_interval_ms.max(1))
    }

    /// Validated pipeline configuration
    pub fn session_config(&self) -> Result<SessionConfig> {
        let scale = SignalScale::new(self.raw_upper_bound, self.demo_step)?;
        let sensitivity = Sensitivity::new(self.sensitivity)
            .ok_or_else(|| anyhow!("sensitivity must be a finite number"))?;
        let frequency = Frequency::new(self.frequency)
            .ok_or_else(|| anyhow!("frequency must be a finite number"))?;
        if self.demo_interval_ms == 0 || self.ground_interval_ms == 0 {
            return Err(anyhow!("timer intervals must be non-zero"));
        }

        Ok(SessionConfig {
            link: LinkConfig {
                ble: BleConfig {
                    service_uuid: self.service_uuid,
                    characteristic_uuid: self.characteristic_uuid,
                    scan_timeout: Duration::from_secs(self.scan_timeout_secs),
                    connect_timeout: Duration::from_secs(self.connect_timeout_secs),
                    name_prefix: self.device_name_prefix.clone(),
                },
                scale,
                demo_interval: Duration::from_millis(self.demo_interval_ms),
            },
            ground_interval: Duration::from_millis(self.ground_interval_ms),
            sensitivity,
            frequency,
            audio_enabled: self.audio_enabled,
            bands: ClassifierBands::default(),
            tone: ToneMapper::default(),
        })
    }
}

/// Helper for getting config directories
mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.sensitivity, 80.0);
        assert_eq!(config.service_uuid, SIGNAL_SERVICE_UUID);
        assert_eq!(config.demo_interval_ms, 100);

        let session = config.session_config().unwrap();
        assert_eq!(session.link.scale, SignalScale::PULSE_30K);
        assert_eq!(session.ground_interval, Duration::from_secs(2));
    }

    #[test]
    fn example_parses_back() {
        let example = AppConfig::example();
        let config: AppConfig = toml::from_str(&example).unwrap();
        assert_eq!(config.device_name_prefix.as_deref(), Some("THATTIA"));
    }

    #[test]
    fn rejects_bad_scale() {
        let config: AppConfig = toml::from_str("raw_upper_bound = 0.0").unwrap();
        assert!(config.session_config().is_err());
    }
}
