//! Thattia-PI Detector Monitor
//!
//! Headless entry point: connects to the detector head (or falls back to the
//! demo walk), logs display frames and accepts intents on stdin.

use anyhow::Result;
use std::sync::Arc;
use thattia_hal::{rms_level, AudioFormat, BleAdapter};
use thattia_sensors::{DetectorSession, Frame, Intent, SessionConfig};
use tokio::io::{AsyncBufReadExt, BufReader};

mod config;

use config::AppConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    tracing::info!("╔══════════════════════════════════════════╗");
    tracing::info!("║     Thattia-PI Pulse Induction Monitor   ║");
    tracing::info!("║            Version 0.1.0                 ║");
    tracing::info!("╚══════════════════════════════════════════╝");

    // Load configuration
    let config = AppConfig::load()?;
    tracing::info!("Configuration loaded from {:?}", config.config_path);
    let session_config = config.session_config()?;

    start(session_config, &config).await
}

#[cfg(feature = "btleplug")]
async fn start(session_config: SessionConfig, config: &AppConfig) -> Result<()> {
    let adapter = thattia_hal::BtleplugAdapter::new(session_config.link.ble.clone());
    run(Arc::new(adapter), session_config, config).await
}

#[cfg(not(feature = "btleplug"))]
async fn start(session_config: SessionConfig, config: &AppConfig) -> Result<()> {
    tracing::warn!("Built without Bluetooth support, demo mode only");
    run(Arc::new(thattia_hal::UnavailableAdapter), session_config, config).await
}

async fn run<A: BleAdapter>(adapter: Arc<A>, session_config: SessionConfig, config: &AppConfig) -> Result<()> {
    let session = DetectorSession::new(adapter, session_config);
    let mut beeps = session.beeps();

    let frame = session.apply(Intent::Connect).await?;
    match session.link().last_fallback() {
        Some(reason) => tracing::info!("Running in demo mode ({})", reason),
        None => tracing::info!("Link state: {}", frame.state),
    }

    tracing::info!("Commands: connect, disconnect, sensitivity <10-100>, frequency <50-200>, calibrate, audio");
    tracing::info!("Press Ctrl+C to stop");

    let mut ticker = tokio::time::interval(config.frame_log_interval());
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let format = AudioFormat::default();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
            _ = ticker.tick() => log_frame(&session.frame()),
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match parse_command(&line) {
                    Some(intent) => match session.apply(intent).await {
                        Ok(frame) => log_frame(&frame),
                        Err(e) => tracing::warn!("{:?} rejected: {}", intent, e),
                    },
                    None if line.trim().is_empty() => {}
                    None => tracing::warn!("Unknown command: {}", line.trim()),
                },
                Ok(None) => stdin_open = false,
                Err(e) => {
                    tracing::debug!("stdin closed: {}", e);
                    stdin_open = false;
                }
            },
            Ok(beep) = beeps.recv() => {
                let samples = format.render_beep(&beep);
                tracing::debug!(
                    "Calibration beep: {} Hz, {} samples, rms {:.0}",
                    beep.frequency_hz,
                    samples.len(),
                    rms_level(&samples)
                );
            }
        }
    }

    // Cleanup
    tracing::info!("Shutting down...");
    session.apply(Intent::Disconnect).await?;
    tracing::info!("Thattia-PI shutdown complete");

    Ok(())
}

/// One stdin line to an intent
fn parse_command(line: &str) -> Option<Intent> {
    let mut words = line.split_whitespace();
    let command = words.next()?.to_ascii_lowercase();
    let mut value = || words.next().and_then(|v| v.parse::<f64>().ok());

    match command.as_str() {
        "connect" | "c" => Some(Intent::Connect),
        "disconnect" | "d" => Some(Intent::Disconnect),
        "calibrate" | "cal" => Some(Intent::Calibrate),
        "audio" | "mute" => Some(Intent::ToggleAudio),
        "sensitivity" | "s" => value().map(Intent::SetSensitivity),
        "frequency" | "f" => value().map(Intent::SetFrequency),
        _ => None,
    }
}

fn log_frame(frame: &Frame) {
    let depth = frame
        .target
        .depth_cm
        .map(|d| format!("~{:.0} cm", d))
        .unwrap_or_else(|| "-".to_string());

    tracing::info!(
        "[{}] raw {:>6.0} | {:>5.1}% | {} | {} | {} | depth {} | ground {:.0}% ({})",
        frame.state,
        frame.raw,
        frame.percentage,
        frame.target.size,
        frame.target.material,
        frame.target.metal,
        depth,
        frame.ground_stability,
        frame.ground_rating
    );
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,thattia=debug,thattia_hal=debug,thattia_sensors=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("connect"), Some(Intent::Connect));
        assert_eq!(parse_command("  CAL "), Some(Intent::Calibrate));
        assert_eq!(parse_command("s 55"), Some(Intent::SetSensitivity(55.0)));
        assert_eq!(parse_command("frequency 120.5"), Some(Intent::SetFrequency(120.5)));
        assert_eq!(parse_command("sensitivity"), None);
        assert_eq!(parse_command("sensitivity loud"), None);
        assert_eq!(parse_command(""), None);
        assert_eq!(parse_command("dance"), None);
    }
}
