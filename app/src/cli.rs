//! Thattia-PI CLI Tool
//!
//! Offline access to the signal pipeline: normalize and classify readings,
//! check notification payloads, and run demo or loopback sessions.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thattia_hal::{parse_sample, BleAdapter, LoopbackAdapter, UnavailableAdapter};
use thattia_sensors::{
    classify, DetectorSession, Frame, Intent, Normalizer, SignalScale,
};

mod config;

use config::AppConfig;

#[derive(Parser)]
#[command(name = "thattia-cli")]
#[command(author = "Thattia-PI Team")]
#[command(version = "0.1.0")]
#[command(about = "Thattia-PI Pulse Induction Detector CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to the standard search paths)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a raw reading to a signal percentage
    Normalize {
        /// Raw reading
        raw: f64,

        /// Calibration offset
        #[arg(short, long, default_value_t = 0.0)]
        offset: f64,

        /// Sensitivity percentage
        #[arg(short, long, default_value_t = 80.0)]
        sensitivity: f64,

        /// Raw scale upper bound
        #[arg(long, default_value_t = 30000.0)]
        scale_max: f64,
    },

    /// Classify a reading
    Classify {
        /// Signal percentage
        percentage: f64,

        /// Raw reading
        #[arg(default_value_t = 0.0)]
        raw: f64,
    },

    /// Parse a notification payload the way the link does
    Parse {
        /// Payload text
        payload: String,
    },

    /// Run a session and print frames
    Simulate {
        /// Run time in seconds
        #[arg(short, long, default_value_t = 5)]
        seconds: u64,

        /// Feed a ramp through the loopback peripheral instead of the demo walk
        #[arg(short, long)]
        loopback: bool,

        /// Calibrate right after connecting
        #[arg(long)]
        calibrate: bool,

        /// Frame print interval in milliseconds
        #[arg(short, long, default_value_t = 500)]
        interval_ms: u64,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Generate sample configuration
    Config {
        /// Output path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Normalize { raw, offset, sensitivity, scale_max } => {
            let scale = SignalScale::new(scale_max, 0.0)?;
            let percentage = Normalizer::new(scale).normalize(raw, offset, sensitivity);
            println!("{:.2}", percentage);
        }

        Commands::Classify { percentage, raw } => {
            show_classification(percentage, raw);
        }

        Commands::Parse { payload } => match parse_sample(payload.as_bytes()) {
            Some(value) => println!("{}", value),
            None => println!("dropped (not a non-negative integer reading)"),
        },

        Commands::Simulate { seconds, loopback, calibrate, interval_ms, format } => {
            init_logging();
            let config = match cli.config {
                Some(path) => AppConfig::load_from(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => AppConfig::load()?,
            };

            let options = SimulateOptions {
                duration: Duration::from_secs(seconds),
                interval: Duration::from_millis(interval_ms.max(10)),
                calibrate,
                format,
            };

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(simulate(&config, loopback, options))?;
        }

        Commands::Config { output } => {
            generate_config(output)?;
        }
    }

    Ok(())
}

fn show_classification(percentage: f64, raw: f64) {
    let report = classify(percentage, raw);

    println!("╭──────────────────────────────────────────╮");
    println!("│ Size:      {:>29} │", report.size.to_string());
    println!("│ Material:  {:>29} │", report.material.to_string());
    println!("│ Metal:     {:>29} │", report.metal.to_string());
    println!(
        "│ Depth:     {:>29} │",
        report
            .depth_cm
            .map(|d| format!("~{:.0} cm", d))
            .unwrap_or_else(|| "-".to_string())
    );
    println!("╰──────────────────────────────────────────╯");
}

struct SimulateOptions {
    duration: Duration,
    interval: Duration,
    calibrate: bool,
    format: OutputFormat,
}

async fn simulate(config: &AppConfig, loopback: bool, options: SimulateOptions) -> Result<()> {
    let session_config = config.session_config()?;

    if loopback {
        let adapter = Arc::new(LoopbackAdapter::new("THATTIA-PI"));
        let upper = session_config.link.scale.upper_bound;
        let period = session_config.link.demo_interval;
        let session = DetectorSession::new(adapter.clone(), session_config);

        // Sawtooth ramp over the full raw scale
        let feeder = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut value = 0.0_f64;
            loop {
                ticker.tick().await;
                adapter.push(format!("{:.0}\n", value).as_bytes());
                value = (value + upper / 40.0) % upper;
            }
        });

        let result = run_session(&session, &options).await;
        feeder.abort();
        result
    } else {
        let session = DetectorSession::new(Arc::new(UnavailableAdapter), session_config);
        run_session(&session, &options).await
    }
}

async fn run_session<A: BleAdapter>(session: &DetectorSession<A>, options: &SimulateOptions) -> Result<()> {
    let frame = session.apply(Intent::Connect).await?;
    if let Some(reason) = session.link().last_fallback() {
        tracing::info!("Demo mode: {}", reason);
    }
    if options.calibrate {
        session.apply(Intent::Calibrate).await?;
    }

    if options.format == OutputFormat::Table {
        println!("Link: {}", frame.state);
        println!("╭──────────────┬─────────┬─────────┬──────────────────┬────────────────────────┬─────────┬───────────────────╮");
        println!("│ Time         │ Raw     │ Signal  │ Size             │ Material               │ Depth   │ Ground            │");
        println!("├──────────────┼─────────┼─────────┼──────────────────┼────────────────────────┼─────────┼───────────────────┤");
    }

    let deadline = tokio::time::Instant::now() + options.duration;
    let mut ticker = tokio::time::interval(options.interval);
    ticker.tick().await;

    while tokio::time::Instant::now() < deadline {
        ticker.tick().await;
        print_frame(&session.frame(), options.format)?;
    }

    if options.format == OutputFormat::Table {
        println!("╰──────────────┴─────────┴─────────┴──────────────────┴────────────────────────┴─────────┴───────────────────╯");
    }

    session.apply(Intent::Disconnect).await?;
    Ok(())
}

fn print_frame(frame: &Frame, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(frame)?);
        }
        OutputFormat::Table => {
            let time = frame.timestamp.with_timezone(&chrono::Local);
            let depth = frame
                .target
                .depth_cm
                .map(|d| format!("{:.0} cm", d))
                .unwrap_or_else(|| "-".to_string());

            println!(
                "│ {:12} │ {:>7.0} │ {:>6.1}% │ {:16} │ {:22} │ {:>7} │ {:>4.0}% {:>8}    │",
                time.format("%H:%M:%S%.3f").to_string(),
                frame.raw,
                frame.percentage,
                frame.target.size.to_string(),
                frame.target.material.to_string(),
                depth,
                frame.ground_stability,
                frame.ground_rating.to_string()
            );
        }
    }
    Ok(())
}

fn generate_config(output: Option<PathBuf>) -> Result<()> {
    let example = AppConfig::example();

    if let Some(path) = output {
        std::fs::write(&path, example)?;
        println!("Configuration written to: {:?}", path);
    } else {
        println!("{}", example);
    }

    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}
