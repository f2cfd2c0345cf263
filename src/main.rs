//! Stereo Depth CLI
//!
//! Capture calibration photos, calibrate, and run live or tunable depth
//! maps from a side-by-side stereo camera. Views are written as PNG
//! snapshots; press Ctrl-C to stop a live loop.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stereo_depth::{
    calibration::{
        CalibrationError, CalibrationResult, CalibrationStore, OpenCvCalibrator, PhotoSet,
    },
    capture::{
        ConfigError, FileConfig, MockStereoSource, SessionError, StereoCameraSession, VideoSource,
    },
    depth::{DepthMapEngine, ParameterError, ParameterStore},
    live::{self, CaptureTiming, FileControlPanel, LiveError, LoopControl, SnapshotSink},
    metrics::{MetricsError, MetricsRegistry},
};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "stereo-depth", about = "Stereo camera calibration and live depth maps")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use the synthetic stereo source instead of a camera
    #[arg(long, global = true)]
    mock: bool,

    /// Camera index, overriding the configuration
    #[arg(long, global = true)]
    source: Option<u32>,

    /// Stop live loops after this many frames
    #[arg(long, global = true)]
    frames: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the raw combined frames as snapshots
    Preview,
    /// Capture numbered calibration photo pairs
    Capture {
        /// Number of pairs, overriding the configuration
        #[arg(long)]
        count: Option<u32>,
    },
    /// Calibrate from the captured photo pairs
    Calibrate {
        /// Write a pass-through calibration for an already rectified rig
        #[arg(long)]
        identity: bool,
    },
    /// Live depth map with parameters read from the control file
    Tune,
    /// Live depth map with fixed parameters
    Depth {
        /// Start from the saved settings file
        #[arg(long)]
        load_settings: bool,
    },
}

#[derive(Debug, Error)]
enum AppError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("camera error: {0}")]
    Session(#[from] SessionError),
    #[error(transparent)]
    Live(#[from] LiveError),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error("settings error: {0}")]
    Parameter(#[from] ParameterError),
    #[error("metrics error: {0}")]
    Metrics(#[from] MetricsError),
    #[error("failed to install Ctrl-C handler: {0}")]
    Signal(#[from] ctrlc::Error),
    #[cfg(not(feature = "camera"))]
    #[error("built without camera support; rebuild with --features camera or pass --mock")]
    NoCamera,
}

fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    info!("Stereo Depth v{}", stereo_depth::VERSION);

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), AppError> {
    let mut config = match &cli.config {
        Some(path) => FileConfig::from_file(path)?,
        None => FileConfig::default(),
    };
    if let Some(id) = cli.source {
        config.capture.source_id = id;
    }

    if let Commands::Calibrate { identity } = cli.command {
        return calibrate(&config, identity);
    }

    let quit = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&quit);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })?;

    let registry = Arc::new(MetricsRegistry::new()?);
    serve_metrics(&config, &registry);

    let mut control = LoopControl::new(quit).with_metrics(Arc::clone(&registry));
    if let Some(frames) = cli.frames {
        control = control.with_limit(frames);
    }

    if cli.mock {
        return run_live(MockStereoSource::new(), &cli.command, &config, &control);
    }
    #[cfg(feature = "camera")]
    {
        run_live(
            stereo_depth::capture::NokhwaSource::new(),
            &cli.command,
            &config,
            &control,
        )
    }
    #[cfg(not(feature = "camera"))]
    {
        Err(AppError::NoCamera)
    }
}

#[cfg(feature = "metrics")]
fn serve_metrics(config: &FileConfig, registry: &Arc<MetricsRegistry>) {
    use stereo_depth::metrics::{MetricsServer, MetricsServerConfig};

    if config.output.metrics_port == 0 {
        return;
    }
    let server = MetricsServer::new(
        MetricsServerConfig::with_port(config.output.metrics_port),
        Arc::clone(registry),
    );
    if let Err(e) = server.spawn() {
        warn!(error = %e, "Metrics server not started");
    }
}

#[cfg(not(feature = "metrics"))]
fn serve_metrics(_config: &FileConfig, _registry: &Arc<MetricsRegistry>) {}

fn calibrate(config: &FileConfig, identity: bool) -> Result<(), AppError> {
    if identity {
        let result =
            CalibrationResult::identity(config.capture.eye_width(), config.capture.height);
        let path = CalibrationStore::new(&config.calibration.result_dir).save(&result)?;
        info!(path = %path.display(), "Pass-through calibration written");
        return Ok(());
    }

    let backend = OpenCvCalibrator::new();
    let report = live::calibrate(&config.calibration, &backend, &backend)?;
    for skipped in &report.skipped {
        warn!(index = skipped.index, reason = %skipped.reason, "Pair skipped");
    }
    info!(
        used = report.used.len(),
        path = %report.result_path.display(),
        "Calibration saved"
    );
    Ok(())
}

fn run_live<S: VideoSource + 'static>(
    source: S,
    command: &Commands,
    config: &FileConfig,
    control: &LoopControl,
) -> Result<(), AppError> {
    let mut session = StereoCameraSession::open(source, config.capture.clone())?;
    let mut sink = SnapshotSink::new(
        &config.output.snapshot_dir,
        Duration::from_millis(config.output.snapshot_interval_ms),
    )?;
    let store = CalibrationStore::new(&config.calibration.result_dir);

    let outcome = match command {
        Commands::Preview => live::run_preview(&mut session, &mut sink, control).map(|s| s.frames),
        Commands::Capture { count } => {
            let photos = PhotoSet::new(
                &config.calibration.photos_dir,
                count.unwrap_or(config.calibration.photos_count),
            );
            let timing =
                CaptureTiming::from_secs(config.output.countdown_secs, config.output.delay_secs);
            live::capture_pictures(&mut session, &photos, timing, &mut sink, control)
                .map(u64::from)
        }
        Commands::Tune => {
            let mut params = ParameterStore::default();
            let controls = &config.depth.controls_path;
            if !controls.exists() {
                FileControlPanel::write_template(controls, params.raw())?;
                info!(path = %controls.display(), "Control file created");
            }
            let mut panel = FileControlPanel::new(controls);
            live::run_tuning(
                &mut session,
                &store,
                &mut params,
                &config.depth.settings_path,
                &mut panel,
                &mut DepthMapEngine::new(),
                &mut sink,
                control,
            )
            .map(|s| s.frames)
        }
        Commands::Depth { load_settings } => {
            let mut params = ParameterStore::default();
            if *load_settings || config.depth.load_settings_on_start {
                params.load(&config.depth.settings_path)?;
                params.refresh();
            }
            live::run_depth(
                &mut session,
                &store,
                &mut DepthMapEngine::new(),
                params.matcher_parameters(),
                &mut sink,
                control,
            )
            .map(|s| s.frames)
        }
        Commands::Calibrate { .. } => Ok(0),
    };

    session.release();
    let frames = outcome?;
    info!(frames, snapshots = sink.written(), "Done");
    Ok(())
}
