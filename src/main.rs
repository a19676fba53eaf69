//! Sync-cam-capture binary: record a hardware-triggered camera pair.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sync_cam_capture::mock::MockCamera;
use sync_cam_capture::{
    open_sink, output_paths, AcquisitionSession, Camera, CaptureSummary, RigConfig, SessionPlan,
    StopSignal, V4l2Camera,
};

/// Record synchronized left/right video from a primary/secondary camera pair
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Rig configuration file (TOML)
    #[arg(short, long, default_value = "config/camera_config.toml")]
    config: PathBuf,

    /// Base output name; overrides `session.output`
    #[arg(short, long)]
    output: Option<String>,

    /// Recording length in seconds; overrides `session.duration_seconds`
    #[arg(short, long)]
    duration: Option<f64>,

    /// Use the simulated rig instead of V4L2 devices
    #[arg(long)]
    simulate: bool,

    /// Append log output to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = init_logging(cli.log_file.as_deref()).and_then(|()| run(&cli)) {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.init(),
    }
    Ok(())
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = RigConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    if let Some(output) = &cli.output {
        config.session.output.clone_from(output);
    }
    if let Some(duration) = cli.duration {
        config.session.duration_seconds = duration;
    }
    config.validate().context("invalid configuration")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        simulate = cli.simulate,
        "sync-cam-capture starting"
    );

    let plan = SessionPlan::from_config(&config);
    let summary = if cli.simulate {
        let fps = config.acquisition_settings.fps;
        let width = config.camera_settings.width;
        let height = config.camera_settings.height;
        record(
            &config,
            plan,
            MockCamera::new("SIM-PRIMARY").with_resolution(width, height),
            MockCamera::new("SIM-SECONDARY").with_resolution(width, height),
        )
        .with_context(|| format!("simulated recording at {fps} fps failed"))?
    } else {
        let primary = V4l2Camera::open(config.devices.primary)
            .with_context(|| format!("failed to open primary device {}", config.devices.primary))?;
        let secondary = V4l2Camera::open(config.devices.secondary).with_context(|| {
            format!("failed to open secondary device {}", config.devices.secondary)
        })?;
        record(&config, plan, primary, secondary)?
    };

    print_summary(&summary);
    Ok(())
}

fn record<P, S>(config: &RigConfig, plan: SessionPlan, primary: P, secondary: S) -> Result<CaptureSummary>
where
    P: Camera + Send,
    S: Camera + Send,
{
    let (left_path, right_path) = output_paths(&config.session.output);
    let spec = config.sink_spec().context("invalid configuration")?;
    let mut left = open_sink(&left_path, spec)
        .with_context(|| format!("failed to open {}", left_path.display()))?;
    let mut right = open_sink(&right_path, spec)
        .with_context(|| format!("failed to open {}", right_path.display()))?;

    let mut session = AcquisitionSession::new(primary, secondary, plan)?;
    ctrlc::set_handler(interrupt_handler(session.stop_signal()))
        .context("failed to install the Ctrl-C handler")?;
    let summary = session.run(&mut left, &mut right)?;
    info!(
        left = %left_path.display(),
        right = %right_path.display(),
        "recording complete"
    );
    Ok(summary)
}

/// Ctrl-C stops the capture loop; teardown and sink finalization still run.
fn interrupt_handler(stop: StopSignal) -> impl FnMut() + Send + 'static {
    move || {
        info!("interrupt received, stopping capture");
        stop.trigger();
    }
}

fn print_summary(summary: &CaptureSummary) {
    println!(
        "Captured {} cycles in {:.2?}{}",
        summary.cycles,
        summary.elapsed,
        if summary.cancelled { " (stopped early)" } else { "" }
    );
    for (name, stats) in [("left", &summary.left), ("right", &summary.right)] {
        println!(
            "  {name}: {} written, {} incomplete, {} timeouts, {} dropped",
            stats.written, stats.incomplete, stats.timeouts, stats.dropped
        );
    }
    if summary.elapsed > Duration::ZERO {
        #[allow(clippy::cast_precision_loss)]
        let rate = summary.cycles as f64 / summary.elapsed.as_secs_f64();
        println!("  effective rate: {rate:.1} cycles/s");
    }
}
