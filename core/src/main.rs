//! ROOMLOC: An offline processing tool for UWB/IMU indoor tag localization.
//!
//! This program replays recorded merged IMU/UWB CSV files through the
//! estimation pipelines and writes position CSVs:
//!
//! - `ekf`: the full sensor-fusion pipeline (EKF with zero-velocity updates
//!   and sequential UWB range corrections).
//! - `dr`: IMU-only dead reckoning, the drift baseline.
//! - `mlat`: UWB-only multilateration with seed chaining and held-position
//!   fallback during anchor dropout.
//! - `label`: offline stop detection and waypoint assignment, producing a
//!   ground-truth trajectory CSV for evaluating the other pipelines.
//!
//! Anchor positions default to the reference room deployment and can be
//! overridden with repeated `--anchor mac,x,y,z` flags.

use clap::{Args, Parser, Subcommand};
use log::{error, info};
use nalgebra::Vector2;
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

use roomloc::kalman::EstimatorConfig;
use roomloc::labeling::{self, build_ground_truth, waypoint_script};
use roomloc::ranging::{Anchor, AnchorTable, MultilaterationTracker};
use roomloc::sim::{
    MergedRecord, PositionRecord, dead_reckoning, ground_truth_to_csv, run_ekf,
    run_multilateration,
};

/// Command line arguments
#[derive(Parser)]
#[command(
    author,
    version,
    about = "An offline processing tool for UWB/IMU indoor tag localization."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

/// Top-level commands
#[derive(Subcommand, Clone)]
enum Command {
    #[command(
        name = "ekf",
        about = "Run the UWB/IMU fusion pipeline",
        long_about = "Replay a merged recording through the extended Kalman filter: inertial prediction with zero-velocity updates, followed by sequential per-anchor range corrections."
    )]
    Ekf(EkfArgs),
    #[command(
        name = "dr",
        about = "Run IMU-only dead reckoning",
        long_about = "Replay a merged recording through pure kinematic propagation with no range corrections and no zero-velocity updates. Useful as a drift baseline."
    )]
    DeadReckoning(PipelineArgs),
    #[command(
        name = "mlat",
        about = "Run UWB-only multilateration",
        long_about = "Replay a merged recording through the seeded least-squares position solver, holding the last position through anchor dropout."
    )]
    Multilateration(MlatArgs),
    #[command(
        name = "label",
        about = "Build a ground-truth trajectory from a scripted run",
        long_about = "Detect scripted stops in the accelerometer stream, assign them to waypoints in order, and interpolate the moving phases. Writes a ground-truth CSV."
    )]
    Label(LabelArgs),
}

/// Arguments shared by every pipeline
#[derive(Args, Clone)]
struct PipelineArgs {
    /// Input merged IMU/UWB CSV file
    #[arg(short, long)]
    input: PathBuf,

    /// Output position CSV file
    #[arg(short, long)]
    output: PathBuf,

    /// Anchor definition as "mac,x,y,z" (repeatable; defaults to the
    /// reference room deployment)
    #[arg(long = "anchor", value_parser = parse_anchor)]
    anchors: Vec<Anchor>,

    /// Tag antenna height above the floor in meters
    #[arg(long, default_value_t = 0.015)]
    tag_height: f64,

    /// Initial tag x position in meters
    #[arg(long, default_value_t = 2.07)]
    start_x: f64,

    /// Initial tag y position in meters
    #[arg(long, default_value_t = 0.70)]
    start_y: f64,
}

#[derive(Args, Clone)]
struct EkfArgs {
    #[command(flatten)]
    pipeline: PipelineArgs,

    /// Process noise sigma on acceleration (m/s^2)
    #[arg(long, default_value_t = 0.1)]
    sigma_acc: f64,

    /// Measurement noise sigma on projected ranges (m)
    #[arg(long, default_value_t = 0.5)]
    sigma_uwb: f64,

    /// Stationarity threshold on planar acceleration magnitude (m/s^2)
    #[arg(long, default_value_t = 0.5)]
    accel_threshold: f64,

    /// Initial covariance scale
    #[arg(long, default_value_t = 1.0)]
    covariance: f64,
}

#[derive(Args, Clone)]
struct MlatArgs {
    #[command(flatten)]
    pipeline: PipelineArgs,

    /// Seconds of continuous held position before a dropout warning
    #[arg(long, default_value_t = MultilaterationTracker::DEFAULT_HOLD_WARN_SECS)]
    hold_warn_secs: f64,
}

#[derive(Args, Clone)]
struct LabelArgs {
    /// Input merged IMU/UWB CSV file
    #[arg(short, long)]
    input: PathBuf,

    /// Output ground-truth CSV file
    #[arg(short, long)]
    output: PathBuf,

    /// Threshold on sample-to-sample acceleration change (m/s^2)
    #[arg(long, default_value_t = labeling::DEFAULT_ACCEL_CHANGE_THRESHOLD)]
    threshold: f64,

    /// Minimum dwell for a valid stop (s)
    #[arg(long, default_value_t = labeling::DEFAULT_MIN_STOP_DURATION_S)]
    min_stop_duration: f64,

    /// Scripted waypoint x coordinate (constant across the run)
    #[arg(long, default_value_t = 2.07)]
    waypoint_x: f64,

    /// First scripted waypoint y coordinate
    #[arg(long, default_value_t = 0.70)]
    waypoint_y_start: f64,

    /// Last scripted waypoint y coordinate
    #[arg(long, default_value_t = 2.40)]
    waypoint_y_end: f64,

    /// Number of scripted waypoints
    #[arg(long, default_value_t = 35)]
    waypoint_count: usize,
}

/// Parse an `--anchor` flag value of the form "mac,x,y,z".
fn parse_anchor(value: &str) -> Result<Anchor, String> {
    let parts: Vec<&str> = value.split(',').collect();
    if parts.len() != 4 {
        return Err(format!(
            "expected 'mac,x,y,z' but got {} fields in '{}'",
            parts.len(),
            value
        ));
    }
    let coord = |s: &str| -> Result<f64, String> {
        s.trim()
            .parse::<f64>()
            .map_err(|e| format!("bad coordinate '{}': {}", s, e))
    };
    Ok(Anchor::new(
        parts[0].trim(),
        coord(parts[1])?,
        coord(parts[2])?,
        coord(parts[3])?,
    ))
}

/// Initialize the logger with the specified configuration.
///
/// # Arguments
/// * `log_level` - Log level string (off, error, warn, info, debug, trace)
/// * `log_file` - Optional path to log file (logs to stderr if None)
///
/// # Errors
/// Returns an error if the log file cannot be opened or logger initialization fails.
fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    use std::io::Write;

    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let target = Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}

fn anchor_table(args: &PipelineArgs) -> AnchorTable {
    let anchors = if args.anchors.is_empty() {
        AnchorTable::default_room().anchors
    } else {
        args.anchors.clone()
    };
    // The tag-height flag applies either way.
    AnchorTable::new(anchors, args.tag_height)
}

fn run_ekf_command(args: &EkfArgs) -> Result<(), Box<dyn Error>> {
    let anchors = anchor_table(&args.pipeline);
    let records = MergedRecord::from_csv(&args.pipeline.input, &anchors)?;
    let config = EstimatorConfig {
        sigma_acc: args.sigma_acc,
        sigma_uwb: args.sigma_uwb,
        accel_threshold: args.accel_threshold,
        initial_position: Vector2::new(args.pipeline.start_x, args.pipeline.start_y),
        initial_covariance: args.covariance,
    };
    let results = run_ekf(&records, &anchors, config);
    PositionRecord::to_csv(&results, &args.pipeline.output)?;
    info!(
        "wrote {} EKF estimates to {}",
        results.len(),
        args.pipeline.output.display()
    );
    Ok(())
}

fn run_dr_command(args: &PipelineArgs) -> Result<(), Box<dyn Error>> {
    let anchors = anchor_table(args);
    let records = MergedRecord::from_csv(&args.input, &anchors)?;
    let results = dead_reckoning(&records, Vector2::new(args.start_x, args.start_y));
    PositionRecord::to_csv(&results, &args.output)?;
    info!(
        "wrote {} dead-reckoning estimates to {}",
        results.len(),
        args.output.display()
    );
    Ok(())
}

fn run_mlat_command(args: &MlatArgs) -> Result<(), Box<dyn Error>> {
    let anchors = anchor_table(&args.pipeline);
    let records = MergedRecord::from_csv(&args.pipeline.input, &anchors)?;
    let results = run_multilateration(
        &records,
        &anchors,
        Vector2::new(args.pipeline.start_x, args.pipeline.start_y),
        args.hold_warn_secs,
    );
    PositionRecord::to_csv(&results, &args.pipeline.output)?;
    info!(
        "wrote {} multilateration estimates to {}",
        results.len(),
        args.pipeline.output.display()
    );
    Ok(())
}

fn run_label_command(args: &LabelArgs) -> Result<(), Box<dyn Error>> {
    // Range columns are irrelevant here; the default table keeps ingestion happy.
    let records = MergedRecord::from_csv(&args.input, &AnchorTable::default_room())?;
    let samples: Vec<(i64, nalgebra::Vector3<f64>)> = records
        .iter()
        .map(|r| (r.timestamp_ns, r.accel_body))
        .collect();
    let waypoints = waypoint_script(
        args.waypoint_x,
        args.waypoint_y_start,
        args.waypoint_y_end,
        args.waypoint_count,
    );
    let truth = build_ground_truth(&samples, &waypoints, args.threshold, args.min_stop_duration);
    ground_truth_to_csv(&truth, &args.output)?;
    info!(
        "wrote {} ground-truth rows to {}",
        truth.len(),
        args.output.display()
    );
    Ok(())
}


fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_logger(&cli.log_level, cli.log_file.as_ref()) {
        eprintln!("Failed to initialize logger: {}", e);
        return ExitCode::FAILURE;
    }

    let result = match &cli.command {
        Command::Ekf(args) => run_ekf_command(args),
        Command::DeadReckoning(args) => run_dr_command(args),
        Command::Multilateration(args) => run_mlat_command(args),
        Command::Label(args) => run_label_command(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
