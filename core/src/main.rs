//! FUSION: run synthetic laser/radar scenarios through the CTRV unscented Kalman filter.
//!
//! The `run` subcommand generates a ground-truth trajectory, synthesizes alternating laser and
//! radar measurements, feeds them through the filter, and reports the RMSE of
//! `[px, py, vx, vy]` together with the NIS consistency of each sensor. Per-measurement results
//! can be written to CSV. The `config` subcommand writes a template configuration file.

use clap::{Args, Parser, Subcommand};
use log::{error, info};
use std::error::Error;
use std::path::PathBuf;

use fusion::config::ConfigFile;
use fusion::consistency::chi_square_95;
use fusion::kalman::UnscentedKalmanFilter;
use fusion::measurements::SensorType;
use fusion::sim::{SimulationConfig, TrackResult, generate_scenario, run_filter};

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about = "Laser/radar fusion with an unscented Kalman filter over a CTRV motion model.")]
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

#[derive(Subcommand, Clone)]
enum Command {
    #[command(name = "run", about = "Run a synthetic scenario through the filter")]
    Run(RunArgs),
    #[command(name = "config", about = "Generate a template configuration file")]
    CreateConfig(CreateConfigArgs),
}

#[derive(Args, Clone, Debug)]
struct RunArgs {
    /// Configuration file (.toml or .json); defaults are used when omitted
    #[arg(short, long, value_parser)]
    config: Option<PathBuf>,

    /// Output CSV file for per-measurement results
    #[arg(short, long, value_parser)]
    output: Option<PathBuf>,

    /// Override the scenario RNG seed
    #[arg(long)]
    seed: Option<u64>,

    /// Override the number of measurements
    #[arg(long)]
    steps: Option<usize>,

    /// Generate noise-free measurements
    #[arg(long)]
    no_noise: bool,

    /// Ignore radar updates (radar measurements still advance the prediction)
    #[arg(long, conflicts_with = "radar_only")]
    laser_only: bool,

    /// Ignore laser updates (laser measurements still advance the prediction)
    #[arg(long)]
    radar_only: bool,
}

#[derive(Args, Clone, Debug)]
struct CreateConfigArgs {
    /// Where to write the template (.toml or .json)
    #[arg(short, long, value_parser, default_value = "fusion.toml")]
    output: PathBuf,
}

/// Initialize the logger with the given level and optional file sink.
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
        if let Some(parent) = log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
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

/// Resolve the configuration file and the command line overrides into one configuration.
fn resolve_config(args: &RunArgs) -> Result<SimulationConfig, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            SimulationConfig::from_file(path)?
        }
        None => SimulationConfig::default(),
    };
    if let Some(seed) = args.seed {
        config.scenario.seed = seed;
    }
    if let Some(steps) = args.steps {
        config.scenario.steps = steps;
    }
    if args.no_noise {
        config.scenario.add_noise = false;
    }
    if args.laser_only {
        config.filter.use_radar = false;
    }
    if args.radar_only {
        config.filter.use_laser = false;
    }
    Ok(config)
}

fn run(args: &RunArgs) -> Result<(), Box<dyn Error>> {
    let config = resolve_config(args)?;
    let scenario = generate_scenario(&config.scenario, &config.filter)?;
    let mut ukf = UnscentedKalmanFilter::new(config.filter.clone())?;
    info!(
        "Running {} measurements (laser: {}, radar: {}, noise: {})",
        scenario.measurements.len(),
        config.filter.use_laser,
        config.filter.use_radar,
        config.scenario.add_noise
    );
    let run = run_filter(&mut ukf, &scenario);

    match run.rmse() {
        Some(rmse) => println!(
            "RMSE px: {:.4}  py: {:.4}  vx: {:.4}  vy: {:.4}",
            rmse[0], rmse[1], rmse[2], rmse[3]
        ),
        None => println!("No measurements processed"),
    }
    for sensor in [SensorType::Laser, SensorType::Radar] {
        if let (Some(summary), Some(bound)) = (run.nis.summary(sensor), chi_square_95(sensor.dimension())) {
            println!(
                "NIS {}: {} samples, mean {:.3}, {:.1}% above {:.3}",
                sensor,
                summary.samples,
                summary.mean,
                summary.fraction_above_95 * 100.0,
                bound
            );
        }
    }
    if run.rejected > 0 {
        println!("{} measurements rejected", run.rejected);
    }
    if let Some(last) = run.final_result() {
        println!("Final estimate: {}", last.estimate());
        println!("Final truth:    {}", last.truth());
    }

    if let Some(output) = &args.output {
        TrackResult::to_csv(&run.results, output)?;
        info!("Results written to {}", output.display());
    }
    Ok(())
}

fn create_config_file(args: &CreateConfigArgs) -> Result<(), Box<dyn Error>> {
    SimulationConfig::default().to_file(&args.output)?;
    println!("Template configuration written to {}", args.output.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;

    let result = match &cli.command {
        Command::Run(args) => run(args),
        Command::CreateConfig(args) => create_config_file(args),
    };
    if let Err(e) = &result {
        error!("{}", e);
    }
    result
}
