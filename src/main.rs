//! `rustgs` command-line trainer.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use log::{debug, error, info};
use thiserror::Error;

use rustgs::rendering::{CpuRasterizer, L1SsimLoss};
use rustgs::train::{DatasetMode, JsonlObserver, LogObserver, TrainConfig, Trainer};

/// Progress lines are logged this often.
const PROGRESS_INTERVAL: usize = 10;

/// Adaptive-density 3D Gaussian Splatting trainer.
#[derive(Parser, Debug)]
#[command(name = "rustgs", version, about = "Train a 3D Gaussian Splatting scene")]
struct CliArgs {
    /// Scene directory holding cameras.json, images/ and optionally points3d.ply.
    #[arg(short = 's', long, value_name = "DIR")]
    source: Option<PathBuf>,
    /// Output directory.
    #[arg(short = 'm', long, value_name = "DIR")]
    model_path: Option<PathBuf>,
    /// Path to TOML configuration file.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    #[arg(long)]
    iterations: Option<usize>,
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    test_iterations: Option<Vec<usize>>,
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    save_iterations: Option<Vec<usize>>,
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    checkpoint_iterations: Option<Vec<usize>>,
    /// Resume from a checkpoint written by a previous run.
    #[arg(long, value_name = "FILE")]
    start_checkpoint: Option<PathBuf>,
    #[arg(short = 'w', long)]
    white_background: bool,
    #[arg(long)]
    random_background: bool,
    /// Hold out every 8th camera for evaluation.
    #[arg(long)]
    eval: bool,
    #[arg(long, value_enum)]
    dataset_mode: Option<DatasetModeArg>,
    /// Integer image downscale factor.
    #[arg(short = 'r', long)]
    resolution: Option<u32>,
    #[arg(long)]
    sh_degree: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
    /// Rayon worker threads.
    #[arg(long)]
    threads: Option<usize>,
    /// Enable rasterizer debug checks from this iteration on.
    #[arg(long)]
    debug_from: Option<usize>,
    /// Emit primitive statistics and write metrics.jsonl.
    #[arg(long)]
    telemetry: bool,
    /// Only log warnings and errors.
    #[arg(long)]
    quiet: bool,
    /// Log verbosity level.
    #[arg(long, value_enum)]
    log_level: Option<LogLevel>,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
enum DatasetModeArg {
    Preloaded,
    Streamed,
}

impl From<DatasetModeArg> for DatasetMode {
    fn from(mode: DatasetModeArg) -> Self {
        match mode {
            DatasetModeArg::Preloaded => DatasetMode::Preloaded,
            DatasetModeArg::Streamed => DatasetMode::Streamed,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Error, Debug)]
enum CliError {
    #[error("source path is required but was not provided")]
    SourceNotProvided,
    #[error("source directory not found: {0}")]
    SourceMissing(PathBuf),
    #[error("failed to read config file {path}: {source}")]
    ConfigRead { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: rustgs::train::Error,
    },
    #[error("failed to initialize thread pool: {0}")]
    ThreadPool(String),
    #[error("training failed: {0}")]
    Training(#[from] rustgs::train::Error),
}

impl CliError {
    fn suggestion(&self) -> &'static str {
        match self {
            CliError::SourceNotProvided => "Pass --source <scene-dir> or set model.source_path in the TOML config.",
            CliError::SourceMissing(_) => "Verify the scene directory exists and contains cameras.json.",
            CliError::ConfigRead { .. } => "Verify the config path and file permissions.",
            CliError::ConfigParse { .. } => "Fix TOML syntax and ensure fields match the schema.",
            CliError::ThreadPool(_) => "Check --threads and RUSTGS_CPU_THREADS.",
            CliError::Training(_) => "Run with --log-level debug for diagnostics.",
        }
    }
}

fn main() -> ExitCode {
    let start = Instant::now();
    let cli = CliArgs::parse();
    init_logger(&resolve_log_level(&cli));

    match run(&cli) {
        Ok(()) => {
            info!("Finished in {:.1}s", start.elapsed().as_secs_f64());
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{}", err);
            error!("{}", err.suggestion());
            ExitCode::from(1)
        }
    }
}

fn run(cli: &CliArgs) -> Result<(), CliError> {
    let mut config = load_config(cli)?;
    for override_entry in apply_overrides(&mut config, cli) {
        debug!("CLI override: {}", override_entry);
    }

    if config.run.quiet && cli.log_level.is_none() {
        log::set_max_level(log::LevelFilter::Warn);
    }

    if config.model.source_path.as_os_str().is_empty() {
        return Err(CliError::SourceNotProvided);
    }
    if !config.model.source_path.is_dir() {
        return Err(CliError::SourceMissing(config.model.source_path.clone()));
    }

    let threads = rustgs::init_thread_pool(config.run.threads).map_err(CliError::ThreadPool)?;
    debug!("Using {} worker threads", threads);

    let rasterizer = CpuRasterizer::new(config.pipeline.tile_size);
    let loss = L1SsimLoss::new(config.optimization.lambda_dssim);
    let telemetry = config.run.telemetry;
    info!("Optimizing {}", config.model.source_path.display());
    let mut trainer = Trainer::from_config(config, Box::new(rasterizer), Box::new(loss))?;

    trainer.add_observer(Box::new(LogObserver::new(PROGRESS_INTERVAL)));
    if telemetry {
        let jsonl = JsonlObserver::create(&trainer.config().model.model_path)?;
        info!("Writing metrics to {}", jsonl.path().display());
        trainer.add_observer(Box::new(jsonl));
    }

    let summary = trainer.train()?;
    info!(
        "Trained iterations {}..={} with {} densification passes, {} points",
        summary.first_iteration, summary.last_iteration, summary.densify_passes, summary.num_points
    );
    Ok(())
}

fn load_config(cli: &CliArgs) -> Result<TrainConfig, CliError> {
    if let Some(path) = &cli.config {
        let content = fs::read_to_string(path).map_err(|source| CliError::ConfigRead {
            path: path.clone(),
            source,
        })?;
        TrainConfig::from_toml_str(&content).map_err(|source| CliError::ConfigParse {
            path: path.clone(),
            source,
        })
    } else {
        Ok(TrainConfig::default())
    }
}

fn resolve_log_level(cli: &CliArgs) -> String {
    if let Some(level) = cli.log_level {
        return level.as_str().to_string();
    }
    if cli.quiet {
        return LogLevel::Warn.as_str().to_string();
    }
    if let Ok(level) = std::env::var("RUST_LOG") {
        if !level.trim().is_empty() {
            return level;
        }
    }
    "info".to_string()
}

fn init_logger(level: &str) {
    let mut builder = env_logger::Builder::new();
    builder.target(env_logger::Target::Stderr);
    builder.filter_level(log::LevelFilter::Info);
    builder.parse_filters(level);
    builder.format(|buf, record| {
        use std::io::Write;
        let module = record.module_path().unwrap_or(record.target());
        writeln!(
            buf,
            "{} [{}] {}: {}",
            buf.timestamp_millis(),
            record.level(),
            module,
            record.args()
        )
    });

    if let Err(err) = builder.try_init() {
        eprintln!("Failed to initialize logger: {}", err);
    }
}

fn apply_overrides(config: &mut TrainConfig, cli: &CliArgs) -> Vec<String> {
    let mut overrides = Vec::new();

    if let Some(source) = cli.source.clone() {
        overrides.push(format!("model.source_path = {}", source.display()));
        config.model.source_path = source;
    }
    if let Some(model_path) = cli.model_path.clone() {
        overrides.push(format!("model.model_path = {}", model_path.display()));
        config.model.model_path = model_path;
    }
    if let Some(iterations) = cli.iterations {
        overrides.push(format!("optimization.iterations = {}", iterations));
        config.optimization.iterations = iterations;
    }
    if let Some(list) = cli.test_iterations.clone() {
        overrides.push(format!("run.test_iterations = {:?}", list));
        config.run.test_iterations = list;
    }
    if let Some(list) = cli.save_iterations.clone() {
        overrides.push(format!("run.save_iterations = {:?}", list));
        config.run.save_iterations = list;
    }
    if let Some(list) = cli.checkpoint_iterations.clone() {
        overrides.push(format!("run.checkpoint_iterations = {:?}", list));
        config.run.checkpoint_iterations = list;
    }
    if let Some(path) = cli.start_checkpoint.clone() {
        overrides.push(format!("run.start_checkpoint = {}", path.display()));
        config.run.start_checkpoint = Some(path);
    }
    if cli.white_background && !config.model.white_background {
        overrides.push("model.white_background = true".to_string());
        config.model.white_background = true;
    }
    if cli.random_background && !config.model.random_background {
        overrides.push("model.random_background = true".to_string());
        config.model.random_background = true;
    }
    if cli.eval && !config.model.eval {
        overrides.push("model.eval = true".to_string());
        config.model.eval = true;
    }
    if let Some(mode) = cli.dataset_mode {
        overrides.push(format!("model.dataset_mode = {:?}", mode));
        config.model.dataset_mode = mode.into();
    }
    if let Some(resolution) = cli.resolution {
        overrides.push(format!("model.resolution = {}", resolution));
        config.model.resolution = resolution;
    }
    if let Some(degree) = cli.sh_degree {
        overrides.push(format!("model.sh_degree = {}", degree));
        config.model.sh_degree = degree;
    }
    if let Some(seed) = cli.seed {
        overrides.push(format!("run.seed = {}", seed));
        config.run.seed = seed;
    }
    if let Some(threads) = cli.threads {
        overrides.push(format!("run.threads = {}", threads));
        config.run.threads = Some(threads);
    }
    if let Some(from) = cli.debug_from {
        overrides.push(format!("run.debug_from = {}", from));
        config.run.debug_from = Some(from);
    }
    if cli.telemetry && !config.run.telemetry {
        overrides.push("run.telemetry = true".to_string());
        config.run.telemetry = true;
    }
    if cli.quiet && !config.run.quiet {
        overrides.push("run.quiet = true".to_string());
        config.run.quiet = true;
    }

    overrides
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_replace_config_values() {
        let cli = CliArgs::parse_from([
            "rustgs",
            "-s",
            "data/scene",
            "--iterations",
            "500",
            "--save-iterations",
            "100,500",
            "--dataset-mode",
            "streamed",
            "--white-background",
        ]);
        let mut config = TrainConfig::default();
        let overrides = apply_overrides(&mut config, &cli);

        assert_eq!(config.model.source_path, PathBuf::from("data/scene"));
        assert_eq!(config.optimization.iterations, 500);
        assert_eq!(config.run.save_iterations, vec![100, 500]);
        assert_eq!(config.model.dataset_mode, DatasetMode::Streamed);
        assert!(config.model.white_background);
        assert_eq!(overrides.len(), 5);
    }

    #[test]
    fn test_quiet_lowers_log_level() {
        let cli = CliArgs::parse_from(["rustgs", "--quiet"]);
        assert_eq!(resolve_log_level(&cli), "warn");
        let cli = CliArgs::parse_from(["rustgs", "--quiet", "--log-level", "debug"]);
        assert_eq!(resolve_log_level(&cli), "debug");
    }
}
