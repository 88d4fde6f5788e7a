//! `meshfuse` – command line entry point for the reconstruction pipeline.
//!
//! ```text
//! meshfuse run [--config PATH] [--work-dir DIR] [--clouds-dir DIR]
//!              [--output-dir DIR] [--voxel-size M]
//! meshfuse init-config [PATH] [--force]
//! ```
//!
//! Settings are layered: `meshfuse.toml` (or `--config`), then `MESHFUSE_*`
//! environment variables, then command-line flags. Exit code is 1 on any
//! fatal error, with the error chain printed to stderr.

mod config;

use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use meshfuse_runtime::{ReconstructionPipeline, RunReport};
use tracing::debug;

#[derive(Debug, Parser)]
#[command(name = "meshfuse", version, about = "Fuse posed keyframe clouds into a surface mesh")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the reconstruction once over the current pose graph.
    Run(RunArgs),
    /// Write a configuration file holding every default.
    InitConfig {
        #[arg(default_value = config::DEFAULT_CONFIG_FILE)]
        path: PathBuf,
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Config file. A missing default file means built-in defaults.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Directory holding the pose-graph log and lock marker.
    #[arg(long, value_name = "DIR")]
    work_dir: Option<PathBuf>,
    #[arg(long, value_name = "DIR")]
    clouds_dir: Option<PathBuf>,
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,
    /// Voxel edge in metres.
    #[arg(long, value_name = "M")]
    voxel_size: Option<f64>,
}

fn main() -> ExitCode {
    // ── Structured logging ────────────────────────────────────────────────
    // RUST_LOG selects levels (default "info"). MESHFUSE_LOG_FORMAT=json
    // switches to newline-delimited JSON.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if std::env::var("MESHFUSE_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .compact()
            .init();
    }

    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Run(args) => run(args).map(|report| print_summary(&report)),
        Command::InitConfig { path, force } => init_config(path, force),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            print_error_chain(e.as_ref());
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

fn run(args: RunArgs) -> Result<RunReport, Box<dyn Error>> {
    let path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(config::DEFAULT_CONFIG_FILE));

    let mut cfg = match config::load(&path)? {
        Some(cfg) => {
            debug!(config = %path.display(), "config loaded");
            cfg
        }
        None if args.config.is_some() => {
            return Err(format!("config file {} does not exist", path.display()).into());
        }
        None => {
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    if let Some(dir) = args.work_dir {
        cfg.work_dir = dir;
    }
    if let Some(dir) = args.clouds_dir {
        cfg.clouds_dir = Some(dir);
    }
    if let Some(dir) = args.output_dir {
        cfg.output_dir = Some(dir);
    }
    if let Some(size) = args.voxel_size {
        cfg.voxel_size = size;
    }

    let report = ReconstructionPipeline::new(cfg.into_pipeline_config())?.run()?;
    Ok(report)
}

fn init_config(path: PathBuf, force: bool) -> Result<(), Box<dyn Error>> {
    if path.exists() && !force {
        return Err(format!("{} already exists (use --force to overwrite)", path.display()).into());
    }
    config::save_to(&config::Config::default(), &path)?;
    println!("{} Config written to {}", "✓".green().bold(), path.display().to_string().bold());
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn print_summary(report: &RunReport) {
    println!(
        "{} {} keyframes → {} points → {} vertices, {} triangles",
        "✓".green().bold(),
        report.keyframes,
        report.trimmed_points,
        report.vertices,
        report.triangles
    );
    if !report.skipped_records.is_empty() {
        println!("  {} malformed pose record(s) skipped", report.skipped_records.len().to_string().yellow());
    }
    for warning in &report.warnings {
        println!("  {} {}", "warning:".yellow().bold(), warning);
    }
    for path in &report.outputs {
        println!("  wrote {}", path.display().to_string().dimmed());
    }
}

fn print_error_chain(err: &dyn Error) {
    eprintln!("{} {}", "error:".red().bold(), err);
    let mut source = err.source();
    while let Some(cause) = source {
        eprintln!("  caused by: {cause}");
        source = cause.source();
    }
}
