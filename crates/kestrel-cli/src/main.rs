//! Kestrel - command-line host for the Kestrel agent runtime
//!
//! - `kestrel eval` runs a script in the sandbox and prints the outcome
//! - `kestrel replay` drives a prompt with a scripted model and demo plugins
//! - `kestrel modes` lists the execution modes

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use kestrel_core::{paths, Config, ModeRegistry};

mod eval;
mod plugins;
mod replay;

/// Kestrel - extensible prompt runtime
#[derive(Parser)]
#[command(name = "kestrel", version)]
#[command(about = "Run prompts, plugins and sandboxed scripts", long_about = None)]
struct Cli {
    /// Log to stderr instead of ~/.kestrel/logs/kestrel.log
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ~/.kestrel/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a script in the sandbox and print the result as JSON
    Eval(eval::EvalArgs),

    /// Run a prompt against a scripted model, printing events as JSON lines
    ///
    /// The script is a JSON array of model steps
    /// (`{"text": ..., "tool_calls": [...]}`) or `{"error": ...}` failures.
    Replay(replay::ReplayArgs),

    /// List execution modes
    Modes,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let config = match &cli.config {
        Some(path) => {
            let mut config = Config::load_from_path(path)?;
            config.apply_env_overrides(|key| std::env::var(key).ok())?;
            config
        }
        None => Config::load()?,
    };

    let ok = match cli.command {
        Commands::Eval(args) => eval::run(args, &config).await?,
        Commands::Replay(args) => replay::run(args, config).await?,
        Commands::Modes => {
            for (id, description) in ModeRegistry::with_builtin_modes().describe() {
                println!("{id:<8} {description}");
            }
            true
        }
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn init_logging(verbose: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if verbose {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(());
    }

    let log_dir = match paths::ensure_logs_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Failed to create log directory: {}, logging to stderr", e);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            return Ok(());
        }
    };
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("kestrel.log"))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(log_file))
        .with_ansi(false)
        .init();
    Ok(())
}
