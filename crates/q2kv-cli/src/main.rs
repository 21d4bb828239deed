//! q2kv CLI - drain queued events into a sorted key/value store.

use anyhow::Result;
use clap::{Parser, Subcommand};
use q2kv_core::config::LogFormat;
use q2kv_core::{Config, Error as CoreError};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit codes for CLI operations.
///
/// - 0: Success
/// - 1-127: Application errors
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (invalid config file, missing required fields)
    ConfigError = 1,
    /// Store connection error (instance, credentials, table)
    ConnectionError = 2,
    /// Event source error
    SourceError = 3,
    /// Event could not be converted to mutations
    SerializationError = 4,
    /// Mutations rejected by the store
    WriteError = 5,
    /// General runtime error
    RuntimeError = 10,
}

impl ExitCode {
    /// Map an error to an exit code by its core error category.
    fn from_error(error: &anyhow::Error) -> Self {
        let Some(core) = error.chain().find_map(|e| e.downcast_ref::<CoreError>()) else {
            if error.chain().any(|e| e.is::<toml::de::Error>()) {
                return ExitCode::ConfigError;
            }
            return ExitCode::RuntimeError;
        };

        match core {
            CoreError::Config(_) => ExitCode::ConfigError,
            CoreError::Connection(_) => ExitCode::ConnectionError,
            CoreError::Source(_) => ExitCode::SourceError,
            CoreError::Serialization(_) => ExitCode::SerializationError,
            CoreError::Write(_) => ExitCode::WriteError,
            CoreError::Lifecycle(_) | CoreError::Fatal(_) | CoreError::Io(_) => {
                ExitCode::RuntimeError
            }
        }
    }
}

mod commands;
mod server;

#[derive(Parser)]
#[command(name = "q2kv")]
#[command(about = "Queue to key/value store batch sink", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Drain a JSON lines event file into the store
    Ingest {
        /// Event file, one JSON object per line
        #[arg(long)]
        input: PathBuf,

        /// Override target table
        #[arg(long)]
        table: Option<String>,

        /// Override events per transaction
        #[arg(long)]
        batch_size: Option<usize>,

        /// Print stored cells after the run
        #[arg(long)]
        dump: bool,

        /// Authorizations for the dump, comma separated
        #[arg(long, value_delimiter = ',')]
        auths: Vec<String>,
    },

    /// Show status and health of a running sink
    Status {
        /// Health endpoint URL
        #[arg(long, default_value = "http://localhost:8080")]
        url: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() {
    let exit_code = run_cli().await;
    std::process::exit(exit_code as i32);
}

async fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    // Log format comes from the config when it parses; JSON otherwise.
    let monitoring = cli
        .config
        .as_ref()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.monitoring);
    let log_format = monitoring
        .as_ref()
        .map(|m| m.log_format)
        .unwrap_or(LogFormat::Json);

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new(
                monitoring
                    .as_ref()
                    .map(|m| m.log_level.as_directive())
                    .unwrap_or("info"),
            ),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    match log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .init();
        }
    }

    match execute_command(cli).await {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

async fn execute_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Ingest {
            input,
            table,
            batch_size,
            dump,
            auths,
        } => {
            let config = load_config(&cli.config)?;
            let options = commands::ingest::IngestOptions {
                input,
                table,
                batch_size,
                dump,
                auths,
            };
            commands::ingest::run(config, options).await?;
        }

        Commands::Status { url } => {
            commands::status::run(&url).await?;
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;
            commands::validate::run(&config)?;
        }
    }

    Ok(())
}

fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    let path = path.clone().unwrap_or_else(|| PathBuf::from("q2kv.toml"));
    Ok(Config::from_file(&path)?)
}
