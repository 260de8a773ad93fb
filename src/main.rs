//! Stratum CLI
//!
//! Inspect and manage a configured cache from the command line.
//!
//! ```text
//! stratum --config stratum.yaml get article:42:comments
//! stratum set avatar:7 '"https://cdn/7.png"' --ttl 600
//! stratum clear --prefix article:42:
//! stratum janitor
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stratum::{CacheOrchestrator, CoreConfig, Janitor};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Stratum - layered cache tooling
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "STRATUM_CONFIG")]
    config: Option<PathBuf>,

    /// Override the durable record directory
    #[arg(long, env = "STRATUM_DURABLE_DIRECTORY")]
    durable_directory: Option<PathBuf>,

    /// Enable the distributed tier at this endpoint
    #[arg(long, env = "STRATUM_DISTRIBUTED_ENDPOINT")]
    distributed_endpoint: Option<String>,

    /// Override the memory tier byte budget
    #[arg(long, env = "STRATUM_MEMORY_BYTE_BUDGET")]
    memory_byte_budget: Option<u64>,

    /// Override the default TTL in seconds
    #[arg(long, env = "STRATUM_DEFAULT_TTL_SECONDS")]
    default_ttl_seconds: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a cached value as JSON
    Get { key: String },

    /// Store a value (parsed as JSON, otherwise stored as a string)
    Set {
        key: String,
        value: String,
        /// Time-to-live in seconds (default TTL when omitted)
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Remove a key from every tier
    Delete { key: String },

    /// Remove every key, or those starting with a prefix
    Clear {
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Purge expired entries once
    Sweep,

    /// Print the effective configuration as YAML
    Config,

    /// Run the periodic sweep until interrupted
    Janitor,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    init_logging(&args);

    let config = effective_config(&args)?;
    if let Command::Config = args.command {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(ExitCode::SUCCESS);
    }

    let cache = Arc::new(
        CacheOrchestrator::from_config(&config).context("failed to build cache from configuration")?,
    );
    info!(tiers = ?cache.tier_kinds(), "Cache ready");

    match args.command {
        Command::Get { key } => match cache.get::<serde_json::Value>(&key).await? {
            Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            None => {
                eprintln!("miss: {}", key);
                return Ok(ExitCode::from(1));
            }
        },
        Command::Set { key, value, ttl } => {
            let value = serde_json::from_str::<serde_json::Value>(&value)
                .unwrap_or(serde_json::Value::String(value));
            cache
                .set(&key, &value, ttl.map(Duration::from_secs))
                .await
                .with_context(|| format!("failed to set {}", key))?;
        }
        Command::Delete { key } => {
            let removed = cache.delete(&key).await?;
            println!("{}", if removed { "deleted" } else { "not found" });
        }
        Command::Clear { prefix } => {
            let removed = cache.clear(prefix.as_deref()).await?;
            println!("removed {} records", removed);
        }
        Command::Sweep => {
            let purged = cache.purge_expired().await?;
            println!("purged {} expired records", purged);
        }
        Command::Janitor => {
            let janitor = Arc::new(Janitor::new(config.sweep_interval()).with_task(cache.clone()));
            let task = tokio::spawn(janitor.clone().run());

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for shutdown signal")?;
            janitor.shutdown();
            task.await?;
        }
        Command::Config => {}
    }

    Ok(ExitCode::SUCCESS)
}

/// Load the configuration file (if any) and apply command-line overrides
fn effective_config(args: &Args) -> anyhow::Result<CoreConfig> {
    let mut config = match &args.config {
        Some(path) => CoreConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => CoreConfig::default(),
    };

    if let Some(dir) = &args.durable_directory {
        config.durable_directory = dir.clone();
    }
    if let Some(endpoint) = &args.distributed_endpoint {
        config.distributed_enabled = true;
        config.distributed_endpoint = endpoint.clone();
    }
    if let Some(budget) = args.memory_byte_budget {
        config.memory_byte_budget = budget;
    }
    if let Some(ttl) = args.default_ttl_seconds {
        config.default_ttl_seconds = ttl;
    }

    config.validate()?;
    Ok(config)
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr so command output stays clean
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
