use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use feedcycle::config::Config;

mod commands;

#[derive(Parser)]
#[command(
    name = "feedcycle",
    version,
    about = "Sharded feed retrieval cycle engine",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML config file (environment only when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every schedule until interrupted
    Run,

    /// Run a single cycle of one schedule and print its summary
    Once {
        /// Schedule name
        #[arg(short, long, default_value = "default")]
        schedule: String,
    },

    /// Print shard statistics
    Stats,

    /// List fail counters, or reset the counter of one URL
    FailCounters {
        /// URL whose counter is reset
        #[arg(long)]
        reset: Option<String>,
    },

    /// Serve one batch over stdin/stdout (internal)
    #[command(hide = true)]
    Worker,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    let format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| config.logging.format.clone());
    setup_tracing(&format, &config.logging.level, cli.verbose)?;

    match cli.command {
        Commands::Run => {
            tracing::info!(
                shard = config.scheduler.shard_id,
                fork_batches = config.scheduler.fork_batches,
                "Starting feedcycle"
            );
            commands::run(config).await?;
        }
        Commands::Once { schedule } => {
            tracing::info!(schedule = %schedule, "Starting single cycle");
            commands::once(config, &schedule).await?;
        }
        Commands::Stats => commands::stats(config).await?,
        Commands::FailCounters { reset } => commands::fail_counters(config, reset).await?,
        Commands::Worker => commands::worker().await?,
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

/// Logs go to stderr; stdout carries events and worker reports
fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("feedcycle=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_new(format!("feedcycle={level},warn"))
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("feedcycle=info,warn"))
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    Ok(())
}
