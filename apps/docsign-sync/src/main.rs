//! DocSign offline sync host
//!
//! Runs the offline signature queue outside the browser: queue completed
//! submissions, inspect the queue, and drain it against the DocSign API.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use docsign_offline::SyncConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

/// Command-line arguments for docsign-sync
#[derive(Parser, Debug)]
#[command(name = "docsign-sync")]
#[command(about = "Offline signature queue and sync for DocSign")]
struct Args {
    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the API base URL
    #[arg(long)]
    api_base: Option<String>,

    /// Override the data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check signing link parameters
    Validate {
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        recipient: Option<String>,
        #[arg(long)]
        key: Option<String>,
    },
    /// Queue a completed submission read from a JSON file
    Enqueue {
        submission: PathBuf,
        /// Session creation time (epoch ms or ISO-8601), checked against session_ttl_ms
        #[arg(long)]
        created_at: Option<String>,
    },
    /// Show pending and quarantined items
    Status,
    /// Run a single sync cycle
    Drain,
    /// Sync until interrupted
    Run,
    /// Re-seal the queue under a fresh key
    RotateKey,
}

fn load_config(args: &Args) -> anyhow::Result<SyncConfig> {
    let mut config = match &args.config {
        Some(path) => SyncConfig::from_file(path)?,
        None => SyncConfig::default(),
    };
    if let Some(api_base) = &args.api_base {
        config.api_base = api_base.clone();
    }
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive(format!("docsign_offline={log_level}").parse()?)
                .add_directive(format!("docsign_sync={log_level}").parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&args)?;

    match args.command {
        Command::Validate {
            session,
            recipient,
            key,
        } => commands::validate(session, recipient, key),
        Command::Enqueue {
            submission,
            created_at,
        } => commands::enqueue(&config, &submission, created_at.as_deref()),
        Command::Status => commands::status(&config),
        Command::Drain => commands::drain(&config).await,
        Command::Run => commands::run(&config).await,
        Command::RotateKey => commands::rotate_key(&config),
    }
}
