use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bucket_loader::config::Config;

mod commands;

#[derive(Parser)]
#[command(
    name = "bucket-loader",
    version,
    about = "Coordinated bulk loading of bundle files from storage buckets",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML); environment variables are used when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); overrides the configuration file
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the coordination schema and populate record kinds
    Init,

    /// Discover the bundles below a local directory
    Scan {
        /// Bucket name to catalog the files under
        #[arg(short, long)]
        bucket: String,

        /// Directory standing in for the bucket
        #[arg(short, long)]
        root: PathBuf,
    },

    /// Run a loader instance until interrupted
    Run {
        /// Bucket name to catalog the files under
        #[arg(short, long)]
        bucket: String,

        /// Directory standing in for the bucket
        #[arg(short, long)]
        root: PathBuf,
    },

    /// Return bundles held by dead instances to the pool
    Reclaim,

    /// Show catalog progress and registered instances
    Status,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

fn setup_tracing(level: &str, format: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("bucket_loader=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!("bucket_loader={level},warn"))
            })
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    // Initialize tracing/logging
    let log_format = cli.log_format.as_deref().unwrap_or(&config.logging.format);
    setup_tracing(&config.logging.level, log_format, cli.verbose)?;

    tracing::info!(backend = ?config.database.backend, "bucket-loader starting");

    match cli.command {
        Commands::Init => commands::init(config).await?,
        Commands::Scan { bucket, root } => {
            tracing::info!(bucket = %bucket, root = %root.display(), "Starting scan command");
            commands::scan(config, bucket, root).await?;
        }
        Commands::Run { bucket, root } => {
            tracing::info!(bucket = %bucket, root = %root.display(), "Starting run command");
            commands::run(config, bucket, root).await?;
        }
        Commands::Reclaim => commands::reclaim(config).await?,
        Commands::Status => commands::status(config).await?,
    }

    Ok(())
}
