//! mped: mpe post-processing daemon
//!
//! Usage:
//!   mped [--config /etc/mpe/config.toml] [--once]
//!
//! Watches the ready queue, claims each batch once it has been quiet for the
//! debounce window, decrypts it into `processed/` (or routes it to
//! `failed/`), and sweeps periodically for anything the watcher missed.

mod daemon;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::{error, info, warn};

use mpe_core::MpeConfig;

#[derive(Parser, Debug)]
#[command(name = "mped", version, about = "mpe post-processing daemon")]
struct Cli {
    /// Path to mpe.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "MPE_CONFIG",
        default_value = "/etc/mpe/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "MPE_LOG")]
    log: Option<String>,

    /// Log format (json, text); overrides the config file
    #[arg(long, env = "MPE_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Run one stale sweep and one ready sweep, then exit
    #[arg(long)]
    once: bool,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = MpeConfig::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    config
        .apply_env(std::env::vars())
        .context("applying MPE_* environment overrides")?;

    let level = cli.log.clone().unwrap_or_else(|| config.daemon.log_level.clone());
    let format = match cli.log_format {
        Some(f) => f,
        None if config.daemon.log_format.eq_ignore_ascii_case("json") => LogFormat::Json,
        None => LogFormat::Text,
    };
    init_logging(&level, &format);
    if !cli.config.exists() {
        warn!("config file not found: {}  (using defaults)", cli.config.display());
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        root = %config.storage.root.display(),
        "mped starting"
    );

    if let Err(e) = config.validate() {
        error!(class = %e.class(), error = %e, "invalid configuration");
        return Err(e).context("invalid configuration");
    }

    if cli.once {
        return daemon::run_once(config).await;
    }
    daemon::run(config).await
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
