//! qan-agent entry point
//!
//! Runs the spool-and-send data service and offers a few maintenance
//! commands over the local spool.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};

use qan_agent::{
    config::AgentConfig,
    data::{manager::SERVICE_NAME as DATA_SERVICE, DiskSpooler, JsonSerializer, Sender, Spooler, TcpTransport},
    fmt::format_bytes,
    logging::init_logging,
    proto::SpoolLimits,
    Agent, Basedir, DataManager, SystemClock,
};

/// Query analytics agent command line interface
#[derive(Parser)]
#[command(name = "qan-agent")]
#[command(about = "Query analytics agent with a durable spool-and-send pipeline")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Run the agent until SIGINT or SIGTERM
    Run,

    /// Validate configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,
    },

    /// Print spool counters
    SpoolStatus,

    /// Remove every spooled report
    PurgeSpool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    let result = match &cli.command {
        Some(Commands::Run) | None => run_agent(config).await,
        Some(Commands::Config { show }) => handle_config(&config, *show),
        Some(Commands::SpoolStatus) => spool_status(&config).await,
        Some(Commands::PurgeSpool) => purge_spool(&config).await,
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        process::exit(1);
    }
}

/// Config file, then environment, then CLI flags.
fn load_configuration(cli: &Cli) -> Result<AgentConfig> {
    let path = cli.config.clone().unwrap_or_else(AgentConfig::default_config_path);
    let mut config = AgentConfig::load_with_fallback(Some(&path))
        .with_context(|| format!("loading {}", path.display()))?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.json_logs {
        config.logging.json = true;
    }
    config.validate().context("validating configuration")?;
    Ok(config)
}

fn data_manager(config: &AgentConfig, basedir: Basedir) -> DataManager {
    let clock = Arc::new(SystemClock::new());
    let spooler = DiskSpooler::new(basedir.data_dir(), config.hostname.clone(), SpoolLimits::default());
    let sender = Sender::new(Box::new(TcpTransport::new(config.collector.address.clone())))
        .with_connect_timeout(Duration::from_secs(config.collector.connect_timeout));
    DataManager::with_parts(basedir, clock, spooler, sender)
}

async fn run_agent(config: AgentConfig) -> Result<()> {
    let basedir = Basedir::init(&config.basedir)
        .with_context(|| format!("initializing basedir {}", config.basedir.display()))?;
    info!(basedir = %basedir.root().display(), hostname = %config.hostname, "starting agent");

    let data = data_manager(&config, basedir);

    let agent = Agent::new().with_service(DATA_SERVICE, Arc::new(data));
    for (service, e) in agent.start().await {
        if service == DATA_SERVICE {
            agent.stop().await;
            return Err(e).context("starting data service");
        }
        warn!(service = %service, error = %e, "service failed to start");
    }
    info!("agent running");

    wait_for_shutdown().await;

    info!("shutting down");
    agent.stop().await;
    info!("agent stopped");
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                let _ = signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => info!("received SIGINT"),
            _ = term.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("received Ctrl-C");
    }
}

fn handle_config(config: &AgentConfig, show: bool) -> Result<()> {
    if show {
        let rendered = toml::to_string_pretty(config).context("rendering configuration")?;
        println!("{}", rendered);
    } else {
        println!("Configuration is valid");
    }
    Ok(())
}

/// Open the spool without a sender. The spooler scans its directory on start.
async fn open_spool(config: &AgentConfig) -> Result<DiskSpooler> {
    let basedir = Basedir::init(&config.basedir)
        .with_context(|| format!("initializing basedir {}", config.basedir.display()))?;
    let spooler = DiskSpooler::new(basedir.data_dir(), config.hostname.clone(), SpoolLimits::default());
    spooler
        .start(Box::new(JsonSerializer))
        .context("opening spool")?;
    Ok(spooler)
}

async fn spool_status(config: &AgentConfig) -> Result<()> {
    let spooler = open_spool(config).await?;
    println!("Spool directory: {}", spooler.dir().display());
    println!("Files: {}", spooler.count());
    println!("Size: {}", format_bytes(spooler.size()));
    let mut status: Vec<(String, String)> = spooler.status().into_iter().collect();
    status.sort();
    for (key, value) in status {
        println!("{}: {}", key, value);
    }
    spooler.stop().await.context("closing spool")?;
    Ok(())
}

/// Wipe the spool on disk. The data service does not need to be running.
async fn purge_spool(config: &AgentConfig) -> Result<()> {
    let basedir = Basedir::init(&config.basedir)
        .with_context(|| format!("initializing basedir {}", config.basedir.display()))?;
    let (removed, report) = data_manager(config, basedir).purge_all();
    let mut reasons: Vec<(String, usize)> = report.into_iter().map(|(r, keys)| (r, keys.len())).collect();
    reasons.sort();
    println!("Removed {} files", removed);
    for (reason, count) in reasons {
        println!("  {}: {}", reason, count);
    }
    Ok(())
}
