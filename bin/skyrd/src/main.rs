//! ---
//! skyr_section: "01-core-functionality"
//! skyr_subsection: "binary"
//! skyr_type: "source"
//! skyr_scope: "code"
//! skyr_description: "Binary entrypoint for the skyr reflector daemon."
//! skyr_version: "v0.0.0-prealpha"
//! skyr_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use skyr_common::{init_tracing, LogFormat, LoggingConfig, ReflectorConfig};
use skyr_engine::DevicePoolEngine;
use skyr_net::ReflectorServer;
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "ASCOM Alpaca reflector daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "FORMAT", help = "Override log format (structured-json or pretty)")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the reflector until interrupted")]
    Run,
    #[command(about = "Broadcast an Alpaca discovery and print the devices found")]
    Discover {
        #[arg(long, help = "Discovery port (defaults to engine.discovery_port)")]
        port: Option<u16>,
        #[arg(long, value_name = "SECONDS", help = "How long to collect replies")]
        timeout: Option<u64>,
    },
    #[command(about = "Load and validate the configuration, then exit")]
    CheckConfig,
}

fn config_candidates(cli: &Cli) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/skyr.toml"));
    candidates.push(PathBuf::from("configs/skyr.example.toml"));
    candidates
}

fn logging_for(cli: &Cli, base: &LoggingConfig) -> LoggingConfig {
    let mut logging = base.clone();
    if let Some(format) = cli.log_format {
        logging.format = format;
    }
    logging
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let candidates = config_candidates(&cli);

    match cli.command.as_ref().unwrap_or(&Commands::Run) {
        Commands::Run => {
            let loaded = ReflectorConfig::load_with_source(&candidates)?;
            init_tracing("skyrd", &logging_for(&cli, &loaded.config.logging))?;
            info!(source = %loaded.source.display(), devices = loaded.config.devices.len(), "configuration loaded");
            run_daemon(loaded.config).await?
        }
        Commands::Discover { port, timeout } => {
            // discovery needs no device list
            let mut config = match ReflectorConfig::load_with_source(&candidates) {
                Ok(loaded) => loaded.config,
                Err(err) => {
                    eprintln!("using default engine settings: {err:#}");
                    ReflectorConfig::default()
                }
            };
            init_tracing("skyrd", &logging_for(&cli, &config.logging))?;
            if let Some(seconds) = timeout {
                config.engine.discovery_timeout = Duration::from_secs(*seconds);
            }
            discover(config, *port).await?
        }
        Commands::CheckConfig => {
            let loaded = ReflectorConfig::load_with_source(&candidates)?;
            init_tracing("skyrd", &logging_for(&cli, &loaded.config.logging))?;
            render_config_summary(&loaded.config, &loaded.source);
        }
    }

    Ok(())
}

async fn run_daemon(config: ReflectorConfig) -> Result<()> {
    let server = ReflectorServer::new(config).context("failed to build reflector")?;
    let handle = server.spawn().await?;
    info!(
        address = %handle.local_addr(),
        discovery = %handle.discovery_addr(),
        "reflector running; waiting for termination signal"
    );
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    handle.shutdown().await?;
    Ok(())
}

async fn discover(config: ReflectorConfig, port: Option<u16>) -> Result<()> {
    let engine = DevicePoolEngine::new(config.engine.clone())?;
    let port = port.unwrap_or(config.engine.discovery_port);
    info!(port, timeout = ?config.engine.discovery_timeout, "discovering alpaca servers");
    let devices = engine.discover_devices(Some(port)).await?;
    if devices.is_empty() {
        warn!("no alpaca devices answered");
    }
    println!("{}", serde_json::to_string_pretty(&devices)?);
    Ok(())
}

fn render_config_summary(config: &ReflectorConfig, source: &std::path::Path) {
    println!("Configuration: {}", source.display());
    println!(
        "Server: {} on {} (discovery {})",
        config.server.server_name, config.server.listen_address, config.server.discovery_port
    );
    for device in &config.devices {
        let mode = device.effective_mode(config.backend.mode);
        let target = device.backend.server_url.as_deref().unwrap_or("-");
        println!(
            "  {}/{} [{}] {}",
            device.normalized_type(),
            device.number,
            mode.as_str(),
            target
        );
    }
}
