//! Encoder Bridge - serial bridge for a four-channel rotary-encoder controller

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;

use encoder_bridge::config::BridgeConfig;
use encoder_bridge::scheduler::TokioScheduler;
use encoder_bridge::transport::{list_ports, SystemSerialBackend};
use encoder_bridge::{EncoderBridge, EventBus};

/// Encoder Bridge - connect a rotary-encoder controller over serial
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "BRIDGE_CONFIG", default_value = "encoder-bridge.yaml")]
    config: PathBuf,

    /// Serial port to use (overrides config)
    #[arg(short, long, env = "BRIDGE_PORT")]
    port: Option<String>,

    /// Baud rate (overrides config)
    #[arg(short, long)]
    baud: Option<u32>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Print bus events as JSON lines
    #[arg(long)]
    json_events: bool,

    /// Run without the interactive console
    #[arg(long)]
    headless: bool,

    /// List available serial ports
    #[arg(long)]
    list_ports: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    init_logging(&args.log_level, args.log_json)?;

    if args.list_ports {
        let ports = list_ports().context("Failed to list serial ports")?;
        cli::list_ports_formatted(&ports);
        return Ok(());
    }

    info!("Starting Encoder Bridge v{}", env!("CARGO_PKG_VERSION"));

    let mut config = BridgeConfig::load_or_default(&args.config).await?;
    if let Some(port) = args.port {
        config.serial.port = Some(port);
    }
    if let Some(baud) = args.baud {
        config.serial.baud_rate = baud;
    }
    config.validate().context("Invalid configuration")?;

    let bus = EventBus::default();
    let bridge = EncoderBridge::new(
        &config,
        Arc::new(SystemSerialBackend::new(config.port_filter())),
        TokioScheduler::shared(),
        Arc::new(bus.clone()),
    )?;

    let printer = cli::spawn_event_printer(bus.subscribe(), args.json_events);
    let listener = bridge.spawn_command_listener(bus.subscribe_commands());

    bridge.start(config.serial.auto_connect).await;

    if args.headless {
        shutdown_signal().await;
    } else {
        tokio::select! {
            result = cli::run_repl(bridge.clone(), bus.clone()) => result?,
            _ = shutdown_signal() => {}
        }
    }

    bridge.shutdown().await;
    let _ = listener.await;
    printer.abort();

    info!("Encoder Bridge shutdown complete");
    Ok(())
}

fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level: {}", level))?;

    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C signal handler");
    info!("Shutdown signal received");
}
