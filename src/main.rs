//! evokmq - Bridge between UniPi Evok and MQTT
//!
//! Usage:
//!   evokmq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>      Configuration file path
//!   --feed-url <URL>         Evok WebSocket URL
//!   --mqtt-host <HOST>       MQTT broker host
//!   --mqtt-port <PORT>       MQTT broker port
//!   -n, --node <NAME>        Node name (default: hostname)
//!   -l, --log-level          Log level (error, warn, info, debug, trace)
//!   -h, --help               Print help

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use evokmq::config::Config;
use evokmq::engine::BridgeEngine;

const DEFAULT_CONFIG_PATH: &str = "/etc/evokmq/evokmq.toml";

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// evokmq - Bridge between UniPi Evok and MQTT
#[derive(Parser, Debug)]
#[command(name = "evokmq")]
#[command(author = "evokmq Contributors")]
#[command(version)]
#[command(about = "Bridge between the Evok WebSocket API and an MQTT broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Evok WebSocket URL
    #[arg(long)]
    feed_url: Option<String>,

    /// MQTT broker host
    #[arg(long)]
    mqtt_host: Option<String>,

    /// MQTT broker port
    #[arg(long)]
    mqtt_port: Option<u16>,

    /// Node name, used as default topic prefix
    #[arg(short, long)]
    node: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config file {:?}: {}", args.config, e);
            return ExitCode::FAILURE;
        }
    };

    // CLI args override file config
    if let Some(url) = args.feed_url {
        config.feed.url = url;
    }
    if let Some(host) = args.mqtt_host {
        config.bus.host = host;
    }
    if let Some(port) = args.mqtt_port {
        config.bus.port = port;
    }
    if let Some(node) = args.node {
        config.bridge.node = Some(node);
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    // Setup logging - RUST_LOG wins, then CLI, then config
    let level = args
        .log_level
        .map(|l| l.as_filter().to_string())
        .unwrap_or_else(|| config.log.level.to_lowercase());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install logger: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Loaded configuration from {:?}", args.config);

    let engine = match BridgeEngine::from_config(&config) {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "Failed to build bridge");
            return ExitCode::FAILURE;
        }
    };

    info!(
        feed = %config.feed.url,
        broker = %format!("{}:{}", config.bus.host, config.bus.port),
        node = %config.bridge.node(),
        points = config.points.len(),
        "Starting evokmq"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let report = engine.run(shutdown).await;
    if !report.drained {
        warn!("Some publications were not delivered before shutdown");
    }
    info!(
        published = report.published,
        commands = report.commands_forwarded,
        rejected = report.commands_rejected,
        dropped = report.dropped,
        "Shutdown complete"
    );

    ExitCode::SUCCESS
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM
async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C");
    }

    shutdown.cancel();
}
