//! powerbridge - HTTP control for an MQTT power switch
//!
//! Usage:
//!   powerbridge [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>         Configuration file path (default: powerbridge.toml)
//!   --mqtt-bind <ADDR>          MQTT bind address (default: 0.0.0.0:1883)
//!   --http-bind <ADDR>          HTTP bind address (default: 0.0.0.0:8080)
//!   --device <TOPIC>            Device topic (default: main)
//!   --status-timeout <SECS>     Status reply timeout in seconds (default: 10)
//!   -l, --log-level <LEVEL>     Log level (error, warn, info, debug, trace)
//!   -h, --help                  Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use powerbridge::config::Config;
use powerbridge::supervisor::Supervisor;

const DEFAULT_CONFIG_PATH: &str = "powerbridge.toml";

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// powerbridge - HTTP control for an MQTT power switch
#[derive(Parser, Debug)]
#[command(name = "powerbridge")]
#[command(version)]
#[command(about = "HTTP to MQTT bridge with an embedded broker for remote power switches")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// MQTT broker bind address
    #[arg(long)]
    mqtt_bind: Option<SocketAddr>,

    /// HTTP bind address
    #[arg(long)]
    http_bind: Option<SocketAddr>,

    /// Device topic, as in cmnd/<device>/Power
    #[arg(long)]
    device: Option<String>,

    /// Seconds to wait for a status reply
    #[arg(long)]
    status_timeout: Option<u64>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

impl Args {
    /// CLI args override file config
    fn apply(&self, config: &mut Config) {
        if let Some(bind) = self.mqtt_bind {
            config.mqtt.bind = bind;
        }
        if let Some(bind) = self.http_bind {
            config.http.bind = bind;
        }
        if let Some(ref device) = self.device {
            config.bridge.device = device.clone();
        }
        if let Some(secs) = self.status_timeout {
            config.bridge.status_timeout = Duration::from_secs(secs);
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading config file {}: {}", config_path.display(), e);
            return ExitCode::FAILURE;
        }
    };
    args.apply(&mut config);
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    // CLI overrides config, config overrides default (info)
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install logger: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Starting powerbridge v{}", env!("CARGO_PKG_VERSION"));
    info!("Device topic: {}", config.bridge.device);
    info!("Status timeout: {:?}", config.bridge.status_timeout);

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let supervisor = match Supervisor::bind(&config, cancel).await {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!("Startup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match supervisor.run().await {
        Ok(()) => {
            info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Fatal error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Cancel on SIGINT or SIGTERM
async fn shutdown_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                    _ = cancel.cancelled() => return,
                }
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
                    _ = cancel.cancelled() => return,
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
            _ = cancel.cancelled() => return,
        }
    }

    cancel.cancel();
}
