//! mqtt-forwarder - relay one MQTT topic between two brokers
//!
//! Usage:
//!   mqtt-forwarder [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path (default: config.toml)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use mqtt_forwarder::bridge::Bridge;
use mqtt_forwarder::config::BridgeConfig;

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
            "warn" | "warning" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// mqtt-forwarder - relay an MQTT topic between brokers
#[derive(Parser, Debug)]
#[command(name = "mqtt-forwarder")]
#[command(version)]
#[command(about = "Forward messages from a topic on one MQTT broker to a topic on another")]
struct Args {
    /// Configuration file path (TOML, or INI with a .ini extension)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

/// Resolves on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Nothing is connected before the configuration is known to be complete
    let config = match BridgeConfig::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config file: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Setup logging - CLI overrides config, config overrides default (info)
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
        eprintln!("Error installing logger: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Loaded configuration from {:?}", args.config);
    info!("  Source:      {}", config.source);
    info!("  Destination: {}", config.destination);

    let mut bridge = Bridge::from_config(&config);

    if let Err(e) = bridge.start().await {
        error!("Forwarder failed to start: {}", e);
        return ExitCode::FAILURE;
    }

    match bridge.run(shutdown_signal()).await {
        Ok(()) => {
            info!("Forwarder stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Forwarder stopped: {}", e);
            ExitCode::FAILURE
        }
    }
}
