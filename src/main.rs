//! qbridge - transactional queue bridge
//!
//! Usage:
//!   qbridge [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!       --check            Validate configuration, print routes and exit
//!   -h, --help             Print help

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use qbridge::bridge::{BridgeEngine, BridgeHandle, RouteState, RouteTable};
use qbridge::broker::{BrokerId, ConnectionPool};
use qbridge::config::Config;

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
    fn parse(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }

    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// qbridge - transactional queue bridge
#[derive(Parser, Debug)]
#[command(name = "qbridge")]
#[command(author = "qbridge Contributors")]
#[command(version)]
#[command(about = "Forwards messages between queues on two brokers, one transaction per message")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,

    /// Validate the configuration, print the route table and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let config = match config {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // CLI overrides config; RUST_LOG overrides both when set
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::parse(&config.log.level))
        .to_tracing_level();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    // An ambiguous route table must never start
    let table = match RouteTable::from_config(&config.forwarder) {
        Ok(table) => table,
        Err(e) => {
            error!("Invalid route table: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting qbridge");
    for broker in [BrokerId::A, BrokerId::B] {
        let broker_cfg = config.broker(broker);
        let queues: Vec<_> = config.queues_on(broker).into_iter().collect();
        info!(
            "  Broker {}: {} ({}) queues [{}]",
            broker,
            broker_cfg.name,
            broker_cfg.describe(),
            queues.join(", ")
        );
    }
    info!("  Payload mode: {:?}", config.forwarder.payload);
    info!("  Routes: {}", table.len());
    for entry in table.entries() {
        info!("    - {}", entry.name());
    }

    if args.check {
        println!("Configuration OK: {} routes", table.len());
        for entry in table.entries() {
            println!("  {}", entry.name());
        }
        return Ok(());
    }

    if table.is_empty() {
        info!("No queue mappings configured, nothing to forward");
    }

    let pool = Arc::new(ConnectionPool::from_config(&config));
    let handle = BridgeEngine::new(table, pool)
        .with_supervision(config.supervision.clone())
        .with_payload_mode(config.forwarder.payload)
        .start();

    run_until_shutdown(&handle, config.supervision.status_interval).await;

    let summary = handle.stop().await;
    if summary.aborted > 0 {
        error!("{} routes had to be aborted during shutdown", summary.aborted);
    }

    Ok(())
}

/// Log route status periodically until SIGINT/SIGTERM
async fn run_until_shutdown(handle: &BridgeHandle, status_interval: std::time::Duration) {
    let mut status_timer = if status_interval.is_zero() {
        None
    } else {
        let mut timer = tokio::time::interval(status_interval);
        timer.reset();
        Some(timer)
    };

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                return;
            }
            _ = async {
                match status_timer.as_mut() {
                    Some(timer) => { timer.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                log_status(handle);
            }
        }
    }
}

fn log_status(handle: &BridgeHandle) {
    info!(
        "Routes: {} active of {}",
        handle.active_count(),
        handle.route_count()
    );
    for status in handle.routes() {
        let unhealthy = matches!(
            status.state,
            RouteState::Failed | RouteState::Backoff | RouteState::Stopped
        );
        let last_error = match &status.last_error {
            Some(err) if unhealthy => format!(" last_error={}", err),
            _ => String::new(),
        };
        info!(
            "  {} [{}] forwarded={} rolled_back={} restarts={}{}",
            status.name,
            status.state.as_str(),
            status.forwarded,
            status.rolled_back,
            status.restarts,
            last_error
        );
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
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
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
