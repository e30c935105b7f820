//! CLI for popgate
//!
//! Subcommands:
//! - `serve` (default): connect to every configured broker and serve HTTP
//! - `check`: validate the configuration and print the broker table

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use popgate::config::{Settings, load_config};
use popgate::service::ServiceManager;
use popgate::transport::http::start_http_server;
use popgate::utils::{Result, logging};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "popgate", version, about = "HTTP gateway over multiple MQTT brokers")]
struct Cli {
    /// Configuration file, format chosen by extension (extension optional)
    #[arg(short, long, env = "CONFIG_PATH", default_value = "config/default")]
    config: String,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy, Default)]
enum Command {
    /// Connect to the brokers and serve the HTTP API
    #[default]
    Serve,
    /// Validate the configuration and print the configured brokers
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let result = match cli.command.unwrap_or_default() {
        Command::Serve => run_server(&cli.config).await,
        Command::Check => run_check(&cli.config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("popgate failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(config_path: &str) -> Result<()> {
    let settings = load_config(config_path)?;
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    if settings.brokers.is_empty() {
        warn!("No brokers configured; every API request will be rejected");
    }

    let mut manager = ServiceManager::from_settings(&settings);
    if let Err(e) = manager.initialize().await {
        error!("{e}; serving with the brokers that did connect");
    }
    let manager = Arc::new(manager);

    let served = start_http_server(&addr, Arc::clone(&manager), shutdown_signal()).await;

    if let Err(e) = manager.shutdown().await {
        warn!("{e}");
    }
    served
}

fn run_check(config_path: &str) -> Result<()> {
    let settings = load_config(config_path)?;
    print_settings(&settings);
    Ok(())
}

fn print_settings(settings: &Settings) {
    println!(
        "HTTP server: {}:{}",
        settings.server.host, settings.server.port
    );
    println!(
        "{:<16} {:<28} {:>5} {:>3}  TOPICS",
        "BROKER", "HOST", "PORT", "QOS"
    );
    for broker in settings.brokers.values() {
        println!(
            "{:<16} {:<28} {:>5} {:>3}  {}",
            broker.broker_id,
            broker.host,
            broker.port,
            broker.qos,
            broker.subscriptions().join(", ")
        );
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
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
    info!("Shutdown signal received. Exiting gracefully.");
}
