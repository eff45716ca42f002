//! torproxy - Entry Point
//!
//! Runs the supervised session until Ctrl+C or SIGTERM.

use std::process::ExitCode;
use std::sync::Arc;

use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use torproxy::config::{Config, LogConfig};
use torproxy::supervisor::{Supervisor, SupervisorExit, SystemBrowser, TorProcess};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing(&LogConfig::from_env());

    info!("Starting torproxy");

    // Load configuration
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!(
        socks_port = config.tor.socks_port,
        http_port = config.proxy.port,
        split = config.proxy.split_networks,
        "Configuration loaded"
    );

    let browser = Arc::new(SystemBrowser::from_config(&config.browser));
    let supervisor = Supervisor::new(config, Arc::new(TorProcess), browser);

    match supervisor.run(shutdown_signal()).await {
        Ok(SupervisorExit::Signalled { task_failures }) => {
            if task_failures > 0 {
                warn!("{} task failure(s) during the session", task_failures);
            }
            info!("torproxy stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Fatal: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("torproxy={}", log.level).into());

    if log.is_json() {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
