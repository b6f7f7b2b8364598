//! Launcher for the configured MCP servers.
//!
//! Reads `servers.toml`, starts every enabled server through the registry,
//! logs each server's tool catalog, then waits for SIGINT/SIGTERM and stops
//! everything, reporting per-server stop failures without aborting.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info, warn};

use toolbridge_registry::{BridgeConfig, ServerRegistry};

#[derive(Parser, Debug)]
#[command(name = "bridge-launcher", about = "Start and supervise configured MCP servers")]
struct Args {
    /// Path to the servers config file.
    #[arg(long, default_value = "servers.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = BridgeConfig::load(&args.config)?;
    info!(config = %args.config.display(), servers = config.servers.len(), "loaded config");

    let registry = ServerRegistry::from_config(&config);

    let failures = registry.start_all().await;
    for (server, error) in &failures {
        error!(server = %server, error = %error, "server failed to start");
    }

    for name in registry.names() {
        let Some(connection) = registry.get(&name).and_then(|handle| handle.connection())
        else {
            continue;
        };
        match connection.list_tools().await {
            Ok(tools) => {
                let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
                info!(server = %name, tools = ?names, "server tools");
            }
            Err(e) => warn!(server = %name, error = %e, "could not list tools"),
        }
    }

    shutdown_signal().await;
    info!("shutting down");

    let stop_failures = registry.stop_all().await;
    for failure in &stop_failures {
        error!(server = %failure.server, error = %failure.error, "server failed to stop");
    }

    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for ctrl_c");
    }
}
