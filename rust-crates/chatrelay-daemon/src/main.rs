//! chatrelay daemon - TCP broadcast relay
//!
//! Listens on a TCP port (default 0.0.0.0:8080) and forwards every chunk a
//! client sends to all connected clients. Runs until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};

use chatrelay_broadcaster::Listener;
use chatrelay_daemon::{Cli, DaemonConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    info!("Starting chatrelay daemon v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => DaemonConfig::load_from(path),
        None => DaemonConfig::load(),
    }
    .context("Failed to load configuration")?;

    info!("Configuration loaded from {}", config.config_path.display());
    cli.apply(&mut config.listener);

    let settings = &config.listener;
    let listener = Listener::new(settings.clone());
    listener.start().await.with_context(|| {
        format!(
            "Server failed to start on {}:{}",
            settings.bind_address, settings.port
        )
    })?;

    info!("  - Max pending connections: {}", settings.max_pending);
    info!("  - Echo to sender: {}", settings.echo_to_sender);
    match settings.read_timeout_secs {
        Some(secs) => info!("  - Idle timeout: {}s", secs),
        None => info!("  - Idle timeout: none"),
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    listener.stop().await.context("Failed to stop listener")?;
    info!("chatrelay daemon stopped");

    Ok(())
}
