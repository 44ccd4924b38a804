//! # Parley Server
//!
//! WebSocket chat relay: clients join rooms and receive every message
//! published to the room's broker channel.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (in-memory broker, no registration)
//! parley
//!
//! # Run with a config file in one of the default locations
//! cp parley.toml /etc/parley/parley.toml && parley
//!
//! # Override settings with environment variables
//! PARLEY__PORT=9000 PARLEY__COORDINATION__REGISTER=true parley
//! ```

mod config;
mod handlers;
mod metrics;
mod registration;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::registration::Registration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,parley_core=debug,parley_coord=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Parley server on {}:{}", config.host, config.port);

    metrics::describe();

    let broker = handlers::build_broker(&config.broker)?;

    // Register this node with the coordination service
    let registration = if config.coordination.register {
        let client = registration::connect(&config.coordination).await?;
        let registration = Registration::start(client, &config).await?;
        tracing::info!(node = %registration.node().id, "Node registered");
        Some(registration)
    } else {
        None
    };

    // Start the server
    handlers::run_server(config, broker, shutdown_signal()).await?;

    if let Some(registration) = registration {
        registration.shutdown().await;
    }

    Ok(())
}

/// Resolve on Ctrl-C.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
