//! Campus relay server -- GPS location fan-out over WebSocket.
//!
//! An axum WebSocket server that forwards every message a client sends to
//! all other connected clients. Payloads are relayed verbatim; the relay
//! never parses them.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:8081
//! cargo run --bin campus-relay
//!
//! # Run on custom address
//! cargo run --bin campus-relay -- --bind 127.0.0.1:9000
//!
//! # Or via environment variable
//! RELAY_ADDR=127.0.0.1:9000 cargo run --bin campus-relay
//! ```

use std::sync::Arc;

use campus_relay::config::{RelayCliArgs, RelayConfig};
use campus_relay::hub::RelayHub;
use campus_relay::server;
use campus_relay::shutdown::wait_for_shutdown_signal;
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing with the resolved log level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(
        addr = %config.bind_addr,
        queue_size = config.outbound_queue_size,
        send_timeout_ms = config.send_timeout.as_millis(),
        "starting campus relay server"
    );

    let hub = Arc::new(RelayHub::with_queue_size(config.outbound_queue_size));

    match server::start_server_with_shutdown(
        &config.bind_addr,
        hub,
        config.connection_limits(),
        wait_for_shutdown_signal(),
    )
    .await
    {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "relay server listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "relay server task failed");
            }
            tracing::info!("relay server stopped");
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay server");
            std::process::exit(1);
        }
    }
}
