//! Dual Proxy
//!
//! Sends every request to two backends, answers from the primary, and records
//! and compares both responses.
//!
//! # Architecture Overview
//!
//! ```text
//!                          ┌──────────────────────────────────────────────────────┐
//!                          │                     DUAL PROXY                        │
//!     Client Request       │  ┌─────────┐    ┌─────────┐    ┌──────────────┐      │
//!     ─────────────────────┼─▶│   net   │───▶│  http   │───▶│   dispatch   │──────┼──▶ Primary
//!                          │  │listener │    │ server  │    │  (primary)   │      │
//!     Client Response      │  └─────────┘    └─────────┘    └──────┬───────┘      │
//!     ◀────────────────────┼───────────────────────────────────────┤ tee          │
//!                          │                                       ▼              │
//!                          │                               ┌──────────────┐       │
//!                          │                               │   capture    │       │
//!                          │                               │ N.0 N.1 N.2  │       │
//!                          │                               └──────▲───────┘       │
//!                          │                                      │               │
//!                          │                               ┌──────┴───────┐       │
//!                          │                               │   shadow     │───────┼──▶ Secondary
//!                          │                               │  + compare   │       │
//!                          │                               └──────────────┘       │
//!                          └──────────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::net::SocketAddr;

use dual_proxy::config::Cli;
use dual_proxy::lifecycle::{self, Shutdown};
use dual_proxy::observability::{logging, metrics};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Cli::parse().into_config()?;

    logging::init(&config.observability);
    tracing::info!("dual-proxy v{} starting", env!("CARGO_PKG_VERSION"));

    tracing::info!(
        bind_address = %config.listener.bind_address,
        dir = %config.capture.dir.display(),
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    if let Some(address) = &config.observability.metrics_address {
        match address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let proxy = lifecycle::start(&config).await?;
    tracing::info!(address = %proxy.local_addr()?, "Listening for connections");

    // Subscribe before the handler exists so an early signal is not lost.
    let shutdown = Shutdown::new();
    let signal = shutdown.subscribe();
    lifecycle::spawn_signal_handler(shutdown.clone());

    let report = proxy.run(signal).await?;
    if !report.is_clean() {
        tracing::warn!(forced = report.forced, "Some connections were closed by the drain deadline");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
