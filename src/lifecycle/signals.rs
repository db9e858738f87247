//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGINT, SIGTERM)
//! - Translate the first signal into a graceful shutdown
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - A second SIGINT/SIGTERM forces immediate exit without draining

use crate::lifecycle::Shutdown;

/// Exit code used when a second signal cuts the drain short.
const FORCED_EXIT_CODE: i32 = 130;

/// Spawn the signal listener. The first signal triggers `shutdown`, the second exits.
pub fn spawn_signal_handler(shutdown: Shutdown) {
    tokio::spawn(async move {
        let mut received = 0u32;
        loop {
            let name = match wait_for_signal().await {
                Ok(name) => name,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to listen for shutdown signals");
                    return;
                }
            };
            received += 1;

            if received == 1 {
                tracing::info!(signal = name, "Received signal, initiating graceful shutdown");
                shutdown.trigger();
            } else {
                tracing::warn!(signal = name, "Received second signal, exiting without drain");
                // Spawned task: returning cannot end the process.
                std::process::exit(FORCED_EXIT_CODE);
            }
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|()| "SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|()| "SIGINT")
}
