//! Structured logging.
//!
//! # Responsibilities
//! - Initialize logging subsystem
//! - Pick the filter from `RUST_LOG`, the verbose flag, or the configured level
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - Every line carries the source file and line it was logged from
//! - `RUST_LOG` always wins over configuration

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Filter used when `RUST_LOG` is unset.
pub fn default_directives(config: &ObservabilityConfig) -> String {
    if config.verbose {
        "dual_proxy=debug,tower_http=debug".to_string()
    } else {
        format!("dual_proxy={}", config.log_level)
    }
}

/// Install the global subscriber. Later calls are ignored.
pub fn init(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(config)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true),
        )
        .try_init();
}
