//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for the dual proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, drain behavior).
    pub listener: ListenerConfig,

    /// The two backends every request is sent to.
    pub backends: BackendsConfig,

    /// Where and how exchanges are persisted.
    pub capture: CaptureConfig,

    /// Timeout configuration for backend calls.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address. A leading `:` (e.g. ":8080") binds every IPv4 interface.
    pub bind_address: String,

    /// Seconds to wait for in-flight connections on shutdown before forcing
    /// them closed. Zero waits for as long as it takes.
    pub drain_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: ":8080".to_string(),
            drain_timeout_secs: 0,
        }
    }
}

impl ListenerConfig {
    /// The bind address in a form `TcpListener::bind` accepts.
    pub fn socket_address(&self) -> String {
        match self.bind_address.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{}", port),
            None => self.bind_address.clone(),
        }
    }

    /// Drain deadline, `None` when the drain is unbounded.
    pub fn drain_timeout(&self) -> Option<Duration> {
        (self.drain_timeout_secs > 0).then(|| Duration::from_secs(self.drain_timeout_secs))
    }
}

/// Primary and secondary backend base URLs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendsConfig {
    /// Source of truth; its responses are returned to callers.
    pub primary: String,

    /// Candidate under evaluation; its responses are only captured and compared.
    pub secondary: String,

    /// Idle pooled connections kept per backend host.
    pub max_idle_per_host: usize,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            primary: String::new(),
            secondary: String::new(),
            max_idle_per_host: 4,
        }
    }
}

/// What to keep on disk once an exchange's outcomes are known to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Never delete anything.
    KeepAll,
    /// Delete the secondary response when statuses match.
    #[default]
    PruneSecondary,
    /// Delete the whole exchange when statuses match.
    PruneAll,
}

/// Capture settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Directory the `N.0`/`N.1`/`N.2` files are written into.
    pub dir: PathBuf,

    /// Retention policy applied after a matching comparison.
    pub retention: RetentionPolicy,

    /// Largest inbound request body accepted for capture.
    pub max_body_bytes: usize,

    /// Captured requests up to this size (head + body) are replayed from
    /// memory instead of being re-read from disk.
    pub replay_memory_threshold: usize,

    /// Append a JSON line per exchange event to `<dir>/audit.log`.
    pub audit_log: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("reqlog"),
            retention: RetentionPolicy::default(),
            max_body_bytes: 64 * 1024 * 1024,
            replay_memory_threshold: 64 * 1024,
            audit_log: false,
        }
    }
}

/// Timeout configuration for backend calls.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connect + response-header timeout in seconds. May equal
    /// `request_secs`; the header wait is always capped by what is left of
    /// the overall timeout.
    pub response_header_secs: u64,

    /// Overall call timeout (headers and body) in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            response_header_secs: 30,
            request_secs: 300,
        }
    }
}

impl TimeoutConfig {
    pub fn response_header(&self) -> Duration {
        Duration::from_secs(self.response_header_secs)
    }

    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log every proxied exchange at debug level.
    pub verbose: bool,

    /// Log level when not verbose (trace, debug, info, warn, error).
    pub log_level: String,

    /// Prometheus listener address; metrics are off when unset.
    pub metrics_address: Option<String>,

    /// Seconds to let detached secondary comparisons finish after the drain.
    pub shadow_grace_secs: u64,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            log_level: "info".to_string(),
            metrics_address: None,
            shadow_grace_secs: 5,
        }
    }
}
