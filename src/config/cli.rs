//! Command-line surface.
//!
//! Flags override the config file, which overrides built-in defaults.

use clap::Parser;
use std::path::PathBuf;

use crate::config::loader::{read_config, ConfigError};
use crate::config::schema::{ProxyConfig, RetentionPolicy};
use crate::config::validation::validate_config;

#[derive(Debug, Parser)]
#[command(name = "dual-proxy")]
#[command(
    about = "Forward every request to a primary and a secondary backend, answer from the primary and compare the two",
    long_about = None
)]
pub struct Cli {
    /// Log every proxied request
    #[arg(short, long)]
    pub verbose: bool,

    /// Address to listen on [default: :8080]
    #[arg(long = "http", value_name = "ADDR")]
    pub listen: Option<String>,

    /// Directory to capture requests and responses into [default: reqlog]
    #[arg(long, value_name = "PATH")]
    pub dir: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// What to delete once primary and secondary agree
    #[arg(long, value_enum)]
    pub retention: Option<RetentionPolicy>,

    /// Seconds to wait for open connections on shutdown (0 = no limit)
    #[arg(long, value_name = "SECS")]
    pub drain_timeout: Option<u64>,

    /// Append exchange events to <dir>/audit.log
    #[arg(long)]
    pub audit: bool,

    /// Expose Prometheus metrics on this address
    #[arg(long, value_name = "ADDR")]
    pub metrics: Option<String>,

    /// Primary backend base URL (source of truth)
    pub primary: Option<String>,

    /// Secondary backend base URL (candidate)
    pub secondary: Option<String>,
}

impl Cli {
    /// Merge file, flags and defaults into a validated configuration.
    pub fn into_config(self) -> Result<ProxyConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => read_config(path)?,
            None => ProxyConfig::default(),
        };

        if self.verbose {
            config.observability.verbose = true;
        }
        if let Some(listen) = self.listen {
            config.listener.bind_address = listen;
        }
        if let Some(dir) = self.dir {
            config.capture.dir = dir;
        }
        if let Some(retention) = self.retention {
            config.capture.retention = retention;
        }
        if let Some(secs) = self.drain_timeout {
            config.listener.drain_timeout_secs = secs;
        }
        if self.audit {
            config.capture.audit_log = true;
        }
        if let Some(addr) = self.metrics {
            config.observability.metrics_address = Some(addr);
        }
        if let Some(primary) = self.primary {
            config.backends.primary = primary;
        }
        if let Some(secondary) = self.secondary {
            config.backends.secondary = secondary;
        }

        validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }
}
