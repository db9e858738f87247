//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML, optional)
//!     → loader.rs (parse & deserialize)
//!     → cli.rs (command-line flags layered on top)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → handed to startup, then shared by the subsystems that need it
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; there is no live reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod cli;
pub mod loader;
pub mod schema;
pub mod validation;

pub use cli::Cli;
pub use loader::{load_config, ConfigError};
pub use schema::{
    BackendsConfig, CaptureConfig, ListenerConfig, ObservabilityConfig, ProxyConfig,
    RetentionPolicy, TimeoutConfig,
};
pub use validation::ValidationError;
