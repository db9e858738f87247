//! Differential-testing reverse proxy library.
//!
//! Every inbound request is captured, sent to a primary and a secondary
//! backend, answered from the primary, and the two outcomes are compared in
//! the background.

// Core subsystems
pub mod capture;
pub mod config;
pub mod dispatch;
pub mod http;
pub mod net;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::ProxyConfig;
pub use dispatch::DualDispatcher;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use net::DrainingListener;
