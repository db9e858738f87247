//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Draining connection
//!     → server.rs (hyper http1 connection, Axum router, drain handling)
//!     → [dual dispatcher]
//!         → request.rs (hop-by-hop stripping, backend URI)
//!         → response.rs (error responses)
//!     → Send to client
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use server::HttpServer;
