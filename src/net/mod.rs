//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, outstanding count)
//!     → connection.rs (lifecycle tracking, state machine)
//!     → Hand off to HTTP layer
//!
//! Connection States:
//!     Active → Draining → Closed
//! ```
//!
//! # Design Decisions
//! - Each connection is counted from accept until close or drop
//! - Closing twice never counts twice
//! - Draining is one-way: a drained listener cannot accept again

pub mod connection;
pub mod listener;

pub use connection::{ConnectionId, DrainState, DrainWatch, DrainingConnection};
pub use listener::{DrainReport, DrainingListener, ListenerError};
