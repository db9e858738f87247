//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to backend:
//!     → timeouts.rs (response-header budget, overall deadline)
//!     → On expiry: dispatch failure for that backend only
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - No retries: a replayed request reaches each backend at most once

pub mod timeouts;

pub use timeouts::Deadlines;
