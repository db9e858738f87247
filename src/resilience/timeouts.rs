//! Timeout enforcement.
//!
//! # Responsibilities
//! - Carry the response-header and overall call budgets for backend calls
//! - Compute how much of the header budget is left under an overall deadline
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - Timeout errors are distinct from other errors
//! - Timed-out requests return 504 Gateway Timeout

use std::time::Duration;
use tokio::time::Instant;

use crate::config::TimeoutConfig;

/// Time budgets applied to every backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadlines {
    /// Connect plus wait for the response head.
    pub response_header: Duration,
    /// The whole call, including streaming the response body.
    pub overall: Duration,
}

impl Deadlines {
    pub fn new(response_header: Duration, overall: Duration) -> Self {
        Self {
            response_header,
            overall,
        }
    }

    /// Overall deadline for a call starting now.
    pub fn overall_from_now(&self) -> Instant {
        Instant::now() + self.overall
    }

    /// Time allowed for the response head of a call that must finish by `deadline`.
    pub fn header_budget(&self, deadline: Instant) -> Duration {
        self.response_header
            .min(deadline.saturating_duration_since(Instant::now()))
    }
}

impl Default for Deadlines {
    fn default() -> Self {
        Self::from(&TimeoutConfig::default())
    }
}

impl From<&TimeoutConfig> for Deadlines {
    fn from(config: &TimeoutConfig) -> Self {
        Self::new(config.response_header(), config.request())
    }
}
