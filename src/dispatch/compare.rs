//! Outcome of the secondary branch.

use axum::http::StatusCode;

use crate::capture::ExchangeId;

/// Primary and secondary statuses of one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompareResult {
    pub exchange: ExchangeId,
    pub primary: StatusCode,
    pub secondary: StatusCode,
    pub mismatch: bool,
}

impl CompareResult {
    pub fn new(exchange: ExchangeId, primary: StatusCode, secondary: StatusCode) -> Self {
        Self {
            exchange,
            primary,
            secondary,
            mismatch: primary != secondary,
        }
    }

    pub fn is_mismatch(&self) -> bool {
        self.mismatch
    }
}

/// Where a secondary branch gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShadowStage {
    /// Opening the secondary's replay.
    Replay,
    /// Calling the secondary backend.
    Dispatch,
    /// Persisting the secondary response.
    Capture,
}

impl ShadowStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShadowStage::Replay => "replay",
            ShadowStage::Dispatch => "dispatch",
            ShadowStage::Capture => "capture",
        }
    }
}

impl std::fmt::Display for ShadowStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published once per finished secondary branch.
#[derive(Debug, Clone)]
pub enum ShadowOutcome {
    Compared(CompareResult),
    Failed {
        exchange: ExchangeId,
        stage: ShadowStage,
        error: String,
    },
}

impl ShadowOutcome {
    pub fn exchange(&self) -> ExchangeId {
        match self {
            ShadowOutcome::Compared(result) => result.exchange,
            ShadowOutcome::Failed { exchange, .. } => *exchange,
        }
    }

    pub fn comparison(&self) -> Option<&CompareResult> {
        match self {
            ShadowOutcome::Compared(result) => Some(result),
            ShadowOutcome::Failed { .. } => None,
        }
    }
}
