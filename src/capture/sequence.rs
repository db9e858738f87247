//! Exchange id allocation.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::capture::ExchangeId;

/// Hands out strictly increasing exchange ids to concurrent callers.
///
/// Relaxed ordering is enough: only uniqueness and monotonicity of the
/// counter itself matter, no other memory is published through it.
#[derive(Debug, Default)]
pub struct SequenceAllocator {
    last: AtomicU64,
}

impl SequenceAllocator {
    /// Allocator whose first id is 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator whose first id is `last + 1`.
    pub fn starting_after(last: u64) -> Self {
        Self {
            last: AtomicU64::new(last),
        }
    }

    pub fn next(&self) -> ExchangeId {
        ExchangeId::new(self.last.fetch_add(1, Ordering::Relaxed) + 1)
    }
}
