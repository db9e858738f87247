//! Capture subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound request
//!     → sequence.rs (allocate exchange id N)
//!     → request.rs (persist N.0, hand out independent replays)
//!     → [dispatch to primary / secondary]
//!     → response.rs (persist N.1 while streaming to caller, N.2 sequentially)
//!     → audit.rs (optional JSON-lines event log)
//! ```
//!
//! # Design Decisions
//! - One exchange owns three uniquely named files; nothing is shared across exchanges
//! - The inbound body is drained into storage before any replay is opened
//! - Replays are reconstituted from the stored bytes, never from the live stream

pub mod audit;
pub mod request;
pub mod response;
pub mod sequence;
pub mod wire;

use bytes::Bytes;
use serde::{Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub use audit::{AuditEntry, AuditEvent, AuditLog};
pub use request::{RecordedRequest, ReplayBody, RequestRecorder};
pub use response::{
    LoadedResponse, PendingCapture, RecordedResponse, ResponseRecorder, TeeBody, TeeError,
};
pub use sequence::SequenceAllocator;

/// Boxed error used for body streams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Monotonically increasing exchange identifier.
///
/// Displays zero-padded to nine digits, which is also its file stem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExchangeId(u64);

impl ExchangeId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:09}", self.0)
    }
}

impl Serialize for ExchangeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Which artifact of an exchange a file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    /// `N.0`: the inbound request.
    Request,
    /// `N.1`: the primary backend's response.
    Primary,
    /// `N.2`: the secondary backend's response.
    Secondary,
}

impl Slot {
    /// File extension of this slot.
    pub fn index(&self) -> u8 {
        match self {
            Slot::Request => 0,
            Slot::Primary => 1,
            Slot::Secondary => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Slot::Request => "request",
            Slot::Primary => "primary",
            Slot::Secondary => "secondary",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One inbound request and its backend responses.
///
/// Cheap to clone; clones refer to the same files and share the replay count.
#[derive(Debug, Clone)]
pub struct Exchange {
    id: ExchangeId,
    dir: PathBuf,
    /// Full captured request message, kept when small enough to replay from memory.
    spool: Option<Bytes>,
    body_len: u64,
    replays: Arc<AtomicU32>,
}

impl Exchange {
    pub(crate) fn new(dir: &Path, id: ExchangeId) -> Self {
        Self {
            id,
            dir: dir.to_path_buf(),
            spool: None,
            body_len: 0,
            replays: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Re-attach to an exchange already on disk, e.g. for offline inspection.
    pub fn open(dir: &Path, id: ExchangeId) -> Self {
        Self::new(dir, id)
    }

    pub fn id(&self) -> ExchangeId {
        self.id
    }

    /// Path of the file holding `slot`.
    pub fn path(&self, slot: Slot) -> PathBuf {
        self.dir.join(format!("{}.{}", self.id, slot.index()))
    }

    /// Size of the captured request body.
    pub fn body_len(&self) -> u64 {
        self.body_len
    }

    /// How many replays have been issued so far.
    pub fn replay_count(&self) -> u32 {
        self.replays.load(Ordering::Relaxed)
    }

    pub(crate) fn spool(&self) -> Option<&Bytes> {
        self.spool.as_ref()
    }

    pub(crate) fn set_spool(&mut self, raw: Bytes) {
        self.spool = Some(raw);
    }

    pub(crate) fn set_body_len(&mut self, len: u64) {
        self.body_len = len;
    }

    pub(crate) fn next_replay(&self) -> u32 {
        self.replays.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Failure to persist part of an exchange.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to read body: {0}")]
    ReadBody(#[source] BoxError),

    #[error("body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("body stream ended after {written} bytes without completing")]
    Truncated { written: u64 },

    #[error("capture writer stopped unexpectedly")]
    WriterLost,
}

impl CaptureError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> CaptureError + '_ {
        move |source| CaptureError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Failure to reconstitute a stored message.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed capture {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },
}

impl ReplayError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> ReplayError + '_ {
        move |source| ReplayError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn malformed(path: &Path, reason: impl Into<String>) -> ReplayError {
        ReplayError::Malformed {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// Highest exchange id with any artifact in `dir`, or 0 when there is none.
pub async fn highest_exchange_id(dir: &Path) -> std::io::Result<u64> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut highest = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some((stem, ext)) = name.split_once('.') else { continue };
        if !matches!(ext, "0" | "1" | "2") {
            continue;
        }
        if let Ok(id) = stem.parse::<u64>() {
            highest = highest.max(id);
        }
    }
    Ok(highest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_paths_are_zero_padded() {
        let exchange = Exchange::new(Path::new("reqlog"), ExchangeId::new(42));
        assert_eq!(exchange.path(Slot::Request), PathBuf::from("reqlog/000000042.0"));
        assert_eq!(exchange.path(Slot::Primary), PathBuf::from("reqlog/000000042.1"));
        assert_eq!(exchange.path(Slot::Secondary), PathBuf::from("reqlog/000000042.2"));
    }

    #[tokio::test]
    async fn highest_id_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["000000003.0", "000000007.1", "000000009.tmp", "audit.log", "12.2"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        assert_eq!(highest_exchange_id(dir.path()).await.unwrap(), 12);
    }

    #[tokio::test]
    async fn highest_id_of_empty_dir_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(highest_exchange_id(dir.path()).await.unwrap(), 0);
    }
}
