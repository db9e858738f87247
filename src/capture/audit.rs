//! Append-only exchange audit log.
//!
//! One JSON object per line in `<dir>/audit.log`. Callers only ever enqueue;
//! a single writer task owns the file.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};

use crate::capture::{ExchangeId, Slot};

pub const AUDIT_FILE: &str = "audit.log";

/// One line of the audit log.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub exchange: ExchangeId,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: AuditEvent,
}

impl AuditEntry {
    pub fn now(exchange: ExchangeId, event: AuditEvent) -> Self {
        Self {
            exchange,
            at: Utc::now(),
            event,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    Request {
        method: String,
        target: String,
        from: SocketAddr,
        body_bytes: u64,
    },
    Response {
        slot: Slot,
        status: u16,
    },
    Failure {
        slot: Slot,
        error: String,
    },
    Comparison {
        primary: u16,
        secondary: u16,
        mismatch: bool,
    },
}

enum Message {
    Entry(AuditEntry),
    Flush(oneshot::Sender<()>),
}

/// Handle to the audit writer. Cloning shares the same writer.
#[derive(Debug, Clone)]
pub struct AuditLog {
    tx: mpsc::UnboundedSender<Message>,
    path: PathBuf,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Entry(entry) => f.debug_tuple("Entry").field(entry).finish(),
            Message::Flush(_) => f.write_str("Flush"),
        }
    }
}

impl AuditLog {
    /// Open (appending) `<dir>/audit.log` and start the writer task.
    pub async fn open(dir: &Path) -> std::io::Result<Self> {
        let path = dir.join(AUDIT_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_entries(BufWriter::new(file), rx, path.clone()));
        Ok(Self { tx, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Enqueue an entry. Never blocks.
    pub fn record(&self, entry: AuditEntry) {
        if self.tx.send(Message::Entry(entry)).is_err() {
            tracing::warn!(path = %self.path.display(), "Audit writer is gone, entry dropped");
        }
    }

    /// Wait until every entry recorded so far has reached the file.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Message::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

async fn write_entries(
    mut out: BufWriter<tokio::fs::File>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    path: PathBuf,
) {
    while let Some(message) = rx.recv().await {
        let result = match message {
            Message::Entry(entry) => match serde_json::to_vec(&entry) {
                Ok(mut line) => {
                    line.push(b'\n');
                    out.write_all(&line).await
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to encode audit entry");
                    Ok(())
                }
            },
            Message::Flush(ack) => {
                let result = out.flush().await;
                let _ = ack.send(());
                result
            }
        };
        if let Err(e) = result {
            tracing::error!(path = %path.display(), error = %e, "Failed to write audit log");
        }
    }
    let _ = out.flush().await;
}
