//! TCP listener that can be drained.
//!
//! # Responsibilities
//! - Bind to the configured address
//! - Accept incoming TCP connections and count them while open
//! - On shutdown, stop accepting and wait for outstanding connections to close
//!
//! # Design Decisions
//! - The listener is consumed by `initiate_shutdown`, so nothing can be
//!   accepted once draining has started
//! - With a drain deadline, stragglers are told to close immediately once it passes

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::time::Instant;

use crate::net::connection::{ConnectionTracker, DrainingConnection};

/// How often an unbounded drain reports what it is still waiting for.
const DRAIN_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// How long forced connections get to notice the close before we stop waiting.
const FORCED_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Failed to bind to address.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    /// Failed to accept connection.
    #[error("Failed to accept: {0}")]
    Accept(#[source] std::io::Error),
}

/// Outcome of a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Connections still open when the drain deadline passed.
    pub forced: usize,
    pub elapsed: Duration,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.forced == 0
    }
}

/// A TCP listener whose accepted connections are counted until closed.
pub struct DrainingListener {
    inner: TcpListener,
    tracker: ConnectionTracker,
}

impl DrainingListener {
    /// Bind to `addr` (`host:port`).
    pub async fn bind(addr: &str) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind {
                addr: addr.to_string(),
                source,
            })?;

        if let Ok(local_addr) = listener.local_addr() {
            tracing::info!(address = %local_addr, "Listener bound");
        }

        Ok(Self::from_listener(listener))
    }

    /// Wrap an already bound listener.
    pub fn from_listener(inner: TcpListener) -> Self {
        Self {
            inner,
            tracker: ConnectionTracker::new(),
        }
    }

    /// Accept a new connection. The outstanding count rises only on success.
    pub async fn accept(&self) -> Result<DrainingConnection, ListenerError> {
        let (stream, peer) = self.inner.accept().await.map_err(ListenerError::Accept)?;
        let conn = DrainingConnection::new(stream, peer, &self.tracker);

        tracing::debug!(
            connection_id = %conn.id(),
            peer_addr = %peer,
            outstanding = self.tracker.outstanding(),
            "Connection accepted"
        );

        Ok(conn)
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }

    /// Connections accepted and not yet closed.
    pub fn outstanding(&self) -> usize {
        self.tracker.outstanding()
    }

    /// Stop accepting, ask open connections to finish, and wait for them.
    ///
    /// Without a deadline this waits as long as it takes. With one, any
    /// connection still open when it passes is told to close and counted in
    /// the report.
    pub async fn initiate_shutdown(self, deadline: Option<Duration>) -> DrainReport {
        let Self { inner, tracker } = self;
        drop(inner);

        let started = Instant::now();
        tracker.begin_drain();
        tracing::info!(outstanding = tracker.outstanding(), "Draining connections");

        let forced = match deadline {
            None => {
                drain_unbounded(&tracker).await;
                0
            }
            Some(limit) => {
                if tokio::time::timeout(limit, tracker.wait_idle()).await.is_ok() {
                    0
                } else {
                    let forced = tracker.outstanding();
                    tracing::warn!(forced, "Drain deadline passed, closing remaining connections");
                    tracker.force_close();
                    let _ = tokio::time::timeout(FORCED_CLOSE_GRACE, tracker.wait_idle()).await;
                    forced
                }
            }
        };

        let report = DrainReport {
            forced,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            forced = report.forced,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Drain complete"
        );
        report
    }
}

async fn drain_unbounded(tracker: &ConnectionTracker) {
    loop {
        match tokio::time::timeout(DRAIN_PROGRESS_INTERVAL, tracker.wait_idle()).await {
            Ok(()) => return,
            Err(_) => tracing::info!(
                outstanding = tracker.outstanding(),
                "Still draining connections"
            ),
        }
    }
}
