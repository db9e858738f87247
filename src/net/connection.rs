//! Connection state machine and lifecycle tracking.
//!
//! # Responsibilities
//! - Track drain state (Active → Draining → Closed)
//! - Generate unique connection IDs for tracing
//! - Count outstanding connections and wake the drain when the count hits zero

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};

use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Drain state broadcast to every open connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    /// Serving normally.
    Active,
    /// Finish the in-flight request, then close.
    Draining,
    /// Drain deadline passed; close now.
    Closed,
}

#[derive(Debug)]
struct Shared {
    outstanding: AtomicUsize,
    idle: Notify,
    state: watch::Sender<DrainState>,
}

/// Counts outstanding connections for the drain.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionTracker {
    shared: Arc<Shared>,
}

impl ConnectionTracker {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(DrainState::Active);
        Self {
            shared: Arc::new(Shared {
                outstanding: AtomicUsize::new(0),
                idle: Notify::new(),
                state,
            }),
        }
    }

    /// Record a new connection. The count drops again when the guard is released.
    pub(crate) fn track(&self) -> ConnectionGuard {
        let now = self.shared.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_active_connections(now);
        ConnectionGuard {
            shared: Arc::clone(&self.shared),
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::SeqCst)
    }

    pub(crate) fn watch(&self) -> DrainWatch {
        DrainWatch {
            rx: self.shared.state.subscribe(),
        }
    }

    pub(crate) fn begin_drain(&self) {
        self.shared.state.send_replace(DrainState::Draining);
    }

    pub(crate) fn force_close(&self) {
        self.shared.state.send_replace(DrainState::Closed);
    }

    /// Wait until no connection is outstanding.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Keeps one connection counted while alive.
#[derive(Debug)]
pub(crate) struct ConnectionGuard {
    shared: Arc<Shared>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let previous = self
            .shared
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match previous {
            Ok(1) => {
                metrics::set_active_connections(0);
                self.shared.idle.notify_waiters();
            }
            Ok(n) => metrics::set_active_connections(n - 1),
            Err(_) => {
                debug_assert!(false, "connection released more often than tracked");
                tracing::error!("Connection count underflow prevented");
            }
        }
    }
}

/// Observes the drain state from a connection task.
#[derive(Debug, Clone)]
pub struct DrainWatch {
    rx: watch::Receiver<DrainState>,
}

impl DrainWatch {
    pub fn current(&self) -> DrainState {
        *self.rx.borrow()
    }

    /// Wait for the next state change. Never resolves once the listener is gone.
    pub async fn changed(&mut self) -> DrainState {
        if self.rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        *self.rx.borrow_and_update()
    }
}

/// An accepted connection counted by its listener until closed or dropped.
///
/// Only [`DrainingListener::accept`](crate::net::DrainingListener::accept)
/// creates these, so every release matches exactly one earlier increment.
#[derive(Debug)]
pub struct DrainingConnection {
    stream: TcpStream,
    peer: SocketAddr,
    id: ConnectionId,
    guard: Option<ConnectionGuard>,
    drain: DrainWatch,
}

impl DrainingConnection {
    pub(crate) fn new(stream: TcpStream, peer: SocketAddr, tracker: &ConnectionTracker) -> Self {
        Self {
            stream,
            peer,
            id: ConnectionId::new(),
            guard: Some(tracker.track()),
            drain: tracker.watch(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn drain_watch(&self) -> DrainWatch {
        self.drain.clone()
    }

    /// Whether this connection still counts as outstanding.
    pub fn is_open(&self) -> bool {
        self.guard.is_some()
    }

    /// Shut the stream down and stop counting it. Further calls do nothing.
    pub async fn close(&mut self) -> io::Result<()> {
        if self.guard.is_none() {
            return Ok(());
        }
        let result = self.stream.shutdown().await;
        self.release();
        result
    }

    fn release(&mut self) {
        if self.guard.take().is_some() {
            tracing::trace!(connection_id = %self.id, "Connection closed");
        }
    }
}

impl AsyncRead for DrainingConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for DrainingConnection {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let result = ready!(Pin::new(&mut self.stream).poll_shutdown(cx));
        self.release();
        Poll::Ready(result)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}
