//! Dual dispatch subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound request
//!     → capture N.0 (fail: 500/413, no backend contacted)
//!     → open two independent replays
//!     → primary call (fail: 502/504, secondary skipped)
//!     → tee primary response to caller + N.1
//!     ╰→ detached: secondary call → N.2 → wait for N.1 → compare → retention
//! ```
//!
//! # Design Decisions
//! - Only the serving task holds the caller's response; the detached branch
//!   sees the exchange's files and the primary status, nothing else
//! - Each backend gets its own replay, so nothing one call does to its request
//!   can reach the other
//! - Secondary failures end the detached branch with a log line and an event

pub mod compare;
pub mod upstream;

pub use compare::{CompareResult, ShadowOutcome, ShadowStage};
pub use upstream::{build_client, DispatchError, HttpClient, Upstream};

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};
use tracing::Instrument;

use crate::capture::{
    AuditEntry, AuditEvent, AuditLog, Exchange, ExchangeId, PendingCapture, RecordedRequest,
    ReplayError, RequestRecorder, ResponseRecorder, SequenceAllocator, Slot, TeeError,
};
use crate::config::{ProxyConfig, RetentionPolicy};
use crate::http::request::strip_hop_by_hop;
use crate::http::response;
use crate::observability::metrics;
use crate::resilience::Deadlines;

/// Shadow outcomes kept for slow subscribers before they start lagging.
const EVENT_CAPACITY: usize = 256;

/// Sends every request to both backends and answers from the primary.
pub struct DualDispatcher {
    requests: RequestRecorder,
    responses: ResponseRecorder,
    primary: Upstream,
    secondary: Upstream,
    retention: RetentionPolicy,
    deadlines: Deadlines,
    audit: Option<AuditLog>,
    events: broadcast::Sender<ShadowOutcome>,
    shadows: Arc<ShadowCount>,
}

impl DualDispatcher {
    pub fn new(config: &ProxyConfig, sequence: Arc<SequenceAllocator>) -> Result<Self, DispatchError> {
        let client = build_client(config);
        let deadlines = Deadlines::from(&config.timeouts);
        let primary = Upstream::new(Slot::Primary, &config.backends.primary, client.clone(), deadlines)?;
        let secondary = Upstream::new(Slot::Secondary, &config.backends.secondary, client, deadlines)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            requests: RequestRecorder::new(
                config.capture.dir.clone(),
                sequence,
                config.capture.max_body_bytes,
                config.capture.replay_memory_threshold,
            ),
            responses: ResponseRecorder::new(),
            primary,
            secondary,
            retention: config.capture.retention,
            deadlines,
            audit: None,
            events,
            shadows: Arc::new(ShadowCount::default()),
        })
    }

    /// Record exchange events to `audit`.
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Outcomes of secondary branches finishing from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ShadowOutcome> {
        self.events.subscribe()
    }

    pub fn capture_dir(&self) -> &Path {
        self.requests.dir()
    }

    /// Secondary branches still running.
    pub fn shadows_in_flight(&self) -> usize {
        self.shadows.running.load(Ordering::SeqCst)
    }

    /// Wait up to `timeout` for running secondary branches. True if none is left.
    pub async fn wait_shadows(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.shadows.wait_idle())
            .await
            .is_ok()
    }

    /// Wait until queued audit entries are written.
    pub async fn flush_audit(&self) {
        if let Some(audit) = &self.audit {
            audit.flush().await;
        }
    }

    /// Handle one inbound request.
    ///
    /// Returns the primary's response (its body still streaming and being
    /// captured) or an error response. The secondary branch is started before
    /// returning and is not awaited.
    pub async fn dispatch(self: &Arc<Self>, peer: SocketAddr, request: Request<Body>) -> Response<Body> {
        let method = request.method().clone();
        let target = request
            .uri()
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| "/".to_string());

        let exchange = match self.requests.capture(request).await {
            Ok(exchange) => exchange,
            Err(e) => {
                tracing::error!(method = %method, target = %target, peer = %peer, error = %e, "Failed to capture request");
                metrics::record_exchange("capture_failed");
                return response::capture_failure(&e);
            }
        };
        let id = exchange.id();
        tracing::debug!(
            exchange = %id,
            method = %method,
            target = %target,
            peer = %peer,
            body_bytes = exchange.body_len(),
            "Request captured"
        );
        self.audit(
            id,
            AuditEvent::Request {
                method: method.to_string(),
                target,
                from: peer,
                body_bytes: exchange.body_len(),
            },
        );

        let primary_request = match self.requests.open_replay(&exchange).await {
            Ok(replay) => replay,
            Err(e) => {
                tracing::error!(exchange = %id, error = %e, "Failed to open primary replay");
                metrics::record_exchange("capture_failed");
                return response::replay_failure();
            }
        };
        let secondary_request = self.requests.open_replay(&exchange).await;

        let started = Instant::now();
        let deadline = self.deadlines.overall_from_now();
        let upstream = match self.primary.send(primary_request, deadline).await {
            Ok(upstream) => upstream,
            Err(e) => {
                let detail = e.caller_message();
                tracing::error!(exchange = %id, backend = %self.primary.base(), error = %detail, "Primary request failed");
                self.audit(
                    id,
                    AuditEvent::Failure {
                        slot: Slot::Primary,
                        error: detail,
                    },
                );
                metrics::record_exchange(if e.is_timeout() { "primary_timeout" } else { "primary_failed" });
                return response::gateway_error(&e);
            }
        };

        let status = upstream.status();
        metrics::record_primary(status.as_u16(), started);
        tracing::debug!(exchange = %id, status = status.as_u16(), "Primary responded");
        self.audit(
            id,
            AuditEvent::Response {
                slot: Slot::Primary,
                status: status.as_u16(),
            },
        );

        let mut upstream = upstream;
        strip_hop_by_hop(upstream.headers_mut());
        let (caller_response, primary_capture) = match self.responses.tee(&exchange, upstream, deadline).await {
            Ok((teed, pending)) => (teed.map(Body::new), Some(pending)),
            Err(TeeError { error, response }) => {
                tracing::error!(exchange = %id, error = %error, "Failed to capture primary response, forwarding it uncaptured");
                (response.map(Body::new), None)
            }
        };

        self.spawn_shadow(exchange, status, secondary_request, primary_capture);
        metrics::record_exchange("forwarded");
        caller_response
    }

    fn spawn_shadow(
        self: &Arc<Self>,
        exchange: Exchange,
        primary_status: StatusCode,
        request: Result<RecordedRequest, ReplayError>,
        primary_capture: Option<PendingCapture>,
    ) {
        let guard = self.shadows.enter();
        let this = Arc::clone(self);
        let span = tracing::debug_span!("shadow", exchange = %exchange.id());

        tokio::spawn(
            async move {
                let outcome = this.shadow(&exchange, primary_status, request, primary_capture).await;
                this.publish(outcome);
                drop(guard);
            }
            .instrument(span),
        );
    }

    async fn shadow(
        &self,
        exchange: &Exchange,
        primary_status: StatusCode,
        request: Result<RecordedRequest, ReplayError>,
        primary_capture: Option<PendingCapture>,
    ) -> ShadowOutcome {
        let id = exchange.id();
        let failed = |stage: ShadowStage, error: String| ShadowOutcome::Failed {
            exchange: id,
            stage,
            error,
        };

        let request = match request {
            Ok(request) => request,
            Err(e) => return failed(ShadowStage::Replay, e.to_string()),
        };

        let deadline = self.deadlines.overall_from_now();
        let mut upstream = match self.secondary.send(request, deadline).await {
            Ok(upstream) => upstream,
            Err(e) => return failed(ShadowStage::Dispatch, e.caller_message()),
        };
        let secondary_status = upstream.status();
        self.audit(
            id,
            AuditEvent::Response {
                slot: Slot::Secondary,
                status: secondary_status.as_u16(),
            },
        );

        strip_hop_by_hop(upstream.headers_mut());
        let capture = self.responses.capture(exchange, Slot::Secondary, upstream);
        match tokio::time::timeout_at(deadline, capture).await {
            Ok(Ok(recorded)) => {
                tracing::debug!(status = recorded.status.as_u16(), body_bytes = recorded.body_len, "Secondary captured");
            }
            Ok(Err(e)) => return failed(ShadowStage::Capture, e.to_string()),
            Err(_) => {
                return failed(
                    ShadowStage::Capture,
                    "secondary response body exceeded the overall call timeout".to_string(),
                )
            }
        }

        // The primary's stored copy must be settled before its files can be judged.
        let primary_complete = match primary_capture {
            Some(pending) => match pending.finished().await {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!(error = %e, "Primary capture incomplete");
                    false
                }
            },
            None => false,
        };

        let result = CompareResult::new(id, primary_status, secondary_status);
        if result.is_mismatch() {
            tracing::warn!(
                exchange = %id,
                primary = primary_status.as_u16(),
                secondary = secondary_status.as_u16(),
                "Status mismatch"
            );
        } else {
            tracing::debug!(status = primary_status.as_u16(), "Statuses match");
            self.apply_retention(exchange, primary_complete).await;
        }
        ShadowOutcome::Compared(result)
    }

    /// Delete what the retention policy does not keep for a matching exchange.
    async fn apply_retention(&self, exchange: &Exchange, primary_complete: bool) {
        match self.retention {
            RetentionPolicy::KeepAll => {}
            RetentionPolicy::PruneSecondary => {
                self.responses.prune(exchange, Slot::Secondary).await;
            }
            RetentionPolicy::PruneAll => {
                self.responses.prune(exchange, Slot::Secondary).await;
                if primary_complete {
                    self.responses.prune(exchange, Slot::Primary).await;
                    self.responses.prune(exchange, Slot::Request).await;
                }
            }
        }
    }

    fn publish(&self, outcome: ShadowOutcome) {
        match &outcome {
            ShadowOutcome::Compared(result) => {
                metrics::record_comparison(result.mismatch);
                self.audit(
                    result.exchange,
                    AuditEvent::Comparison {
                        primary: result.primary.as_u16(),
                        secondary: result.secondary.as_u16(),
                        mismatch: result.mismatch,
                    },
                );
            }
            ShadowOutcome::Failed { exchange, stage, error } => {
                tracing::warn!(
                    exchange = %exchange,
                    stage = %stage,
                    backend = %self.secondary.base(),
                    error = %error,
                    "Secondary branch failed"
                );
                metrics::record_secondary_failure(stage.as_str());
                self.audit(
                    *exchange,
                    AuditEvent::Failure {
                        slot: Slot::Secondary,
                        error: error.clone(),
                    },
                );
            }
        }
        // No subscribers is fine.
        let _ = self.events.send(outcome);
    }

    fn audit(&self, exchange: ExchangeId, event: AuditEvent) {
        if let Some(audit) = &self.audit {
            audit.record(AuditEntry::now(exchange, event));
        }
    }
}

/// Running secondary branches.
#[derive(Debug, Default)]
struct ShadowCount {
    running: AtomicUsize,
    idle: Notify,
}

impl ShadowCount {
    fn enter(self: &Arc<Self>) -> ShadowGuard {
        self.running.fetch_add(1, Ordering::SeqCst);
        ShadowGuard(Arc::clone(self))
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.running.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct ShadowGuard(Arc<ShadowCount>);

impl Drop for ShadowGuard {
    fn drop(&mut self) {
        if self.0.running.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}
