//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the proxy handler
//! - Wire up middleware (request tracing)
//! - Drive HTTP/1.1 connections from the draining listener
//! - On shutdown: stop accepting, finish in-flight requests, drain

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    response::Response,
    Router,
};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;

use crate::config::ProxyConfig;
use crate::dispatch::DualDispatcher;
use crate::net::{DrainReport, DrainState, DrainingConnection, DrainingListener};

/// Pause after a failed accept (e.g. out of file descriptors) before retrying.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// HTTP server for the dual proxy.
pub struct HttpServer {
    router: Router,
    drain_timeout: Option<Duration>,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: &ProxyConfig, dispatcher: Arc<DualDispatcher>) -> Self {
        Self {
            router: Self::build_router(dispatcher),
            drain_timeout: config.listener.drain_timeout(),
        }
    }

    /// Build the Axum router with all middleware layers.
    ///
    /// No router-wide timeout: backend calls carry their own deadlines and
    /// answer 504 when one passes.
    fn build_router(dispatcher: Arc<DualDispatcher>) -> Router {
        Router::new()
            .fallback(proxy_handler)
            .with_state(dispatcher)
            .layer(TraceLayer::new_for_http())
    }

    /// Serve connections from `listener` until `shutdown` fires, then drain.
    pub async fn run(
        self,
        listener: DrainingListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<DrainReport, std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => {
                        tokio::spawn(serve_connection(conn, self.router.clone()));
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping new connections");
                    break;
                }
            }
        }

        let report = listener.initiate_shutdown(self.drain_timeout).await;
        tracing::info!("HTTP server stopped");
        Ok(report)
    }
}

/// Drive one connection until it ends, following the listener's drain state.
async fn serve_connection(conn: DrainingConnection, router: Router) {
    let connection_id = conn.id();
    let peer = conn.peer_addr();
    let mut drain = conn.drain_watch();

    let service = hyper::service::service_fn(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(peer));
        router.clone().oneshot(request)
    });

    let connection = http1::Builder::new().serve_connection(TokioIo::new(conn), service);
    tokio::pin!(connection);

    if drain.current() != DrainState::Active {
        connection.as_mut().graceful_shutdown();
    }

    loop {
        tokio::select! {
            result = connection.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!(connection_id = %connection_id, error = %e, "Connection error");
                }
                break;
            }
            state = drain.changed() => match state {
                DrainState::Active => {}
                DrainState::Draining => {
                    tracing::debug!(connection_id = %connection_id, "Finishing in-flight request before close");
                    connection.as_mut().graceful_shutdown();
                }
                DrainState::Closed => {
                    tracing::warn!(connection_id = %connection_id, peer = %peer, "Drain deadline passed, dropping connection");
                    break;
                }
            }
        }
    }
}

/// Main proxy handler: every method and path goes through the dual dispatcher.
async fn proxy_handler(
    State(dispatcher): State<Arc<DualDispatcher>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    dispatcher.dispatch(peer, request).await
}
