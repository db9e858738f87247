//! Backend calls.
//!
//! # Responsibilities
//! - Build the outbound request for a replay against one backend's base URL
//! - Enforce the response-header budget under the call's overall deadline
//! - Classify failures for the caller (502 vs 504)

use axum::body::Body;
use axum::http::{Response, StatusCode};
use hyper::body::Incoming;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::error::Error as _;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use url::Url;

use crate::capture::{RecordedRequest, Slot};
use crate::config::ProxyConfig;
use crate::http::request::{join_target, strip_hop_by_hop};
use crate::resilience::Deadlines;

/// Client shared by both backends.
pub type HttpClient = Client<HttpConnector, Body>;

/// Build the pooled backend client.
pub fn build_client(config: &ProxyConfig) -> HttpClient {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(config.timeouts.response_header()));
    connector.set_nodelay(true);

    Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(config.backends.max_idle_per_host)
        .build(connector)
}

/// Failure talking to one backend.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Base URL unusable (maps to 502 Bad Gateway)
    #[error("invalid {backend} backend URL {url:?}: {reason}")]
    InvalidBackend {
        backend: Slot,
        url: String,
        reason: String,
    },

    /// Request target cannot be joined onto the base URL (maps to 502 Bad Gateway)
    #[error("cannot address {backend} backend with target {target:?}")]
    InvalidTarget {
        backend: Slot,
        target: String,
        #[source]
        source: axum::http::Error,
    },

    /// No response head in time (maps to 504 Gateway Timeout)
    #[error("{backend} backend did not respond within {}ms", after.as_millis())]
    Timeout { backend: Slot, after: Duration },

    /// Connection or protocol failure (maps to 502 Bad Gateway)
    #[error("{backend} backend request failed")]
    Upstream {
        backend: Slot,
        #[source]
        source: hyper_util::client::legacy::Error,
    },
}

impl DispatchError {
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DispatchError::Timeout { .. })
    }

    /// The error and its causes on one line, e.g.
    /// `primary backend request failed: client error (Connect): tcp connect error: Connection refused`.
    pub fn caller_message(&self) -> String {
        let mut message = self.to_string();
        let mut source = self.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        message
    }
}

/// One configured backend.
#[derive(Debug, Clone)]
pub struct Upstream {
    slot: Slot,
    base: Url,
    client: HttpClient,
    deadlines: Deadlines,
}

impl Upstream {
    pub fn new(slot: Slot, base: &str, client: HttpClient, deadlines: Deadlines) -> Result<Self, DispatchError> {
        let invalid = |reason: String| DispatchError::InvalidBackend {
            backend: slot,
            url: base.to_string(),
            reason,
        };
        let base = Url::parse(base).map_err(|e| invalid(e.to_string()))?;
        if base.scheme() != "http" {
            return Err(invalid(format!("unsupported scheme {}", base.scheme())));
        }
        if base.host_str().is_none() {
            return Err(invalid("missing host".to_string()));
        }
        Ok(Self {
            slot,
            base,
            client,
            deadlines,
        })
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Send a replay and wait for the response head.
    ///
    /// The body is left streaming; the caller enforces `deadline` on it.
    pub async fn send(&self, request: RecordedRequest, deadline: Instant) -> Result<Response<Incoming>, DispatchError> {
        let uri = join_target(&self.base, request.target()).map_err(|source| DispatchError::InvalidTarget {
            backend: self.slot,
            target: request.target().to_string(),
            source,
        })?;

        let mut outbound = request.into_request(uri);
        strip_hop_by_hop(outbound.headers_mut());

        let budget = self.deadlines.header_budget(deadline);
        match tokio::time::timeout(budget, self.client.request(outbound)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(source)) => Err(DispatchError::Upstream {
                backend: self.slot,
                source,
            }),
            Err(_) => Err(DispatchError::Timeout {
                backend: self.slot,
                after: budget,
            }),
        }
    }
}
