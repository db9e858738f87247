//! Shared utilities for integration and load testing.
#![allow(dead_code)]

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, Response, StatusCode},
    Router,
};
use dual_proxy::capture::{ExchangeId, Slot};
use dual_proxy::dispatch::{DualDispatcher, ShadowOutcome};
use dual_proxy::lifecycle::{self, Shutdown};
use dual_proxy::net::DrainReport;
use dual_proxy::ProxyConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// What a mock backend answers with.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub body: &'static str,
    pub delay: Duration,
    /// Pause between sending the head and the body.
    pub body_delay: Duration,
    pub name: &'static str,
}

impl Reply {
    pub fn new(status: u16, body: &'static str) -> Self {
        Self {
            status,
            body,
            delay: Duration::ZERO,
            body_delay: Duration::ZERO,
            name: "backend",
        }
    }

    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Send the head at once but hold the body back for `delay`.
    pub fn stall_body(mut self, delay: Duration) -> Self {
        self.body_delay = delay;
        self
    }
}

#[derive(Default)]
struct Seen {
    hits: AtomicUsize,
    requests: Mutex<Vec<(HeaderMap, Bytes)>>,
}

/// A running programmable backend.
pub struct MockBackend {
    pub addr: SocketAddr,
    seen: Arc<Seen>,
}

impl MockBackend {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.seen.hits.load(Ordering::SeqCst)
    }

    /// Headers and body of every request received so far.
    pub fn requests(&self) -> Vec<(HeaderMap, Bytes)> {
        self.seen.requests.lock().unwrap().clone()
    }
}

/// Start a programmable mock backend on an ephemeral port.
pub async fn start_backend(reply: Reply) -> MockBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Seen::default());

    let app = Router::new()
        .fallback(answer)
        .with_state((reply, Arc::clone(&seen)));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    MockBackend { addr, seen }
}

async fn answer(
    State((reply, seen)): State<(Reply, Arc<Seen>)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response<Body> {
    seen.hits.fetch_add(1, Ordering::SeqCst);
    seen.requests.lock().unwrap().push((headers, body));
    if !reply.delay.is_zero() {
        tokio::time::sleep(reply.delay).await;
    }
    let body = if reply.body_delay.is_zero() {
        Body::from(reply.body)
    } else {
        let (delay, text) = (reply.body_delay, reply.body);
        Body::from_stream(futures_util::stream::once(async move {
            tokio::time::sleep(delay).await;
            Ok::<_, std::io::Error>(Bytes::from_static(text.as_bytes()))
        }))
    };
    Response::builder()
        .status(StatusCode::from_u16(reply.status).unwrap())
        .header("x-backend", reply.name)
        .header("content-type", "text/plain")
        .body(body)
        .unwrap()
}

/// URL of a port nothing listens on.
pub fn refused_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

/// A proxy running in-process against a temporary capture directory.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub dir: TempDir,
    pub dispatcher: Arc<DualDispatcher>,
    shutdown: Shutdown,
    handle: JoinHandle<std::io::Result<DrainReport>>,
}

impl TestProxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn capture_path(&self, id: u64, slot: Slot) -> PathBuf {
        self.dir
            .path()
            .join(format!("{}.{}", ExchangeId::new(id), slot.index()))
    }

    pub fn events(&self) -> broadcast::Receiver<ShadowOutcome> {
        self.dispatcher.subscribe()
    }

    /// Signal shutdown without waiting for the drain.
    pub fn trigger_shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Shut down and wait for the drain to finish.
    pub async fn stop(self) -> DrainReport {
        self.shutdown.trigger();
        self.handle.await.unwrap().unwrap()
    }

    /// Wait for the drain after `trigger_shutdown`.
    pub async fn join(self) -> DrainReport {
        self.handle.await.unwrap().unwrap()
    }
}

pub async fn start_proxy(primary: &str, secondary: &str) -> TestProxy {
    start_proxy_with(primary, secondary, tempfile::tempdir().unwrap(), |_| {}).await
}

/// Start a proxy in `dir`, letting `tweak` adjust the config first.
pub async fn start_proxy_with(
    primary: &str,
    secondary: &str,
    dir: TempDir,
    tweak: impl FnOnce(&mut ProxyConfig),
) -> TestProxy {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.backends.primary = primary.to_string();
    config.backends.secondary = secondary.to_string();
    config.capture.dir = dir.path().to_path_buf();
    tweak(&mut config);

    let proxy = lifecycle::start(&config).await.unwrap();
    let addr = proxy.local_addr().unwrap();
    let dispatcher = Arc::clone(proxy.dispatcher());

    let shutdown = Shutdown::new();
    let handle = tokio::spawn(proxy.run(shutdown.subscribe()));

    TestProxy {
        addr,
        dir,
        dispatcher,
        shutdown,
        handle,
    }
}

/// Client that never goes through a system proxy.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

/// Next shadow outcome, failing the test after a few seconds.
pub async fn next_outcome(events: &mut broadcast::Receiver<ShadowOutcome>) -> ShadowOutcome {
    tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("secondary branch did not finish")
        .unwrap()
}
