//! Startup orchestration.
//!
//! # Responsibilities
//! - Prepare the capture directory and resume the exchange sequence
//! - Initialize subsystems in dependency order
//! - Bind the listener and hand everything to the HTTP server
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - Listener binds last (traffic only when ready)

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::capture::{highest_exchange_id, AuditLog, SequenceAllocator};
use crate::config::ProxyConfig;
use crate::dispatch::{DispatchError, DualDispatcher};
use crate::http::HttpServer;
use crate::net::{DrainReport, DrainingListener, ListenerError};

/// Error type for startup.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to create capture directory {}: {source}", path.display())]
    CaptureDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to scan capture directory {}: {source}", path.display())]
    ScanCaptureDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open audit log in {}: {source}", path.display())]
    AuditLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// A bound, ready-to-serve proxy.
pub struct Proxy {
    server: HttpServer,
    listener: DrainingListener,
    dispatcher: Arc<DualDispatcher>,
    shadow_grace: Duration,
}

impl Proxy {
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    pub fn dispatcher(&self) -> &Arc<DualDispatcher> {
        &self.dispatcher
    }

    /// Serve until `shutdown` fires, drain connections, then give running
    /// secondary branches their grace period and flush the audit log.
    pub async fn run(self, shutdown: broadcast::Receiver<()>) -> Result<DrainReport, std::io::Error> {
        let Self {
            server,
            listener,
            dispatcher,
            shadow_grace,
        } = self;

        let report = server.run(listener, shutdown).await?;

        let running = dispatcher.shadows_in_flight();
        if running > 0 {
            tracing::info!(running, grace_secs = shadow_grace.as_secs(), "Waiting for secondary requests");
            if !dispatcher.wait_shadows(shadow_grace).await {
                tracing::warn!(
                    abandoned = dispatcher.shadows_in_flight(),
                    "Secondary requests still running after grace period"
                );
            }
        }
        dispatcher.flush_audit().await;

        Ok(report)
    }
}

/// Build every subsystem from `config` and bind the listener.
pub async fn start(config: &ProxyConfig) -> Result<Proxy, StartupError> {
    let dir = &config.capture.dir;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| StartupError::CaptureDir {
            path: dir.clone(),
            source,
        })?;

    let last = highest_exchange_id(dir)
        .await
        .map_err(|source| StartupError::ScanCaptureDir {
            path: dir.clone(),
            source,
        })?;
    if last > 0 {
        tracing::info!(last_exchange = last, dir = %dir.display(), "Resuming after existing captures");
    }
    let sequence = Arc::new(SequenceAllocator::starting_after(last));

    let mut dispatcher = DualDispatcher::new(config, sequence)?;
    if config.capture.audit_log {
        let audit = AuditLog::open(dir).await.map_err(|source| StartupError::AuditLog {
            path: dir.clone(),
            source,
        })?;
        tracing::info!(path = %audit.path().display(), "Audit log enabled");
        dispatcher = dispatcher.with_audit(audit);
    }
    let dispatcher = Arc::new(dispatcher);

    tracing::info!(
        primary = %config.backends.primary,
        secondary = %config.backends.secondary,
        dir = %dir.display(),
        retention = ?config.capture.retention,
        "Dual dispatch configured"
    );

    let server = HttpServer::new(config, Arc::clone(&dispatcher));
    let listener = DrainingListener::bind(&config.listener.socket_address()).await?;

    Ok(Proxy {
        server,
        listener,
        dispatcher,
        shadow_grace: Duration::from_secs(config.observability.shadow_grace_secs),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Shutdown;

    fn config(dir: &std::path::Path) -> ProxyConfig {
        let mut config = ProxyConfig::default();
        config.listener.bind_address = "127.0.0.1:0".to_string();
        config.backends.primary = "http://127.0.0.1:1".to_string();
        config.backends.secondary = "http://127.0.0.1:2".to_string();
        config.capture.dir = dir.to_path_buf();
        config
    }

    #[tokio::test]
    async fn creates_nested_capture_dir() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("a").join("b");

        let proxy = start(&config(&dir)).await.unwrap();
        assert!(dir.is_dir());
        assert_ne!(proxy.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn shutdown_sent_before_run_still_drains() {
        let root = tempfile::tempdir().unwrap();
        let proxy = start(&config(root.path())).await.unwrap();

        let shutdown = Shutdown::new();
        let signal = shutdown.subscribe();
        shutdown.trigger();

        let report = tokio::time::timeout(Duration::from_secs(2), proxy.run(signal))
            .await
            .expect("early shutdown was lost")
            .unwrap();
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn unusable_capture_dir_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();

        let result = start(&config(&file)).await;
        assert!(matches!(result, Err(StartupError::CaptureDir { .. })));
    }

    #[tokio::test]
    async fn taken_address_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();

        let mut config = config(root.path());
        config.listener.bind_address = taken.local_addr().unwrap().to_string();
        let result = start(&config).await;
        assert!(matches!(result, Err(StartupError::Listener(ListenerError::Bind { .. }))));
    }
}
