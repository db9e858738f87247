//! Backend response capture.
//!
//! # Responsibilities
//! - Persist the primary response (`N.1`) while it streams to the caller
//! - Persist the secondary response (`N.2`) sequentially
//! - Prune artifacts of exchanges whose outcomes matched
//! - Load stored responses back for inspection
//!
//! # Design Decisions
//! - The caller never waits on disk: frames are handed to the caller and to a
//!   writer task in the same poll, the writer owns the file
//! - The writer queue is bounded; when the disk falls that far behind, the
//!   caller's stream waits for it instead of buffering the response in memory
//! - The writer learns whether the stream completed, so a response cut short by
//!   the caller or the deadline is reported as truncated, never as complete

use axum::http::{HeaderMap, Response, StatusCode};
use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use http_body_util::BodyExt;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, error::SendError, error::TrySendError, OwnedPermit};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};

use crate::capture::wire;
use crate::capture::{BoxError, CaptureError, Exchange, ReplayError, Slot};

/// Data frames queued for the primary capture writer before the caller waits.
const TEE_QUEUE_FRAMES: usize = 64;

/// Metadata of a persisted response.
#[derive(Debug, Clone)]
pub struct RecordedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub path: PathBuf,
    pub body_len: u64,
}

/// A stored response read back from disk.
#[derive(Debug)]
pub struct LoadedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Persists backend responses into their exchange slots.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseRecorder;

impl ResponseRecorder {
    pub fn new() -> Self {
        Self
    }

    /// Persist `response` into `slot`, reading its body to the end.
    pub async fn capture<B>(
        &self,
        exchange: &Exchange,
        slot: Slot,
        response: Response<B>,
    ) -> Result<RecordedResponse, CaptureError>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: Into<BoxError>,
    {
        let path = exchange.path(slot);
        let (parts, mut body) = response.into_parts();
        let mut file = create_with_head(&path, parts.status, &parts.headers).await?;

        let mut body_len = 0u64;
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| CaptureError::ReadBody(e.into()))?;
            if let Ok(data) = frame.into_data() {
                file.write_all(&data).await.map_err(CaptureError::io(&path))?;
                body_len += data.len() as u64;
            }
        }
        file.flush().await.map_err(CaptureError::io(&path))?;

        Ok(RecordedResponse {
            status: parts.status,
            headers: parts.headers,
            path,
            body_len,
        })
    }

    /// Persist the primary response while passing it through.
    ///
    /// Returns the response to hand to the caller and a handle that resolves
    /// once the stored copy is complete. The returned body fails with an
    /// error if it is still streaming at `deadline`. If the capture file
    /// cannot be created the untouched response comes back with the error.
    pub async fn tee<B>(
        &self,
        exchange: &Exchange,
        response: Response<B>,
        deadline: Instant,
    ) -> Result<(Response<TeeBody<B>>, PendingCapture), TeeError<B>>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: Into<BoxError>,
    {
        let path = exchange.path(Slot::Primary);
        let file = match create_with_head(&path, response.status(), response.headers()).await {
            Ok(file) => file,
            Err(error) => return Err(TeeError { error, response }),
        };
        let (parts, body) = response.into_parts();

        let (tx, rx) = mpsc::channel(TEE_QUEUE_FRAMES);
        let (done_tx, done_rx) = oneshot::channel();
        let meta = RecordedResponse {
            status: parts.status,
            headers: parts.headers.clone(),
            path,
            body_len: 0,
        };
        let writer = tokio::spawn(persist_stream(file, rx, done_rx, meta));

        let mut tee = TeeBody {
            inner: body,
            sink: Some(tx),
            done: Some(done_tx),
            waiting: None,
            deadline: Box::pin(tokio::time::sleep_until(deadline)),
        };
        if tee.inner.is_end_stream() {
            tee.finish();
        }

        Ok((Response::from_parts(parts, tee), PendingCapture { writer }))
    }

    /// Best-effort removal of a slot's file. Failures are logged, not returned.
    pub async fn prune(&self, exchange: &Exchange, slot: Slot) {
        let path = exchange.path(slot);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => tracing::debug!(exchange = %exchange.id(), slot = %slot, "Pruned capture"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                exchange = %exchange.id(),
                slot = %slot,
                path = %path.display(),
                error = %e,
                "Failed to prune capture"
            ),
        }
    }

    /// Read a stored response back.
    pub async fn load(&self, exchange: &Exchange, slot: Slot) -> Result<LoadedResponse, ReplayError> {
        let path = exchange.path(slot);
        let raw = tokio::fs::read(&path).await.map_err(ReplayError::io(&path))?;
        let head = wire::parse_response_head(&raw)
            .map_err(|reason| ReplayError::malformed(&path, reason))?
            .ok_or_else(|| ReplayError::malformed(&path, "incomplete head"))?;
        Ok(LoadedResponse {
            status: head.status,
            headers: head.headers,
            body: Bytes::from(raw).slice(head.len..),
        })
    }
}

async fn create_with_head(path: &Path, status: StatusCode, headers: &HeaderMap) -> Result<File, CaptureError> {
    let mut head = Vec::with_capacity(256);
    wire::write_response_head(&mut head, status, headers);
    let mut file = File::create(path).await.map_err(CaptureError::io(path))?;
    file.write_all(&head).await.map_err(CaptureError::io(path))?;
    Ok(file)
}

/// Writes queued frames until the tee lets go of the queue. The stream
/// completed only if `done` fired before that.
async fn persist_stream(
    mut file: File,
    mut chunks: mpsc::Receiver<Bytes>,
    mut done: oneshot::Receiver<()>,
    mut meta: RecordedResponse,
) -> Result<RecordedResponse, CaptureError> {
    while let Some(data) = chunks.recv().await {
        file.write_all(&data).await.map_err(CaptureError::io(&meta.path))?;
        meta.body_len += data.len() as u64;
    }
    file.flush().await.map_err(CaptureError::io(&meta.path))?;

    if done.try_recv().is_ok() {
        Ok(meta)
    } else {
        Err(CaptureError::Truncated {
            written: meta.body_len,
        })
    }
}

/// Resolves when the primary response has been fully persisted.
#[derive(Debug)]
pub struct PendingCapture {
    writer: JoinHandle<Result<RecordedResponse, CaptureError>>,
}

impl PendingCapture {
    pub async fn finished(self) -> Result<RecordedResponse, CaptureError> {
        self.writer.await.map_err(|_| CaptureError::WriterLost)?
    }
}

/// A tee that could not start. The response has not been read from.
#[derive(Debug)]
pub struct TeeError<B> {
    pub error: CaptureError,
    pub response: Response<B>,
}

/// Error yielded when a teed body is still streaming at its deadline.
#[derive(Debug, thiserror::Error)]
#[error("response body exceeded the overall call timeout")]
pub struct DeadlineElapsed;

type Reservation = Pin<Box<dyn Future<Output = Result<OwnedPermit<Bytes>, SendError<()>>> + Send>>;

/// Response body that copies every data frame to a capture writer.
pub struct TeeBody<B> {
    inner: B,
    sink: Option<mpsc::Sender<Bytes>>,
    done: Option<oneshot::Sender<()>>,
    /// A frame held back until the writer has room for its copy.
    waiting: Option<(Frame<Bytes>, Reservation)>,
    deadline: Pin<Box<Sleep>>,
}

impl<B> TeeBody<B> {
    fn finish(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
        self.sink = None;
    }

    fn abandon(&mut self) {
        self.done = None;
        self.sink = None;
        self.waiting = None;
    }

    /// Queue a copy of `data`. False when the queue is full.
    fn offer(&mut self, data: &Bytes) -> bool {
        let Some(sink) = &self.sink else {
            return true;
        };
        match sink.try_send(data.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Closed(_)) => {
                self.sink = None;
                true
            }
        }
    }

    /// Bookkeeping for a frame about to be handed to the caller.
    fn pass(&mut self, frame: Frame<Bytes>) -> Poll<Option<Result<Frame<Bytes>, BoxError>>>
    where
        B: Body,
    {
        // hyper stops polling once the body reports its end
        if self.inner.is_end_stream() {
            self.finish();
        }
        Poll::Ready(Some(Ok(frame)))
    }
}

impl<B: fmt::Debug> fmt::Debug for TeeBody<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeeBody")
            .field("inner", &self.inner)
            .field("capturing", &self.sink.is_some())
            .field("waiting", &self.waiting.is_some())
            .finish_non_exhaustive()
    }
}

impl<B> Body for TeeBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.deadline.as_mut().poll(cx).is_ready() {
            this.abandon();
            return Poll::Ready(Some(Err(DeadlineElapsed.into())));
        }

        loop {
            if let Some((frame, mut reservation)) = this.waiting.take() {
                match reservation.as_mut().poll(cx) {
                    Poll::Pending => {
                        this.waiting = Some((frame, reservation));
                        return Poll::Pending;
                    }
                    Poll::Ready(Ok(permit)) => {
                        if let Some(data) = frame.data_ref() {
                            let _ = permit.send(data.clone());
                        }
                    }
                    Poll::Ready(Err(_)) => this.sink = None,
                }
                return this.pass(frame);
            }

            match Pin::new(&mut this.inner).poll_frame(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    this.finish();
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(Err(e))) => {
                    this.abandon();
                    return Poll::Ready(Some(Err(e.into())));
                }
                Poll::Ready(Some(Ok(frame))) => {
                    let queued = match frame.data_ref() {
                        Some(data) => this.offer(data),
                        None => true,
                    };
                    if !queued {
                        if let Some(sink) = this.sink.clone() {
                            this.waiting = Some((frame, Box::pin(sink.reserve_owned())));
                            continue;
                        }
                    }
                    return this.pass(frame);
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.waiting.is_none() && self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
