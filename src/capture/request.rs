//! Inbound request capture and replay.
//!
//! # Responsibilities
//! - Drain the inbound body and persist the whole request as `N.0`
//! - Reconstitute any number of independent requests from the stored bytes
//!
//! # Design Decisions
//! - The stored message carries an exact `Content-Length`, so `N.0` is a valid
//!   request on its own regardless of how the caller framed its body
//! - Small captures are replayed from an in-memory copy, larger ones are re-read
//!   from disk through a handle owned by that replay alone

use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use axum::http::{HeaderMap, HeaderValue, Method, Request, Uri};
use bytes::{Bytes, BytesMut};
use http_body::{Frame, SizeHint};
use http_body_util::BodyExt;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, ReadBuf};

use crate::capture::wire::{self, MAX_HEAD_BYTES};
use crate::capture::{CaptureError, Exchange, ReplayError, SequenceAllocator, Slot};

const READ_CHUNK: usize = 16 * 1024;

/// Persists inbound requests and hands out replays of them.
#[derive(Debug, Clone)]
pub struct RequestRecorder {
    dir: PathBuf,
    sequence: Arc<SequenceAllocator>,
    max_body_bytes: usize,
    memory_threshold: usize,
}

impl RequestRecorder {
    pub fn new(
        dir: impl Into<PathBuf>,
        sequence: Arc<SequenceAllocator>,
        max_body_bytes: usize,
        memory_threshold: usize,
    ) -> Self {
        Self {
            dir: dir.into(),
            sequence,
            max_body_bytes,
            memory_threshold,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Allocate an exchange and write the complete request to `N.0`.
    ///
    /// The inbound body is consumed entirely. On error nothing may be
    /// dispatched for this exchange.
    pub async fn capture(&self, request: Request<Body>) -> Result<Exchange, CaptureError> {
        let mut exchange = Exchange::new(&self.dir, self.sequence.next());
        let (parts, body) = request.into_parts();
        let body = read_body(body, self.max_body_bytes).await?;

        let target = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let headers = framed_headers(&parts.headers, body.len());

        let mut raw = Vec::with_capacity(512 + body.len());
        wire::write_request_head(&mut raw, &parts.method, target, &headers);
        raw.extend_from_slice(&body);

        let path = exchange.path(Slot::Request);
        let mut file = File::create(&path).await.map_err(CaptureError::io(&path))?;
        file.write_all(&raw).await.map_err(CaptureError::io(&path))?;
        file.flush().await.map_err(CaptureError::io(&path))?;
        drop(file);

        exchange.set_body_len(body.len() as u64);
        if raw.len() <= self.memory_threshold {
            exchange.set_spool(Bytes::from(raw));
        }
        Ok(exchange)
    }

    /// Open a fresh, fully independent request from the stored bytes.
    pub async fn open_replay(&self, exchange: &Exchange) -> Result<RecordedRequest, ReplayError> {
        let path = exchange.path(Slot::Request);
        let (head, body) = match exchange.spool() {
            Some(raw) => replay_from_memory(&path, raw)?,
            None => replay_from_disk(&path).await?,
        };
        Ok(RecordedRequest {
            method: head.method,
            target: head.target,
            headers: head.headers,
            body,
            replay: exchange.next_replay(),
        })
    }
}

/// Headers as stored: explicit length, no transfer coding.
fn framed_headers(headers: &HeaderMap, body_len: usize) -> HeaderMap {
    let mut framed = headers.clone();
    framed.remove(TRANSFER_ENCODING);
    let had_length = framed.remove(CONTENT_LENGTH).is_some();
    if body_len > 0 || had_length {
        framed.insert(CONTENT_LENGTH, HeaderValue::from(body_len));
    }
    framed
}

async fn read_body(mut body: Body, limit: usize) -> Result<Bytes, CaptureError> {
    let mut buf = BytesMut::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| CaptureError::ReadBody(e.into()))?;
        if let Ok(data) = frame.into_data() {
            if buf.len() + data.len() > limit {
                return Err(CaptureError::TooLarge { limit });
            }
            buf.extend_from_slice(&data);
        }
    }
    Ok(buf.freeze())
}

fn replay_from_memory(path: &Path, raw: &Bytes) -> Result<(wire::RequestHead, ReplayBody), ReplayError> {
    let head = wire::parse_request_head(raw)
        .map_err(|reason| ReplayError::malformed(path, reason))?
        .ok_or_else(|| ReplayError::malformed(path, "incomplete head"))?;
    let len = wire::content_length(&head.headers).map_err(|r| ReplayError::malformed(path, r))?;
    let end = head.len as u64 + len;
    if end > raw.len() as u64 {
        return Err(ReplayError::malformed(path, "body shorter than content-length"));
    }
    let body = ReplayBody::memory(raw.slice(head.len..end as usize));
    Ok((head, body))
}

async fn replay_from_disk(path: &Path) -> Result<(wire::RequestHead, ReplayBody), ReplayError> {
    let mut file = File::open(path).await.map_err(ReplayError::io(path))?;
    let mut buf = Vec::with_capacity(4096);
    let head = loop {
        if let Some(head) =
            wire::parse_request_head(&buf).map_err(|reason| ReplayError::malformed(path, reason))?
        {
            break head;
        }
        if buf.len() >= MAX_HEAD_BYTES {
            return Err(ReplayError::malformed(path, "head too large"));
        }
        let mut chunk = [0u8; 4096];
        let n = file.read(&mut chunk).await.map_err(ReplayError::io(path))?;
        if n == 0 {
            return Err(ReplayError::malformed(path, "incomplete head"));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let len = wire::content_length(&head.headers).map_err(|r| ReplayError::malformed(path, r))?;
    let available = file.metadata().await.map_err(ReplayError::io(path))?.len();
    if head.len as u64 + len > available {
        return Err(ReplayError::malformed(path, "body shorter than content-length"));
    }
    file.seek(SeekFrom::Start(head.len as u64))
        .await
        .map_err(ReplayError::io(path))?;
    Ok((head, ReplayBody::file(file, len)))
}

/// A request reconstituted from a capture.
///
/// Each instance owns its headers and body source; nothing is shared with
/// other replays of the same exchange.
#[derive(Debug)]
pub struct RecordedRequest {
    method: Method,
    target: String,
    headers: HeaderMap,
    body: ReplayBody,
    replay: u32,
}

impl RecordedRequest {
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Origin-form request target (path and query).
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// 1-based position of this replay among those issued for the exchange.
    pub fn replay(&self) -> u32 {
        self.replay
    }

    pub fn into_body(self) -> ReplayBody {
        self.body
    }

    /// Build an outbound request for `uri`.
    pub fn into_request(self, uri: Uri) -> Request<Body> {
        let mut request = Request::new(Body::new(self.body));
        *request.method_mut() = self.method;
        *request.uri_mut() = uri;
        *request.headers_mut() = self.headers;
        request
    }
}

/// Body of a replayed request.
///
/// A file-backed body closes its handle as soon as the last byte is read,
/// on a read error, or when dropped, whichever comes first.
#[derive(Debug)]
pub struct ReplayBody {
    source: Source,
    remaining: u64,
}

#[derive(Debug)]
enum Source {
    Memory(Option<Bytes>),
    File {
        file: Option<File>,
        scratch: Box<[u8]>,
    },
}

impl ReplayBody {
    fn memory(bytes: Bytes) -> Self {
        let remaining = bytes.len() as u64;
        let chunk = (!bytes.is_empty()).then_some(bytes);
        Self {
            source: Source::Memory(chunk),
            remaining,
        }
    }

    fn file(file: File, len: u64) -> Self {
        Self {
            source: Source::File {
                file: (len > 0).then_some(file),
                scratch: vec![0u8; READ_CHUNK].into_boxed_slice(),
            },
            remaining: len,
        }
    }

    /// Read the whole body into memory.
    pub async fn collect_bytes(self) -> io::Result<Bytes> {
        Ok(BodyExt::collect(self).await?.to_bytes())
    }
}

impl http_body::Body for ReplayBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match &mut this.source {
            Source::Memory(chunk) => {
                this.remaining = 0;
                Poll::Ready(chunk.take().map(|bytes| Ok(Frame::data(bytes))))
            }
            Source::File { file, scratch } => {
                let Some(handle) = file.as_mut() else {
                    return Poll::Ready(None);
                };
                let want = this.remaining.min(scratch.len() as u64) as usize;
                let mut buf = ReadBuf::new(&mut scratch[..want]);
                match Pin::new(handle).poll_read(cx, &mut buf) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(Err(e)) => {
                        *file = None;
                        Poll::Ready(Some(Err(e)))
                    }
                    Poll::Ready(Ok(())) => {
                        let n = buf.filled().len();
                        if n == 0 {
                            *file = None;
                            return Poll::Ready(Some(Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "captured body ended early",
                            ))));
                        }
                        let data = Bytes::copy_from_slice(buf.filled());
                        this.remaining -= n as u64;
                        if this.remaining == 0 {
                            *file = None;
                        }
                        Poll::Ready(Some(Ok(Frame::data(data))))
                    }
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.remaining == 0
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderName;

    fn recorder(dir: &Path, memory_threshold: usize) -> RequestRecorder {
        RequestRecorder::new(dir, Arc::new(SequenceAllocator::new()), 1024 * 1024, memory_threshold)
    }

    fn post(body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/submit?x=1")
            .header("host", "proxy.local")
            .header("x-trace", "abc")
            .body(body.into())
            .unwrap()
    }

    #[tokio::test]
    async fn capture_writes_valid_request_file() {
        let dir = tempfile::tempdir().unwrap();
        let exchange = recorder(dir.path(), 0).capture(post("hello")).await.unwrap();

        let raw = std::fs::read(exchange.path(Slot::Request)).unwrap();
        let head = wire::parse_request_head(&raw).unwrap().unwrap();
        assert_eq!(head.method, Method::POST);
        assert_eq!(head.target, "/submit?x=1");
        assert_eq!(head.headers["content-length"], "5");
        assert_eq!(&raw[head.len..], b"hello");
    }

    #[tokio::test]
    async fn every_replay_returns_identical_bytes() {
        let body: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        for threshold in [0, usize::MAX] {
            let dir = tempfile::tempdir().unwrap();
            let recorder = recorder(dir.path(), threshold);
            let exchange = recorder.capture(post(body.clone())).await.unwrap();

            for expected_replay in 1..=3 {
                let replay = recorder.open_replay(&exchange).await.unwrap();
                assert_eq!(replay.replay(), expected_replay);
                let bytes = replay.into_body().collect_bytes().await.unwrap();
                assert_eq!(bytes.as_ref(), body.as_slice());
            }
            assert_eq!(exchange.replay_count(), 3);
        }
    }

    #[tokio::test]
    async fn replays_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = recorder(dir.path(), usize::MAX);
        let exchange = recorder.capture(post("payload")).await.unwrap();

        let mut primary = recorder.open_replay(&exchange).await.unwrap();
        let secondary = recorder.open_replay(&exchange).await.unwrap();

        primary.headers_mut().remove("x-trace");
        primary
            .headers_mut()
            .insert(HeaderName::from_static("x-only-primary"), HeaderValue::from_static("1"));

        assert_eq!(secondary.headers()["x-trace"], "abc");
        assert!(secondary.headers().get("x-only-primary").is_none());
        assert_eq!(secondary.into_body().collect_bytes().await.unwrap(), "payload");
        assert_eq!(primary.into_body().collect_bytes().await.unwrap(), "payload");
    }

    #[tokio::test]
    async fn bodyless_get_has_no_content_length() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = recorder(dir.path(), 0);
        let request = Request::get("/").body(Body::empty()).unwrap();
        let exchange = recorder.capture(request).await.unwrap();

        let replay = recorder.open_replay(&exchange).await.unwrap();
        assert!(replay.headers().get(CONTENT_LENGTH).is_none());
        assert!(replay.into_body().collect_bytes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_body_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = RequestRecorder::new(dir.path(), Arc::new(SequenceAllocator::new()), 4, 0);
        let err = recorder.capture(post("too long")).await.unwrap_err();
        assert!(matches!(err, CaptureError::TooLarge { limit: 4 }));
    }

    #[tokio::test]
    async fn capture_into_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = recorder(&dir.path().join("absent"), 0);
        let err = recorder.capture(post("x")).await.unwrap_err();
        assert!(matches!(err, CaptureError::Io { .. }));
    }

    #[tokio::test]
    async fn replay_of_missing_or_truncated_capture_fails() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = recorder(dir.path(), 0);
        let exchange = recorder.capture(post("hello")).await.unwrap();

        std::fs::write(exchange.path(Slot::Request), b"POST / HTTP/1.1\r\ncontent-length: 9\r\n\r\nabc")
            .unwrap();
        assert!(matches!(
            recorder.open_replay(&exchange).await,
            Err(ReplayError::Malformed { .. })
        ));

        std::fs::remove_file(exchange.path(Slot::Request)).unwrap();
        assert!(matches!(
            recorder.open_replay(&exchange).await,
            Err(ReplayError::Io { .. })
        ));
    }
}
