//! Response handling and transformation.
//!
//! # Responsibilities
//! - Map backend and capture failures to caller-facing status codes
//! - Keep internal detail (file paths, stored bytes) out of error bodies
//!
//! # Design Decisions
//! - Streaming responses avoid buffering entire body
//! - Backend timeouts result in 504 Gateway Timeout
//! - Error bodies are short plain text

use axum::body::Body;
use axum::http::{header, HeaderValue, Response, StatusCode};

use crate::capture::CaptureError;
use crate::dispatch::DispatchError;

/// Plain-text response with `status` and `message`.
pub fn plain(status: StatusCode, message: impl Into<String>) -> Response<Body> {
    let mut body = message.into();
    body.push('\n');
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Response for a failed primary call, carrying the failure chain.
pub fn gateway_error(error: &DispatchError) -> Response<Body> {
    plain(error.status(), error.caller_message())
}

/// Response for a request that could not be captured.
pub fn capture_failure(error: &CaptureError) -> Response<Body> {
    match error {
        CaptureError::TooLarge { limit } => plain(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("request body exceeds {} bytes", limit),
        ),
        CaptureError::ReadBody(_) => plain(StatusCode::BAD_REQUEST, "failed to read request body"),
        _ => plain(StatusCode::INTERNAL_SERVER_ERROR, "failed to record request"),
    }
}

/// Response for a captured request whose replay could not be opened.
pub fn replay_failure() -> Response<Body> {
    plain(StatusCode::INTERNAL_SERVER_ERROR, "failed to replay recorded request")
}
