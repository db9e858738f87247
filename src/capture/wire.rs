//! HTTP/1.1 message heads as stored in capture files.
//!
//! Heads are written byte-for-byte from the header map (values are not
//! re-encoded) and read back with `httparse`.

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::http::header::CONTENT_LENGTH;

/// Largest head accepted when reading a capture back.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

const MAX_HEADERS: usize = 128;

/// A parsed request line plus headers.
#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub headers: HeaderMap,
    /// Bytes consumed by the head, including the blank line.
    pub len: usize,
}

/// A parsed status line plus headers.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub len: usize,
}

pub fn write_request_head(out: &mut Vec<u8>, method: &Method, target: &str, headers: &HeaderMap) {
    out.extend_from_slice(method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(target.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    write_headers(out, headers);
}

pub fn write_response_head(out: &mut Vec<u8>, status: StatusCode, headers: &HeaderMap) {
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(status.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(status.canonical_reason().unwrap_or("").as_bytes());
    out.extend_from_slice(b"\r\n");
    write_headers(out, headers);
}

fn write_headers(out: &mut Vec<u8>, headers: &HeaderMap) {
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

/// Parse a request head. `Ok(None)` means more bytes are needed.
pub fn parse_request_head(buf: &[u8]) -> Result<Option<RequestHead>, String> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut storage);
    let len = match request.parse(buf).map_err(|e| e.to_string())? {
        httparse::Status::Partial => return Ok(None),
        httparse::Status::Complete(len) => len,
    };

    let method = request.method.ok_or("missing method")?;
    let method = Method::from_bytes(method.as_bytes()).map_err(|e| e.to_string())?;
    let target = request.path.ok_or("missing request target")?.to_string();
    let headers = header_map(request.headers)?;

    Ok(Some(RequestHead {
        method,
        target,
        headers,
        len,
    }))
}

/// Parse a response head. `Ok(None)` means more bytes are needed.
pub fn parse_response_head(buf: &[u8]) -> Result<Option<ResponseHead>, String> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut storage);
    let len = match response.parse(buf).map_err(|e| e.to_string())? {
        httparse::Status::Partial => return Ok(None),
        httparse::Status::Complete(len) => len,
    };

    let code = response.code.ok_or("missing status code")?;
    let status = StatusCode::from_u16(code).map_err(|e| e.to_string())?;
    let headers = header_map(response.headers)?;

    Ok(Some(ResponseHead {
        status,
        headers,
        len,
    }))
}

fn header_map(raw: &[httparse::Header<'_>]) -> Result<HeaderMap, String> {
    let mut headers = HeaderMap::with_capacity(raw.len());
    for header in raw {
        let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(|e| e.to_string())?;
        let value = HeaderValue::from_bytes(header.value).map_err(|e| e.to_string())?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Declared body length; a message without `Content-Length` has no body.
pub fn content_length(headers: &HeaderMap) -> Result<u64, String> {
    match headers.get(CONTENT_LENGTH) {
        None => Ok(0),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| format!("invalid content-length {:?}", value)),
    }
}
