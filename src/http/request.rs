//! Request handling and transformation.
//!
//! # Responsibilities
//! - Strip hop-by-hop headers before a message crosses the proxy
//! - Build the backend URI for a captured request target
//!
//! # Design Decisions
//! - `Host` is forwarded as received; backends see the caller's host
//! - Headers listed in `Connection` are hop-by-hop for that message only

use axum::http::header::{self, HeaderMap, HeaderName};
use axum::http::Uri;
use url::Url;

/// Headers that only describe the connection they arrived on.
pub static HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
    // "Proxy-Connection" is not standard but still sent by some clients.
    headers.remove("proxy-connection");
}

/// Join a backend base URL with an origin-form request target.
///
/// Paths are joined with exactly one slash; queries are joined with `&`.
pub fn join_target(base: &Url, target: &str) -> Result<Uri, axum::http::Error> {
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    };

    let base_path = base.path();
    let joined_path = match (base_path.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base_path, &path[1..]),
        (false, false) => format!("{}/{}", base_path, path),
        _ => format!("{}{}", base_path, path),
    };

    let joined_query = match (base.query().filter(|q| !q.is_empty()), query.filter(|q| !q.is_empty())) {
        (Some(b), Some(r)) => Some(format!("{}&{}", b, r)),
        (Some(b), None) => Some(b.to_string()),
        (None, Some(r)) => Some(r.to_string()),
        (None, None) => None,
    };

    let mut authority = base.host_str().unwrap_or_default().to_string();
    if let Some(port) = base.port() {
        authority.push(':');
        authority.push_str(&port.to_string());
    }

    let path_and_query = match joined_query {
        Some(q) => format!("{}?{}", joined_path, q),
        None => joined_path,
    };

    Uri::builder()
        .scheme(base.scheme())
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
}
