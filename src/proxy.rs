//! Upstream forwarding for admitted page requests.
//!
//! When an upstream origin is configured, every request that no local route
//! handles is relayed to it. Admission control runs before this handler, so
//! only admitted traffic ever reaches the origin.

use std::time::Duration;

use axum::{
    body::{Body, to_bytes},
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{debug, error};

/// Largest request body relayed upstream.
const MAX_FORWARD_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Headers that describe a single hop and are never relayed.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

#[derive(Clone)]
pub struct Upstream {
    client: reqwest::Client,
    base_url: String,
}

impl Upstream {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base_url, path_and_query)
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Copy end-to-end headers between the axum and reqwest header maps.
fn relay_headers<'a>(
    headers: impl Iterator<Item = (&'a str, &'a [u8])>,
) -> Vec<(HeaderName, HeaderValue)> {
    headers
        .filter(|(name, _)| !is_hop_by_hop(name))
        .filter_map(|(name, value)| {
            let name = HeaderName::from_bytes(name.as_bytes()).ok()?;
            let value = HeaderValue::from_bytes(value).ok()?;
            Some((name, value))
        })
        .collect()
}

/// Fallback handler relaying the request to the upstream origin.
pub async fn forward(State(upstream): State<Upstream>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = upstream.url_for(path_and_query);

    let Ok(method) = reqwest::Method::from_bytes(parts.method.as_str().as_bytes()) else {
        return (StatusCode::METHOD_NOT_ALLOWED, "Unsupported method").into_response();
    };

    let body = match to_bytes(body, MAX_FORWARD_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            debug!(error = %e, "Request body rejected");
            return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response();
        }
    };

    let mut builder = upstream.client.request(method, &url).body(body);
    for (name, value) in relay_headers(
        parts
            .headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_bytes())),
    ) {
        builder = builder.header(name.as_str(), value.as_bytes());
    }

    let response = match builder.send().await {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, url = %url, "Failed to reach upstream");
            return (StatusCode::BAD_GATEWAY, "Upstream unavailable").into_response();
        }
    };

    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let headers: HeaderMap = relay_headers(
        response
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_bytes())),
    )
    .into_iter()
    .collect();

    match response.bytes().await {
        Ok(bytes) => (status, headers, Body::from(bytes)).into_response(),
        Err(e) => {
            error!(error = %e, url = %url, "Failed to read upstream response");
            (StatusCode::BAD_GATEWAY, "Upstream response unreadable").into_response()
        }
    }
}
