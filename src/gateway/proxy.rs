//! Forwarding allowed requests to a pipeline's service endpoint.

use std::time::Duration;

use axum::{
    body::{Body, to_bytes},
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};
use url::Url;

use crate::{Error, Result};

/// Connection-scoped headers never forwarded in either direction
const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// HTTP forwarder shared by all pipelines
#[derive(Debug, Clone)]
pub struct Proxy {
    client: reqwest::Client,
    max_body_size: usize,
}

impl Proxy {
    /// Build a forwarder with the given upstream timeout and body limit.
    pub fn new(timeout: Duration, max_body_size: usize) -> Result<Self> {
        // Bodies pass through as-is; decoding them would break content-encoding
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build proxy client: {e}")))?;

        Ok(Self {
            client,
            max_body_size,
        })
    }

    /// Send `request` to `upstream` and relay the answer.
    ///
    /// The request path and query are appended to the upstream URL. Upstream
    /// failures become `502 Bad Gateway`.
    pub async fn forward(&self, request: Request<Body>, upstream: &Url) -> Response {
        let (parts, body) = request.into_parts();

        let target = target_url(upstream, &parts.uri);
        let Ok(body) = to_bytes(body, self.max_body_size).await else {
            return (StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large").into_response();
        };

        let mut headers = strip_hop_by_hop(&parts.headers);
        headers.remove(header::HOST);
        if let Some(host) = parts.headers.get(header::HOST) {
            headers.insert(HeaderName::from_static("x-forwarded-host"), host.clone());
        }

        debug!(method = %parts.method, target = %target, "Forwarding request");

        let upstream_response = match self
            .client
            .request(parts.method.clone(), target.as_str())
            .headers(headers)
            .body(body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(target = %target, error = %e, "Upstream request failed");
                return bad_gateway();
            }
        };

        let status = upstream_response.status();
        let headers = strip_hop_by_hop(upstream_response.headers());
        let bytes = match upstream_response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(target = %target, error = %e, "Failed to read upstream response");
                return bad_gateway();
            }
        };

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

/// `upstream` with the request path appended and the request query.
fn target_url(upstream: &Url, uri: &axum::http::Uri) -> Url {
    let mut target = upstream.clone();
    let base = upstream.path().trim_end_matches('/');
    target.set_path(&format!("{base}{}", uri.path()));
    target.set_query(uri.query());
    target
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    // Headers named in `Connection` are hop-by-hop too
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .collect();

    headers
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP.contains(*name) && name.as_str() != "keep-alive")
        .filter(|(name, _)| !named.iter().any(|n| n == name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn bad_gateway() -> Response {
    (
        StatusCode::BAD_GATEWAY,
        [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
        "Bad Gateway",
    )
        .into_response()
}
