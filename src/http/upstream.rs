//! Forwarding to the upstream tus server.
//!
//! # Responsibilities
//! - Rewrite the request URI onto the configured upstream base URL
//! - Record the original host/scheme in `X-Forwarded-*`
//! - Stream request and response bodies through unbuffered
//! - Map connection failures to `502 Bad Gateway`
//!
//! # Design Decisions
//! - No retries: tus PATCH requests are not idempotent from the gateway's view
//! - Upstream responses are returned untouched; `Location` stays whatever
//!   the upstream sent

use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::{header, uri::InvalidUri, HeaderName, HeaderValue, Request, StatusCode, Uri, Version},
    response::{IntoResponse, Response},
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use thiserror::Error;
use url::{Position, Url};

use crate::config::UpstreamConfig;
use crate::http::request::request_id;
use crate::observability::metrics;

const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Response as produced by the hyper client.
pub type UpstreamResponse = Response<hyper::body::Incoming>;

/// Errors forwarding a request upstream.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The configured base URL cannot be parsed.
    #[error("invalid upstream base url: {0}")]
    BaseUrl(#[from] url::ParseError),

    /// The rewritten target is not a valid URI.
    #[error("invalid upstream uri: {0}")]
    InvalidUri(#[from] InvalidUri),

    /// Connecting to or talking with the upstream failed.
    #[error("upstream request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),
}

impl IntoResponse for UpstreamError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_GATEWAY, "Upstream request failed").into_response()
    }
}

/// Handle to the upstream server, cloned into every request.
#[derive(Clone)]
pub struct Upstream {
    client: Client<HttpConnector, Body>,
    /// `scheme://host[:port]`
    origin: String,
    /// Base path without trailing slash, possibly empty.
    prefix: String,
}

impl Upstream {
    pub fn from_config(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let base = Url::parse(&config.base_url)?;
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Ok(Self {
            client,
            origin: base[..Position::BeforePath].to_string(),
            prefix: base.path().trim_end_matches('/').to_string(),
        })
    }

    /// Map a gateway request URI onto the upstream, keeping path and query.
    pub fn target_uri(&self, original: &Uri) -> Result<Uri, UpstreamError> {
        let path_and_query = original
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target = format!("{}{}{}", self.origin, self.prefix, path_and_query);
        Ok(target.parse::<Uri>()?)
    }
}

/// Fallback handler: forward everything the gateway does not answer itself.
pub async fn forward(
    State(upstream): State<Upstream>,
    request: Request<Body>,
) -> Result<Response, UpstreamError> {
    let start = Instant::now();
    let request_id = request_id(&request).to_string();
    let method = request.method().clone();

    let (mut parts, body) = request.into_parts();
    let uri = upstream.target_uri(&parts.uri)?;

    tracing::debug!(
        request_id = %request_id,
        method = %method,
        target = %uri,
        "Forwarding request"
    );

    // hyper fills Host from the target URI.
    if let Some(host) = parts.headers.remove(header::HOST) {
        parts.headers.insert(X_FORWARDED_HOST, host);
    }
    parts
        .headers
        .insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    parts.uri = uri;
    // The client pool speaks HTTP/1.1 to the upstream.
    parts.version = Version::HTTP_11;

    match upstream.client.request(Request::from_parts(parts, body)).await {
        Ok(response) => {
            metrics::record_upstream(method.as_str(), response.status().as_u16(), start);
            Ok(into_gateway_response(response))
        }
        Err(e) => {
            tracing::error!(request_id = %request_id, method = %method, error = %e, "Upstream error");
            metrics::record_upstream_error(method.as_str());
            Err(e.into())
        }
    }
}

fn into_gateway_response(response: UpstreamResponse) -> Response {
    let (parts, body) = response.into_parts();
    Response::from_parts(parts, Body::new(body))
}
