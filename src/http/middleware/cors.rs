//! CORS header injection for the tus upload API.
//!
//! # Responsibilities
//! - Decorate every response with the `Access-Control-*` headers
//! - Reflect the caller's `Origin` (or `*` when there is none)
//! - Answer `OPTIONS` preflights with `204 No Content` without calling the
//!   wrapped service
//!
//! # Security
//! The request `Origin` is reflected verbatim and, with the default policy,
//! `Access-Control-Allow-Credentials: true` is sent alongside it. Any origin
//! can therefore make credentialed cross-site requests. There is no
//! allow-list here; put one in front of this layer if that matters.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use axum::http::{
    header::{self, HeaderMap, HeaderName, HeaderValue, InvalidHeaderValue},
    Method, Request, Response, StatusCode,
};
use pin_project::pin_project;
use thiserror::Error;
use tower::{Layer, Service};

use crate::config::CorsConfig;
use crate::observability::metrics;

/// Methods advertised in `Access-Control-Allow-Methods`.
pub const DEFAULT_ALLOW_METHODS: &[&str] =
    &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// Request headers a browser may send, including the tus protocol headers.
pub const DEFAULT_ALLOW_HEADERS: &[&str] = &[
    "Authorization",
    "Content-Type",
    "Content-Length",
    "Upload-Offset",
    "Upload-Length",
    "Upload-Metadata",
    "Upload-Defer-Length",
    "Upload-Concat",
    "Tus-Resumable",
    "Tus-Version",
    "Tus-Extension",
    "Tus-Max-Size",
    "X-HTTP-Method-Override",
    "X-Requested-With",
];

/// Response headers readable by browser scripts (upload progress, redirects).
pub const DEFAULT_EXPOSE_HEADERS: &[&str] = &[
    "Upload-Offset",
    "Upload-Length",
    "Location",
    "Tus-Version",
    "Tus-Resumable",
    "Tus-Extension",
    "Tus-Max-Size",
    "Upload-Metadata",
    "Content-Disposition",
];

/// Preflight cache lifetime: 24 hours.
pub const DEFAULT_MAX_AGE_SECS: u64 = 86_400;

/// Error building a [`CorsPolicy`] from configuration.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A configured list does not encode as a header value.
    #[error("invalid value for {header}: {source}")]
    InvalidValue {
        header: HeaderName,
        #[source]
        source: InvalidHeaderValue,
    },
}

/// Pre-encoded CORS header values.
///
/// Built once and shared read-only by every clone of [`Cors`].
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    allow_methods: HeaderValue,
    allow_headers: HeaderValue,
    expose_headers: HeaderValue,
    max_age: HeaderValue,
    allow_credentials: bool,
}

impl CorsPolicy {
    /// Encode the configured lists into header values.
    pub fn from_config(config: &CorsConfig) -> Result<Self, PolicyError> {
        Ok(Self {
            allow_methods: comma_separated(
                header::ACCESS_CONTROL_ALLOW_METHODS,
                &config.allow_methods,
            )?,
            allow_headers: comma_separated(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                &config.allow_headers,
            )?,
            expose_headers: comma_separated(
                header::ACCESS_CONTROL_EXPOSE_HEADERS,
                &config.expose_headers,
            )?,
            max_age: HeaderValue::from(config.max_age_secs),
            allow_credentials: config.allow_credentials,
        })
    }

    /// Whether `Access-Control-Allow-Credentials: true` is emitted.
    pub fn allows_credentials(&self) -> bool {
        self.allow_credentials
    }

    /// Value for `Access-Control-Allow-Origin`: the request `Origin`
    /// verbatim, or `*` when it is missing or empty.
    pub fn allow_origin(headers: &HeaderMap) -> HeaderValue {
        match headers.get(header::ORIGIN) {
            Some(origin) if !origin.is_empty() => origin.clone(),
            _ => HeaderValue::from_static("*"),
        }
    }

    /// Write the CORS headers into `headers`.
    ///
    /// A header the response already carries is left alone, so a wrapped
    /// service can still override any of them.
    pub fn apply(&self, origin: HeaderValue, headers: &mut HeaderMap) {
        headers
            .entry(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .or_insert(origin);
        headers
            .entry(header::ACCESS_CONTROL_ALLOW_METHODS)
            .or_insert_with(|| self.allow_methods.clone());
        headers
            .entry(header::ACCESS_CONTROL_ALLOW_HEADERS)
            .or_insert_with(|| self.allow_headers.clone());
        headers
            .entry(header::ACCESS_CONTROL_EXPOSE_HEADERS)
            .or_insert_with(|| self.expose_headers.clone());
        headers
            .entry(header::ACCESS_CONTROL_MAX_AGE)
            .or_insert_with(|| self.max_age.clone());
        if self.allow_credentials {
            headers
                .entry(header::ACCESS_CONTROL_ALLOW_CREDENTIALS)
                .or_insert_with(|| HeaderValue::from_static("true"));
        }
    }

    /// Empty `204 No Content` response carrying the CORS headers.
    pub fn preflight_response<B: Default>(&self, origin: HeaderValue) -> Response<B> {
        let mut response = Response::new(B::default());
        *response.status_mut() = StatusCode::NO_CONTENT;
        self.apply(origin, response.headers_mut());
        response
    }
}

impl Default for CorsPolicy {
    fn default() -> Self {
        Self {
            allow_methods: HeaderValue::from_static(
                "GET, POST, PUT, PATCH, DELETE, HEAD, OPTIONS",
            ),
            allow_headers: HeaderValue::from_static(
                "Authorization, Content-Type, Content-Length, Upload-Offset, Upload-Length, \
                 Upload-Metadata, Upload-Defer-Length, Upload-Concat, Tus-Resumable, Tus-Version, \
                 Tus-Extension, Tus-Max-Size, X-HTTP-Method-Override, X-Requested-With",
            ),
            expose_headers: HeaderValue::from_static(
                "Upload-Offset, Upload-Length, Location, Tus-Version, Tus-Resumable, \
                 Tus-Extension, Tus-Max-Size, Upload-Metadata, Content-Disposition",
            ),
            max_age: HeaderValue::from(DEFAULT_MAX_AGE_SECS),
            allow_credentials: true,
        }
    }
}

fn comma_separated(header: HeaderName, values: &[String]) -> Result<HeaderValue, PolicyError> {
    HeaderValue::from_str(&values.join(", "))
        .map_err(|source| PolicyError::InvalidValue { header, source })
}

/// Layer that wraps a service in [`Cors`].
#[derive(Debug, Clone)]
pub struct CorsLayer {
    policy: Arc<CorsPolicy>,
}

impl CorsLayer {
    /// Layer using the default tus policy.
    pub fn new() -> Self {
        Self::with_policy(CorsPolicy::default())
    }

    pub fn with_policy(policy: CorsPolicy) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }
}

impl Default for CorsLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for CorsLayer {
    type Service = Cors<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Cors {
            inner,
            policy: self.policy.clone(),
        }
    }
}

/// Service that injects CORS headers and terminates preflights.
#[derive(Debug, Clone)]
pub struct Cors<S> {
    inner: S,
    policy: Arc<CorsPolicy>,
}

impl<S> Cors<S> {
    /// Wrap `inner` with the default tus policy.
    pub fn new(inner: S) -> Self {
        CorsLayer::new().layer(inner)
    }

    pub fn layer() -> CorsLayer {
        CorsLayer::new()
    }

    pub fn policy(&self) -> &CorsPolicy {
        &self.policy
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for Cors<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    ResBody: Default,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future, ResBody>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let origin = CorsPolicy::allow_origin(req.headers());

        if req.method() == Method::OPTIONS {
            tracing::trace!(origin = ?origin, path = %req.uri().path(), "Answering CORS preflight");
            metrics::record_preflight();
            return ResponseFuture {
                kind: Kind::Preflight {
                    response: Some(self.policy.preflight_response(origin)),
                },
            };
        }

        ResponseFuture {
            kind: Kind::Inner {
                future: self.inner.call(req),
                origin: Some(origin),
                policy: self.policy.clone(),
            },
        }
    }
}

/// Response future for [`Cors`].
#[pin_project]
pub struct ResponseFuture<F, B> {
    #[pin]
    kind: Kind<F, B>,
}

#[pin_project(project = KindProj)]
enum Kind<F, B> {
    Preflight {
        response: Option<Response<B>>,
    },
    Inner {
        #[pin]
        future: F,
        origin: Option<HeaderValue>,
        policy: Arc<CorsPolicy>,
    },
}

impl<F, B, E> Future for ResponseFuture<F, B>
where
    F: Future<Output = Result<Response<B>, E>>,
{
    type Output = Result<Response<B>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().kind.project() {
            KindProj::Preflight { response } => Poll::Ready(Ok(response
                .take()
                .expect("ResponseFuture polled after completion"))),
            KindProj::Inner {
                future,
                origin,
                policy,
            } => {
                let mut response = ready!(future.poll(cx))?;
                if let Some(origin) = origin.take() {
                    policy.apply(origin, response.headers_mut());
                }
                Poll::Ready(Ok(response))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::{service_fn, ServiceExt};

    const ALLOW_HEADERS: &str = "Authorization, Content-Type, Content-Length, Upload-Offset, \
        Upload-Length, Upload-Metadata, Upload-Defer-Length, Upload-Concat, Tus-Resumable, \
        Tus-Version, Tus-Extension, Tus-Max-Size, X-HTTP-Method-Override, X-Requested-With";
    const EXPOSE_HEADERS: &str = "Upload-Offset, Upload-Length, Location, Tus-Version, \
        Tus-Resumable, Tus-Extension, Tus-Max-Size, Upload-Metadata, Content-Disposition";

    /// Downstream that counts calls and echoes the method and path it saw.
    fn downstream(
        calls: Arc<AtomicUsize>,
    ) -> impl Service<Request<Body>, Response = Response<Body>, Error = Infallible> + Clone {
        service_fn(move |req: Request<Body>| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let body = format!("{} {}", req.method(), req.uri().path());
                Ok::<_, Infallible>(Response::new(Body::from(body)))
            }
        })
    }

    fn request(method: Method, origin: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri("/files/abc");
        if let Some(origin) = origin {
            builder = builder.header(header::ORIGIN, origin);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn assert_fixed_headers(headers: &HeaderMap) {
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_METHODS],
            "GET, POST, PUT, PATCH, DELETE, HEAD, OPTIONS"
        );
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], ALLOW_HEADERS);
        assert_eq!(headers[header::ACCESS_CONTROL_EXPOSE_HEADERS], EXPOSE_HEADERS);
        assert_eq!(headers[header::ACCESS_CONTROL_MAX_AGE], "86400");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    }

    #[tokio::test]
    async fn test_preflight_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let svc = Cors::new(downstream(calls.clone()));

        let res = svc
            .oneshot(request(Method::OPTIONS, Some("https://example.com")))
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            res.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://example.com"
        );
        assert_fixed_headers(res.headers());
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_preflight_reaches_downstream_once() {
        for method in [
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::HEAD,
        ] {
            let calls = Arc::new(AtomicUsize::new(0));
            let svc = Cors::new(downstream(calls.clone()));

            let res = svc
                .oneshot(request(method.clone(), Some("https://example.com")))
                .await
                .unwrap();

            assert_eq!(res.status(), StatusCode::OK);
            assert_eq!(
                res.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
                "https://example.com"
            );
            assert_fixed_headers(res.headers());
            assert_eq!(calls.load(Ordering::SeqCst), 1);

            let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
            assert_eq!(body, format!("{} /files/abc", method));
        }
    }

    #[tokio::test]
    async fn test_missing_origin_uses_wildcard() {
        let svc = Cors::new(downstream(Arc::new(AtomicUsize::new(0))));
        let res = svc.oneshot(request(Method::GET, None)).await.unwrap();
        assert_eq!(res.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }

    #[tokio::test]
    async fn test_empty_origin_uses_wildcard() {
        let svc = Cors::new(downstream(Arc::new(AtomicUsize::new(0))));
        let res = svc.oneshot(request(Method::OPTIONS, Some(""))).await.unwrap();
        assert_eq!(res.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }

    #[tokio::test]
    async fn test_same_request_yields_same_headers() {
        let svc = Cors::new(downstream(Arc::new(AtomicUsize::new(0))));

        let first = svc
            .clone()
            .oneshot(request(Method::PATCH, Some("http://localhost:3000")))
            .await
            .unwrap();
        let second = svc
            .oneshot(request(Method::PATCH, Some("http://localhost:3000")))
            .await
            .unwrap();

        assert_eq!(first.headers(), second.headers());
    }

    #[tokio::test]
    async fn test_downstream_header_wins() {
        let svc = Cors::new(service_fn(|_req: Request<Body>| async {
            let mut res = Response::new(Body::empty());
            res.headers_mut().insert(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                HeaderValue::from_static("https://pinned.example"),
            );
            Ok::<_, Infallible>(res)
        }));

        let res = svc
            .oneshot(request(Method::GET, Some("https://example.com")))
            .await
            .unwrap();

        assert_eq!(
            res.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://pinned.example"
        );
        assert_fixed_headers(res.headers());
    }

    #[tokio::test]
    async fn test_downstream_error_passes_through() {
        let svc = Cors::new(service_fn(|_req: Request<Body>| async {
            Err::<Response<Body>, _>("storage offline")
        }));

        let err = svc.oneshot(request(Method::GET, None)).await.unwrap_err();
        assert_eq!(err, "storage offline");
    }

    #[tokio::test]
    async fn test_concurrent_requests_reflect_their_own_origin() {
        let svc = Cors::new(service_fn(|_req: Request<Body>| async {
            Ok::<_, Infallible>(Response::new(Body::empty()))
        }));
        let mut tasks = tokio::task::JoinSet::new();

        for i in 0..32 {
            let svc = svc.clone();
            tasks.spawn(async move {
                let origin = format!("https://client-{i}.example");
                let res = svc
                    .oneshot(request(Method::GET, Some(&origin)))
                    .await
                    .unwrap();
                (origin, res)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (origin, res) = joined.unwrap();
            assert_eq!(res.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], origin.as_str());
            assert_fixed_headers(res.headers());
        }
    }

    #[tokio::test]
    async fn test_credentials_header_omitted_when_disabled() {
        let config = CorsConfig {
            allow_credentials: false,
            ..CorsConfig::default()
        };
        let layer = CorsLayer::with_policy(CorsPolicy::from_config(&config).unwrap());
        let svc = layer.layer(downstream(Arc::new(AtomicUsize::new(0))));

        let res = svc.oneshot(request(Method::OPTIONS, None)).await.unwrap();
        assert!(res
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS)
            .is_none());
        assert_eq!(res.headers()[header::ACCESS_CONTROL_MAX_AGE], "86400");
    }

    #[test]
    fn test_default_config_matches_default_policy() {
        let from_config = CorsPolicy::from_config(&CorsConfig::default()).unwrap();
        let default = CorsPolicy::default();

        let mut a = HeaderMap::new();
        let mut b = HeaderMap::new();
        from_config.apply(HeaderValue::from_static("*"), &mut a);
        default.apply(HeaderValue::from_static("*"), &mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_config_value_rejected() {
        let config = CorsConfig {
            expose_headers: vec!["Upload-Offset\n".to_string()],
            ..CorsConfig::default()
        };
        let err = CorsPolicy::from_config(&config).unwrap_err();
        assert!(matches!(
            err,
            PolicyError::InvalidValue { header: ref name, .. }
                if *name == header::ACCESS_CONTROL_EXPOSE_HEADERS
        ));
    }
}
