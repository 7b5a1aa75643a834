//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the health route and the upstream fallback
//! - Wire up middleware (request ID, tracing, CORS, timeout)
//! - Serve on a bound listener until shutdown is signalled

use std::time::Duration;

use axum::{body::Body, http::Request, routing::get, Router};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::GatewayConfig;
use crate::http::health::healthz;
use crate::http::middleware::{CorsLayer, CorsPolicy, PolicyError};
use crate::http::request::{request_id, UuidRequestId};
use crate::http::upstream::{forward, Upstream, UpstreamError};

/// Errors building the server from configuration.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("CORS policy: {0}")]
    Policy(#[from] PolicyError),

    #[error("upstream: {0}")]
    Upstream(#[from] UpstreamError),
}

/// HTTP server for the CORS gateway.
pub struct GatewayServer {
    router: Router,
    config: GatewayConfig,
}

impl GatewayServer {
    /// Create a new server with the given configuration.
    pub fn new(config: GatewayConfig) -> Result<Self, ServerError> {
        let policy = CorsPolicy::from_config(&config.cors)?;
        if policy.allows_credentials() {
            tracing::warn!(
                "CORS reflects any request Origin with credentials allowed; \
                 every origin can make credentialed requests"
            );
        }

        let upstream = Upstream::from_config(&config.upstream)?;
        let router = Self::build_router(&config, policy, upstream);

        Ok(Self { router, config })
    }

    /// Build the Axum router with all middleware layers.
    ///
    /// Layers run outermost first: request ID, trace, propagate ID, CORS,
    /// timeout. CORS sits outside the timeout so a 408 still carries it.
    #[allow(deprecated)]
    fn build_router(config: &GatewayConfig, policy: CorsPolicy, upstream: Upstream) -> Router {
        Router::new()
            .route("/healthz", get(healthz))
            .fallback(forward)
            .with_state(upstream)
            .layer(TimeoutLayer::new(Duration::from_secs(
                config.timeouts.request_secs,
            )))
            .layer(CorsLayer::with_policy(policy))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(
                TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        uri = %request.uri(),
                        request_id = %request_id(request),
                    )
                }),
            )
            .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
    }

    /// The fully layered router.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Serve on `listener` until `shutdown` fires.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            upstream = %self.config.upstream.base_url,
            "HTTP server starting"
        );

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}
