//! CORS gateway for a tus resumable-upload server.
//!
//! The core is [`http::middleware::cors`]: a tower layer that writes the
//! `Access-Control-*` headers on every response and answers `OPTIONS`
//! preflights itself. The rest of the crate runs that layer in front of an
//! upstream tus server.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;

pub use config::GatewayConfig;
pub use http::{CorsLayer, GatewayServer};
pub use lifecycle::Shutdown;
