//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, layer stack)
//!     → request.rs (request ID)
//!     → middleware/cors.rs (CORS headers, preflight short-circuit)
//!     → health.rs (GET /healthz) | upstream.rs (forward to tus server)
//!     → Send to client
//! ```

pub mod health;
pub mod middleware;
pub mod request;
pub mod server;
pub mod upstream;

pub use middleware::{Cors, CorsLayer, CorsPolicy};
pub use request::{UuidRequestId, X_REQUEST_ID};
pub use server::{GatewayServer, ServerError};
