//! Tower middleware applied to every gateway route.

pub mod cors;

pub use cors::{Cors, CorsLayer, CorsPolicy, PolicyError};
