//! HTTP surface over the engine: task submission and lookup, pool metrics,
//! health, and dead-letter remediation.
//!
//! # Main types
//!
//! - [`GatewayServer`] — Builds and serves the axum router.
//! - [`AppState`] — Shared handles the handlers read from.

/// Router, handlers, and serving.
pub mod server;

pub use server::{AppState, GatewayServer};
