//! HTTP adapter implementing the Conveyor [`Agent`] contract.
//!
//! The engine treats agents as opaque remote collaborators; this crate
//! provides the one concrete adapter a deployment needs: an agent reached
//! over HTTP with a JSON request/response envelope and a per-call timeout.
//!
//! [`Agent`]: conveyor_core::Agent

/// The reqwest-backed HTTP agent.
pub mod http;

pub use http::HttpAgent;
