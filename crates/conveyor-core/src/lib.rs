//! Core types and error definitions for the Conveyor workflow engine.
//!
//! This crate provides the foundational types shared across all Conveyor
//! crates: the task record, the workflow state machine data model, and the
//! external contracts the engine consumes ([`TaskStore`] and [`Agent`]).
//!
//! # Main types
//!
//! - [`ConveyorError`] — Unified error enum for all Conveyor subsystems.
//! - [`ConveyorResult`] — Convenience alias for `Result<T, ConveyorError>`.
//! - [`Task`] — A unit of work submitted to the engine.
//! - [`Workflow`] — The per-task phase execution record.
//! - [`TaskStore`] — Durable task storage with an atomic claim operation.
//! - [`Agent`] — An external specialist that executes one phase.

/// External agent contract and the phase → agent registry.
pub mod agent;
/// Task store contract.
pub mod store;
/// Task record and status lifecycle.
pub mod task;
/// Workflow phases, history, and terminal verdicts.
pub mod workflow;

pub use agent::{Agent, AgentOutcome, AgentRegistry};
pub use store::TaskStore;
pub use task::{Task, TaskStatus};
pub use workflow::{
    Phase, PhaseOutcome, PhaseRecord, Workflow, WorkflowSnapshot, WorkflowVerdict,
};

/// Top-level error type for the Conveyor engine.
///
/// Each variant corresponds to a subsystem that can produce errors. The
/// [`ConveyorError::CircuitOpen`] variant is deliberately distinct from
/// [`ConveyorError::Agent`] so callers never misattribute a breaker
/// rejection to the agent itself.
#[derive(Debug, thiserror::Error)]
pub enum ConveyorError {
    /// An error from a phase agent call (including call timeouts).
    #[error("Agent error: {0}")]
    Agent(String),

    /// An outbound HTTP error when talking to a remote agent.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Rejected without invoking the agent because its breaker is open.
    #[error("Circuit open for agent '{agent}'")]
    CircuitOpen {
        /// Name of the agent whose breaker rejected the call.
        agent: String,
    },

    /// An error from the task store.
    #[error("Store error: {0}")]
    Store(String),

    /// An error in the executor pool or workflow driver.
    #[error("Engine error: {0}")]
    Engine(String),

    /// An error from the API gateway layer.
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`ConveyorError`].
pub type ConveyorResult<T> = Result<T, ConveyorError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn circuit_open_error_is_distinct() {
        let err = ConveyorError::CircuitOpen {
            agent: "deployer".into(),
        };
        assert!(err.to_string().contains("deployer"));
        assert!(err.to_string().starts_with("Circuit open"));
    }

    #[test]
    fn json_error_converts() {
        let bad: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: ConveyorError = bad.unwrap_err().into();
        assert!(matches!(err, ConveyorError::Json(_)));
    }
}
