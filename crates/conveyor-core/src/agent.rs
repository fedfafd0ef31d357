use crate::workflow::Phase;
use crate::ConveyorResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a phase agent call.
///
/// Errors (network, timeout, agent crash) are returned as `Err` from
/// [`Agent::execute`]; this enum only covers calls that completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    /// The agent completed the phase, optionally with structured result data.
    Completed {
        /// Structured result data, if the agent produced any.
        data: Option<serde_json::Value>,
    },
    /// The agent explicitly declined the work (e.g. review rejected).
    ///
    /// This is a business outcome, not a fault; the engine never retries it.
    Rejected {
        /// The agent's stated reason.
        reason: String,
    },
}

/// An external specialist that executes one workflow phase.
///
/// Agents are fallible, possibly slow, remote collaborators. No idempotency
/// is assumed: retryable phases are defined to be safe to repeat, and
/// non-idempotent phases (human-gated review) are marked non-retryable by
/// the retry policy instead.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Execute `phase` against `payload`, bounded by `timeout`.
    async fn execute(
        &self,
        phase: Phase,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> ConveyorResult<AgentOutcome>;
}

/// Fixed phase → agent map, resolved once at startup.
///
/// Each agent phase maps to exactly one named [`Agent`]; the name keys the
/// per-agent circuit breaker. Dispatch is a plain map lookup, no runtime
/// reflection.
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<Phase, (String, Arc<dyn Agent>)>,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `agent` under `name` for `phase`, replacing any previous
    /// registration for that phase.
    pub fn register(
        mut self,
        phase: Phase,
        name: impl Into<String>,
        agent: Arc<dyn Agent>,
    ) -> Self {
        self.agents.insert(phase, (name.into(), agent));
        self
    }

    /// Resolve the agent for a phase.
    pub fn resolve(&self, phase: Phase) -> Option<(&str, Arc<dyn Agent>)> {
        self.agents
            .get(&phase)
            .map(|(name, agent)| (name.as_str(), Arc::clone(agent)))
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether no agents are registered.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
