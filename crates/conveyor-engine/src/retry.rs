use conveyor_core::Phase;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Decides, per phase failure, whether and when to retry.
///
/// The retryable phase set is fixed by the workflow's semantics:
/// `TestGeneration`, `StagingDeployment`, and `Validation` are safe to
/// repeat; `GuardianReview` is human-gated and never retried. Delays grow
/// exponentially with symmetric ±20% jitter so many concurrent workflows
/// do not retry in lockstep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in milliseconds for the first retry.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Cap on the computed delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier applied per retry.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Whether a circuit-open rejection consumes a retry attempt.
    ///
    /// Default `false`: the runner waits the breaker's recovery timeout and
    /// re-enters the phase without touching the retry budget.
    #[serde(default)]
    pub circuit_open_counts_attempt: bool,
}

fn default_max_retries() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            circuit_open_counts_attempt: false,
        }
    }
}

impl RetryPolicy {
    /// Whether a phase may be retried at all.
    pub fn is_retryable_phase(&self, phase: Phase) -> bool {
        matches!(
            phase,
            Phase::TestGeneration | Phase::StagingDeployment | Phase::Validation
        )
    }

    /// Whether to retry after a failure, given the attempt count so far.
    ///
    /// `retry_count` is the number of failed attempts recorded, including
    /// the one that just happened. Retries continue while the phase is
    /// retryable and `retry_count <= max_retries`, so a permanently failing
    /// phase is attempted `max_retries + 1` times in total.
    pub fn should_retry(&self, phase: Phase, retry_count: u32) -> bool {
        self.is_retryable_phase(phase) && retry_count <= self.max_retries
    }

    /// Backoff delay before retry number `n` (0-based), with ±20% jitter.
    pub fn next_delay(&self, n: u32) -> Duration {
        let base = (self.initial_delay_ms as f64) * self.backoff_multiplier.powi(n as i32);
        let capped = base.min(self.max_delay_ms as f64);
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        Duration::from_millis((capped * jitter) as u64)
    }
}
