use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One named step of a task's workflow, each delegated to an external agent.
///
/// Phases advance linearly via [`Phase::next`]; only a retry re-enters the
/// same phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Initial bookkeeping phase; no agent call.
    Received,
    /// Generate tests for the task's change set.
    TestGeneration,
    /// Deploy to the staging environment.
    StagingDeployment,
    /// Human-gated review; a rejection here is terminal, never retried.
    GuardianReview,
    /// Validate the deployed change.
    Validation,
    /// Terminal phase; carries a [`WorkflowVerdict`] on the workflow.
    Complete,
}

impl Phase {
    /// The phase that follows this one, or `None` for `Complete`.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Received => Some(Phase::TestGeneration),
            Phase::TestGeneration => Some(Phase::StagingDeployment),
            Phase::StagingDeployment => Some(Phase::GuardianReview),
            Phase::GuardianReview => Some(Phase::Validation),
            Phase::Validation => Some(Phase::Complete),
            Phase::Complete => None,
        }
    }

    /// Whether this phase requires an external agent call.
    pub fn needs_agent(self) -> bool {
        !matches!(self, Phase::Received | Phase::Complete)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Received => write!(f, "received"),
            Phase::TestGeneration => write!(f, "test_generation"),
            Phase::StagingDeployment => write!(f, "staging_deployment"),
            Phase::GuardianReview => write!(f, "guardian_review"),
            Phase::Validation => write!(f, "validation"),
            Phase::Complete => write!(f, "complete"),
        }
    }
}

/// Outcome of a single phase attempt, recorded in the history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOutcome {
    /// The agent reported success.
    Success,
    /// The attempt failed with an error (retryable subject to policy).
    Failure {
        /// The error text for diagnosis.
        error: String,
    },
    /// The agent explicitly rejected the work (business rejection).
    Rejected {
        /// The agent's stated reason.
        reason: String,
    },
}

/// Terminal result of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowVerdict {
    /// All phases completed successfully.
    Success,
    /// The workflow ended in failure or rejection.
    Failed {
        /// Why the workflow failed.
        reason: String,
    },
}

/// One attempt at one phase, as recorded in the append-only history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    /// The phase that was attempted.
    pub phase: Phase,
    /// 1-based attempt number within this phase.
    pub attempt: u32,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// When the attempt finished.
    pub completed_at: DateTime<Utc>,
    /// How the attempt ended.
    pub outcome: PhaseOutcome,
}

/// The per-task workflow state machine.
///
/// A `Workflow` is owned exclusively by the executor task driving it; on
/// terminal it is snapshotted to the store and dropped. `phase_history` is
/// append-only and `current_phase` advances monotonically except when a
/// retry re-enters the same phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// The task this workflow executes.
    pub task_id: Uuid,
    /// The phase currently executing (or about to execute).
    pub current_phase: Phase,
    /// Ordered record of every phase attempt.
    pub phase_history: Vec<PhaseRecord>,
    /// Set once the workflow reaches `Complete`.
    pub verdict: Option<WorkflowVerdict>,
}

impl Workflow {
    /// Create a workflow at its initial phase for the given task.
    pub fn new(task_id: Uuid) -> Self {
        Self {
            task_id,
            current_phase: Phase::Received,
            phase_history: Vec::new(),
            verdict: None,
        }
    }

    /// Whether the workflow has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.verdict.is_some()
    }

    /// Append an attempt record for the current phase.
    pub fn record_attempt(
        &mut self,
        attempt: u32,
        started_at: DateTime<Utc>,
        outcome: PhaseOutcome,
    ) {
        self.phase_history.push(PhaseRecord {
            phase: self.current_phase,
            attempt,
            started_at,
            completed_at: Utc::now(),
            outcome,
        });
    }

    /// Advance to the next phase after a successful attempt.
    ///
    /// Advancing past `Validation` lands on `Complete` with a `Success`
    /// verdict. Advancing from `Complete` is a no-op.
    pub fn advance(&mut self) {
        if let Some(next) = self.current_phase.next() {
            self.current_phase = next;
            if next == Phase::Complete {
                self.verdict = Some(WorkflowVerdict::Success);
            }
        }
    }

    /// Terminate the workflow in failure.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.current_phase = Phase::Complete;
        self.verdict = Some(WorkflowVerdict::Failed {
            reason: reason.into(),
        });
    }

    /// Number of attempts recorded for the current phase.
    pub fn attempts_for_current_phase(&self) -> u32 {
        self.phase_history
            .iter()
            .filter(|r| r.phase == self.current_phase)
            .count() as u32
    }

    /// Produce a persistence snapshot of the workflow.
    pub fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            task_id: self.task_id,
            current_phase: self.current_phase,
            phase_history: self.phase_history.clone(),
            verdict: self.verdict.clone(),
        }
    }
}

/// Serialized workflow state as persisted to the task store and surfaced
/// by the gateway's task-detail endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    /// The task this snapshot belongs to.
    pub task_id: Uuid,
    /// Phase at snapshot time.
    pub current_phase: Phase,
    /// Full attempt history at snapshot time.
    pub phase_history: Vec<PhaseRecord>,
    /// Terminal verdict, if reached.
    pub verdict: Option<WorkflowVerdict>,
}
