use crate::circuit::{CircuitBreaker, CircuitBreakerRegistry};
use crate::dlq::DeadLetterQueue;
use crate::metrics::PoolMetrics;
use crate::retry::RetryPolicy;
use chrono::Utc;
use conveyor_core::{
    AgentOutcome, AgentRegistry, ConveyorError, ConveyorResult, PhaseOutcome, Task, TaskStatus,
    TaskStore, Workflow, WorkflowVerdict,
};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Drives one claimed task's workflow to a terminal state.
///
/// The runner owns the `Workflow` value for the task's lifetime: phases
/// execute strictly sequentially, every attempt is appended to the history
/// and snapshotted to the store, and the task record's final status is
/// written before the runner returns. Failure routing follows the error
/// taxonomy: transient errors retry with backoff, circuit-open rejections
/// wait out the breaker (without consuming budget, unless configured
/// otherwise), business rejections terminate immediately with no
/// dead-letter entry, and exhausted retries dead-letter the workflow.
pub struct WorkflowRunner {
    store: Arc<dyn TaskStore>,
    agents: Arc<AgentRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryPolicy,
    dlq: Arc<DeadLetterQueue>,
    metrics: Arc<PoolMetrics>,
    agent_timeout: Duration,
}

impl WorkflowRunner {
    /// Create a runner over the shared engine collaborators.
    pub fn new(
        store: Arc<dyn TaskStore>,
        agents: Arc<AgentRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        retry: RetryPolicy,
        dlq: Arc<DeadLetterQueue>,
        metrics: Arc<PoolMetrics>,
        agent_timeout: Duration,
    ) -> Self {
        Self {
            store,
            agents,
            breakers,
            retry,
            dlq,
            metrics,
            agent_timeout,
        }
    }

    /// Execute the workflow for a claimed task until it is terminal.
    ///
    /// Returns the verdict; `Err` only for store failures, which leave the
    /// task for the claim-expiry path of the backing store.
    pub async fn run(&self, mut task: Task) -> ConveyorResult<WorkflowVerdict> {
        let mut workflow = Workflow::new(task.id);
        task.status = TaskStatus::Running;
        self.store.persist(&task).await?;

        info!(task_id = %task.id, priority = task.priority, "Workflow started");

        while !workflow.is_terminal() {
            let phase = workflow.current_phase;

            if !phase.needs_agent() {
                workflow.record_attempt(1, Utc::now(), PhaseOutcome::Success);
                workflow.advance();
                self.store
                    .update_workflow_state(task.id, &workflow.snapshot())
                    .await?;
                continue;
            }

            let Some((agent_name, agent)) = self.agents.resolve(phase) else {
                // No agent for a required phase is a wiring fault, not a
                // transient failure; dead-letter for remediation.
                let reason = format!("no agent registered for phase {phase}");
                error!(task_id = %task.id, phase = %phase, "{}", reason);
                return self
                    .finish_failed(task, workflow, reason, true)
                    .await;
            };
            let agent_name = agent_name.to_string();
            let breaker = self.breakers.breaker(&agent_name);

            if let Err(ConveyorError::CircuitOpen { .. }) = breaker.acquire() {
                if self.retry.circuit_open_counts_attempt {
                    task.retry_count += 1;
                    let err = ConveyorError::CircuitOpen {
                        agent: agent_name.clone(),
                    };
                    workflow.record_attempt(
                        workflow.attempts_for_current_phase() + 1,
                        Utc::now(),
                        PhaseOutcome::Failure {
                            error: err.to_string(),
                        },
                    );
                    match self
                        .handle_phase_failure(&mut task, &mut workflow, err.to_string())
                        .await?
                    {
                        FailureRouting::Retry => {
                            // Circuit-open waits out the breaker, not the
                            // exponential schedule.
                            tokio::time::sleep(self.breaker_wait(&breaker)).await;
                            continue;
                        }
                        FailureRouting::Exhausted(reason) => {
                            return self.finish_failed(task, workflow, reason, true).await;
                        }
                    }
                } else {
                    warn!(
                        task_id = %task.id,
                        phase = %phase,
                        agent = %agent_name,
                        "Circuit open, waiting out recovery timeout"
                    );
                    tokio::time::sleep(self.breaker_wait(&breaker)).await;
                    continue;
                }
            }

            let attempt = workflow.attempts_for_current_phase() + 1;
            let started_at = Utc::now();

            // A panicking agent must not take the executor down: convert the
            // panic into a phase failure at this phase.
            let call = AssertUnwindSafe(tokio::time::timeout(
                self.agent_timeout,
                agent.execute(phase, &task.payload, self.agent_timeout),
            ))
            .catch_unwind()
            .await;

            let result = match call {
                Ok(Ok(result)) => result,
                Ok(Err(_elapsed)) => Err(ConveyorError::Agent(format!(
                    "phase {phase} timed out after {:?}",
                    self.agent_timeout
                ))),
                Err(_panic) => Err(ConveyorError::Agent(format!(
                    "agent panicked during phase {phase}"
                ))),
            };

            match result {
                Ok(AgentOutcome::Completed { .. }) => {
                    breaker.record_success();
                    workflow.record_attempt(attempt, started_at, PhaseOutcome::Success);
                    workflow.advance();
                    self.store
                        .update_workflow_state(task.id, &workflow.snapshot())
                        .await?;
                    info!(task_id = %task.id, phase = %phase, attempt, "Phase completed");
                }
                Ok(AgentOutcome::Rejected { reason }) => {
                    // Business rejection: the agent worked, the answer was
                    // no. Terminal, no retries, no dead-letter entry.
                    breaker.record_success();
                    workflow.record_attempt(
                        attempt,
                        started_at,
                        PhaseOutcome::Rejected {
                            reason: reason.clone(),
                        },
                    );
                    info!(task_id = %task.id, phase = %phase, reason = %reason, "Phase rejected");
                    return self
                        .finish_failed(task, workflow, format!("{phase} rejected: {reason}"), false)
                        .await;
                }
                Err(err) => {
                    breaker.record_failure();
                    task.retry_count += 1;
                    workflow.record_attempt(
                        attempt,
                        started_at,
                        PhaseOutcome::Failure {
                            error: err.to_string(),
                        },
                    );
                    match self
                        .handle_phase_failure(&mut task, &mut workflow, err.to_string())
                        .await?
                    {
                        FailureRouting::Retry => {
                            let delay = self.retry.next_delay(task.retry_count.saturating_sub(1));
                            info!(
                                task_id = %task.id,
                                phase = %phase,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                "Retrying phase after backoff"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        FailureRouting::Exhausted(reason) => {
                            return self.finish_failed(task, workflow, reason, true).await;
                        }
                    }
                }
            }
        }

        self.finish_success(task, workflow).await
    }

    /// How long to wait before re-entering a phase whose breaker rejected
    /// the call: the remaining recovery time, floored at the initial retry
    /// delay so half-open probe-cap rejections poll instead of spinning.
    fn breaker_wait(&self, breaker: &CircuitBreaker) -> Duration {
        breaker
            .time_until_probe()
            .max(Duration::from_millis(self.retry.initial_delay_ms))
    }

    /// Common accounting for a failed attempt; decides retry vs exhaustion.
    async fn handle_phase_failure(
        &self,
        task: &mut Task,
        workflow: &mut Workflow,
        error: String,
    ) -> ConveyorResult<FailureRouting> {
        let phase = workflow.current_phase;
        self.metrics.phase_failure(phase);
        warn!(
            task_id = %task.id,
            phase = %phase,
            attempt = task.retry_count,
            error = %error,
            "Phase failed"
        );

        self.store.persist(task).await?;
        self.store
            .update_workflow_state(task.id, &workflow.snapshot())
            .await?;

        if self.retry.should_retry(phase, task.retry_count) {
            Ok(FailureRouting::Retry)
        } else {
            Ok(FailureRouting::Exhausted(error))
        }
    }

    async fn finish_success(
        &self,
        mut task: Task,
        workflow: Workflow,
    ) -> ConveyorResult<WorkflowVerdict> {
        task.status = TaskStatus::Completed;
        self.store.persist(&task).await?;
        self.store
            .update_workflow_state(task.id, &workflow.snapshot())
            .await?;
        info!(task_id = %task.id, "Workflow completed");
        Ok(WorkflowVerdict::Success)
    }

    async fn finish_failed(
        &self,
        mut task: Task,
        mut workflow: Workflow,
        reason: String,
        dead_letter: bool,
    ) -> ConveyorResult<WorkflowVerdict> {
        workflow.fail(reason.clone());
        task.status = TaskStatus::Failed {
            reason: reason.clone(),
        };
        self.store.persist(&task).await?;
        self.store
            .update_workflow_state(task.id, &workflow.snapshot())
            .await?;

        if dead_letter {
            self.dlq
                .enqueue(task.id, workflow.snapshot(), &reason, task.retry_count);
        }

        warn!(task_id = %task.id, reason = %reason, dead_letter, "Workflow failed");
        Ok(WorkflowVerdict::Failed { reason })
    }
}

enum FailureRouting {
    Retry,
    Exhausted(String),
}
