use crate::circuit::{BreakerState, CircuitBreakerRegistry};
use crate::dlq::DeadLetterQueue;
use crate::metrics::{MetricsSnapshot, PoolMetrics, QueueTrend};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Thresholds the monitor grades metrics against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthThresholds {
    /// Utilization above this is at least degraded.
    #[serde(default = "default_degraded_utilization")]
    pub degraded_utilization: f64,
    /// Utilization above this, sustained, is unhealthy.
    #[serde(default = "default_unhealthy_utilization")]
    pub unhealthy_utilization: f64,
    /// Seconds the unhealthy utilization must persist before it counts.
    #[serde(default = "default_sustained_secs")]
    pub sustained_secs: u64,
    /// Overall failure rate above this is degraded.
    #[serde(default = "default_degraded_failure_rate")]
    pub degraded_failure_rate: f64,
    /// Overall failure rate above this is unhealthy.
    #[serde(default = "default_unhealthy_failure_rate")]
    pub unhealthy_failure_rate: f64,
    /// Seconds between periodic health log lines.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_degraded_utilization() -> f64 {
    0.8
}
fn default_unhealthy_utilization() -> f64 {
    0.95
}
fn default_sustained_secs() -> u64 {
    300
}
fn default_degraded_failure_rate() -> f64 {
    0.1
}
fn default_unhealthy_failure_rate() -> f64 {
    0.5
}
fn default_check_interval_secs() -> u64 {
    30
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded_utilization: default_degraded_utilization(),
            unhealthy_utilization: default_unhealthy_utilization(),
            sustained_secs: default_sustained_secs(),
            degraded_failure_rate: default_degraded_failure_rate(),
            unhealthy_failure_rate: default_unhealthy_failure_rate(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

/// Coarse health grade, worst observation wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// All signals within thresholds.
    Healthy,
    /// Some signal is elevated; action recommended.
    Degraded,
    /// A signal breached its hard threshold.
    Unhealthy,
}

/// One health evaluation, as served by the gateway's health endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall grade.
    pub status: HealthStatus,
    /// Human-readable remediation hints, empty when healthy.
    pub recommendations: Vec<String>,
    /// The metrics this report was graded from.
    pub metrics: MetricsSnapshot,
    /// Current breaker state per agent name.
    pub breakers: HashMap<String, BreakerState>,
    /// Dead-letter entries awaiting remediation.
    pub dlq_unresolved: usize,
}

/// Grades pool metrics into a health status with recommendations.
///
/// Read-only over the metrics stream; the only state it keeps is the
/// timestamp since which utilization has been above the unhealthy
/// threshold, for the sustained-overload rule.
pub struct HealthMonitor {
    thresholds: HealthThresholds,
    metrics: Arc<PoolMetrics>,
    breakers: Arc<CircuitBreakerRegistry>,
    dlq: Arc<DeadLetterQueue>,
    overloaded_since: Mutex<Option<Instant>>,
}

impl HealthMonitor {
    /// Create a monitor over the shared observability state.
    pub fn new(
        thresholds: HealthThresholds,
        metrics: Arc<PoolMetrics>,
        breakers: Arc<CircuitBreakerRegistry>,
        dlq: Arc<DeadLetterQueue>,
    ) -> Self {
        Self {
            thresholds,
            metrics,
            breakers,
            dlq,
            overloaded_since: Mutex::new(None),
        }
    }

    /// Evaluate current state into a report.
    pub fn report(&self) -> HealthReport {
        let metrics = self.metrics.snapshot();
        let breakers = self.breakers.states();
        let dlq_unresolved = self.dlq.unresolved_count();
        let t = &self.thresholds;

        let mut status = HealthStatus::Healthy;
        let mut recommendations = Vec::new();

        let sustained_overload = {
            let mut since = self.overloaded_since.lock();
            if metrics.utilization >= t.unhealthy_utilization {
                let start = since.get_or_insert_with(Instant::now);
                start.elapsed() >= Duration::from_secs(t.sustained_secs)
            } else {
                *since = None;
                false
            }
        };

        if sustained_overload {
            status = status.max(HealthStatus::Unhealthy);
            recommendations.push(format!(
                "utilization has been at or above {:.0}% for over {}s: increase max_concurrent or add executors",
                t.unhealthy_utilization * 100.0,
                t.sustained_secs
            ));
        } else if metrics.utilization >= t.degraded_utilization {
            status = status.max(HealthStatus::Degraded);
            recommendations.push("utilization is high: consider increasing max_concurrent".to_string());
        }

        if metrics.failure_rate >= t.unhealthy_failure_rate {
            status = status.max(HealthStatus::Unhealthy);
            recommendations.push(format!(
                "failure rate {:.0}% exceeds {:.0}%: inspect failing phases and the dead-letter queue",
                metrics.failure_rate * 100.0,
                t.unhealthy_failure_rate * 100.0
            ));
        } else if metrics.failure_rate >= t.degraded_failure_rate {
            status = status.max(HealthStatus::Degraded);
            recommendations.push(format!(
                "failure rate {:.0}% is elevated: inspect failing phases",
                metrics.failure_rate * 100.0
            ));
        }

        if metrics.queue_trend == QueueTrend::Increasing
            && metrics.utilization >= t.degraded_utilization
        {
            status = status.max(HealthStatus::Degraded);
            recommendations
                .push("queue depth is growing while the pool is busy: throughput is falling behind".to_string());
        }

        let open: Vec<&str> = breakers
            .iter()
            .filter(|(_, state)| **state == BreakerState::Open)
            .map(|(name, _)| name.as_str())
            .collect();
        if !open.is_empty() {
            status = status.max(HealthStatus::Degraded);
            recommendations.push(format!(
                "circuit breaker open for agent(s) {}: investigate the agent endpoint",
                open.join(", ")
            ));
        }

        if dlq_unresolved > 0 {
            recommendations.push(format!(
                "{dlq_unresolved} dead-letter entr{} awaiting remediation",
                if dlq_unresolved == 1 { "y" } else { "ies" }
            ));
        }

        HealthReport {
            status,
            recommendations,
            metrics,
            breakers,
            dlq_unresolved,
        }
    }

    /// Periodically evaluate and log; runs until the task is dropped.
    pub async fn run(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.thresholds.check_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let report = self.report();
            match report.status {
                HealthStatus::Healthy => info!(
                    utilization = report.metrics.utilization,
                    active = report.metrics.active_count,
                    "Pool healthy"
                ),
                _ => warn!(
                    status = ?report.status,
                    utilization = report.metrics.utilization,
                    failure_rate = report.metrics.failure_rate,
                    recommendations = ?report.recommendations,
                    "Pool health degraded"
                ),
            }
        }
    }
}
