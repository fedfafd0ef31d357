use conveyor_core::Phase;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Rolling window sizes.
const DURATION_WINDOW: usize = 100;
const QUEUE_DEPTH_WINDOW: usize = 20;

/// Direction of the queue-depth trend over the sample window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueTrend {
    /// Depth is growing.
    Increasing,
    /// Depth is roughly flat (or too few samples to tell).
    Stable,
    /// Depth is shrinking.
    Decreasing,
}

#[derive(Debug, Default)]
struct MetricsInner {
    durations_ms: VecDeque<u64>,
    failures_by_phase: HashMap<Phase, u64>,
    queue_depths: VecDeque<usize>,
    completed: u64,
    failed: u64,
}

/// Process-wide pool metrics with a single accounting owner.
///
/// Mutated only by the executor pool on workflow start/stop; read by the
/// health monitor, the autoscaler, and the gateway via [`PoolMetrics::snapshot`].
/// The window state lives behind one mutex; the hot counters
/// (`active_count`, `max_concurrent`) are atomics.
pub struct PoolMetrics {
    inner: Mutex<MetricsInner>,
    active: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl PoolMetrics {
    /// Create metrics for a pool with the given initial concurrency limit.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            inner: Mutex::new(MetricsInner::default()),
            active: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(max_concurrent),
        }
    }

    /// A workflow entered execution.
    pub fn workflow_started(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    /// A workflow finished successfully; record its duration in the window.
    pub fn workflow_completed(&self, duration: Duration) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        inner.completed += 1;
        push_bounded(&mut inner.durations_ms, duration.as_millis() as u64, DURATION_WINDOW);
    }

    /// A workflow ended in failure.
    ///
    /// Phase attribution happens per attempt through
    /// [`PoolMetrics::phase_failure`], so the terminal transition only
    /// moves the workflow counters; counting the final phase here as well
    /// would tally its last attempt twice.
    pub fn workflow_failed(&self, duration: Duration) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        inner.failed += 1;
        push_bounded(&mut inner.durations_ms, duration.as_millis() as u64, DURATION_WINDOW);
    }

    /// Record one failed attempt at `phase`.
    pub fn phase_failure(&self, phase: Phase) {
        let mut inner = self.inner.lock();
        *inner.failures_by_phase.entry(phase).or_insert(0) += 1;
    }

    /// Record the current queue depth.
    pub fn sample_queue_depth(&self, depth: usize) {
        let mut inner = self.inner.lock();
        push_bounded(&mut inner.queue_depths, depth, QUEUE_DEPTH_WINDOW);
    }

    /// Number of workflows currently executing.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Current concurrency limit.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    /// Update the concurrency limit after a pool resize.
    pub fn set_max_concurrent(&self, max: usize) {
        self.max_concurrent.store(max, Ordering::SeqCst);
    }

    /// Fraction of the permit pool in use, 0.0–1.0.
    pub fn utilization(&self) -> f64 {
        let max = self.max_concurrent().max(1);
        self.active_count() as f64 / max as f64
    }

    /// Produce a consistent, serializable view of the metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock();
        let mut sorted: Vec<u64> = inner.durations_ms.iter().copied().collect();
        sorted.sort_unstable();

        let total = inner.completed + inner.failed;
        let failure_rate = if total == 0 {
            0.0
        } else {
            inner.failed as f64 / total as f64
        };

        MetricsSnapshot {
            active_count: self.active_count(),
            max_concurrent: self.max_concurrent(),
            utilization: self.utilization(),
            completed: inner.completed,
            failed: inner.failed,
            failure_rate,
            failures_by_phase: inner
                .failures_by_phase
                .iter()
                .map(|(phase, count)| (phase.to_string(), *count))
                .collect(),
            p50_ms: percentile(&sorted, 0.50),
            p95_ms: percentile(&sorted, 0.95),
            p99_ms: percentile(&sorted, 0.99),
            queue_depth: inner.queue_depths.back().copied().unwrap_or(0),
            queue_trend: trend(&inner.queue_depths),
        }
    }
}

fn push_bounded<T>(window: &mut VecDeque<T>, value: T, cap: usize) {
    if window.len() == cap {
        window.pop_front();
    }
    window.push_back(value);
}

/// Nearest-rank percentile over an ascending-sorted slice.
fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((sorted.len() as f64 * p).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1]
}

/// Least-squares slope over the sample window, bucketed into a trend.
fn trend(samples: &VecDeque<usize>) -> QueueTrend {
    if samples.len() < 3 {
        return QueueTrend::Stable;
    }
    let n = samples.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = samples.iter().sum::<usize>() as f64 / n;
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, &y) in samples.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y as f64 - mean_y);
        den += dx * dx;
    }
    let slope = if den == 0.0 { 0.0 } else { num / den };
    if slope > 0.1 {
        QueueTrend::Increasing
    } else if slope < -0.1 {
        QueueTrend::Decreasing
    } else {
        QueueTrend::Stable
    }
}

/// Point-in-time view of [`PoolMetrics`], as served by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Workflows currently executing.
    pub active_count: usize,
    /// Current concurrency limit.
    pub max_concurrent: usize,
    /// `active_count / max_concurrent`.
    pub utilization: f64,
    /// Workflows that reached `Complete(success)`.
    pub completed: u64,
    /// Workflows that reached `Complete(failed)`.
    pub failed: u64,
    /// `failed / (completed + failed)`.
    pub failure_rate: f64,
    /// Failed attempts per phase, keyed by phase name.
    pub failures_by_phase: HashMap<String, u64>,
    /// Median workflow duration over the rolling window, milliseconds.
    pub p50_ms: u64,
    /// 95th percentile workflow duration, milliseconds.
    pub p95_ms: u64,
    /// 99th percentile workflow duration, milliseconds.
    pub p99_ms: u64,
    /// Most recent queue depth sample.
    pub queue_depth: usize,
    /// Queue-depth direction over the sample window.
    pub queue_trend: QueueTrend,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_active_accounting_and_utilization() {
        let metrics = PoolMetrics::new(4);
        assert_eq!(metrics.utilization(), 0.0);

        metrics.workflow_started();
        metrics.workflow_started();
        assert_eq!(metrics.active_count(), 2);
        assert_eq!(metrics.utilization(), 0.5);

        metrics.workflow_completed(Duration::from_millis(100));
        assert_eq!(metrics.active_count(), 1);
    }

    #[test]
    fn test_duration_window_is_bounded() {
        let metrics = PoolMetrics::new(4);
        for i in 0..150 {
            metrics.workflow_started();
            metrics.workflow_completed(Duration::from_millis(i));
        }
        let inner = metrics.inner.lock();
        assert_eq!(inner.durations_ms.len(), DURATION_WINDOW);
        // Oldest entries evicted: the window starts at 50.
        assert_eq!(inner.durations_ms.front().copied(), Some(50));
    }

    #[test]
    fn test_percentiles() {
        let metrics = PoolMetrics::new(4);
        for ms in 1..=100u64 {
            metrics.workflow_started();
            metrics.workflow_completed(Duration::from_millis(ms));
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.p50_ms, 50);
        assert_eq!(snap.p95_ms, 95);
        assert_eq!(snap.p99_ms, 99);
    }

    #[test]
    fn test_empty_snapshot_is_zeroed() {
        let snap = PoolMetrics::new(4).snapshot();
        assert_eq!(snap.p50_ms, 0);
        assert_eq!(snap.failure_rate, 0.0);
        assert_eq!(snap.queue_depth, 0);
        assert_eq!(snap.queue_trend, QueueTrend::Stable);
    }

    #[test]
    fn test_failure_rate_and_phase_counters() {
        let metrics = PoolMetrics::new(4);
        metrics.workflow_started();
        metrics.workflow_completed(Duration::from_millis(10));

        // Two failed attempts, then the workflow dead-letters: the phase
        // counter holds exactly the attempts, not attempts + terminal.
        metrics.workflow_started();
        metrics.phase_failure(Phase::StagingDeployment);
        metrics.phase_failure(Phase::StagingDeployment);
        metrics.workflow_failed(Duration::from_millis(20));

        let snap = metrics.snapshot();
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.failure_rate, 0.5);
        assert_eq!(snap.failures_by_phase["staging_deployment"], 2);
    }

    #[test]
    fn test_queue_trend() {
        let metrics = PoolMetrics::new(4);
        for depth in [1usize, 3, 5, 7, 9, 11] {
            metrics.sample_queue_depth(depth);
        }
        assert_eq!(metrics.snapshot().queue_trend, QueueTrend::Increasing);

        let metrics = PoolMetrics::new(4);
        for depth in [11usize, 9, 7, 5, 3, 1] {
            metrics.sample_queue_depth(depth);
        }
        assert_eq!(metrics.snapshot().queue_trend, QueueTrend::Decreasing);

        let metrics = PoolMetrics::new(4);
        for depth in [5usize, 5, 5, 5] {
            metrics.sample_queue_depth(depth);
        }
        assert_eq!(metrics.snapshot().queue_trend, QueueTrend::Stable);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = PoolMetrics::new(2);
        metrics.workflow_started();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["active_count"], 1);
        assert_eq!(json["max_concurrent"], 2);
    }
}
