use conveyor_core::{ConveyorError, ConveyorResult};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Breaker tuning, shared by every breaker in a registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker open.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Milliseconds an open breaker waits before allowing a probe.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    /// Maximum concurrent probe calls while half-open.
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout_ms() -> u64 {
    60_000
}
fn default_half_open_max_calls() -> u32 {
    3
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Recovery timeout as a [`Duration`].
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Breaker state for one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls flow normally; consecutive failures are counted.
    Closed,
    /// Calls are rejected immediately without invoking the agent.
    Open,
    /// A bounded number of probe calls may pass through.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
}

/// Failure-isolation gate for one agent name.
///
/// All state mutation happens under a single mutex, so the accounting has
/// one serialization point regardless of how many workflows call through.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker for `name`.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                opened_at: None,
                half_open_in_flight: 0,
            }),
        }
    }

    /// The agent name this breaker guards.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state (for metrics/inspection; may be stale immediately).
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Ask to make a call through the breaker.
    ///
    /// `Closed` admits the call. `Open` admits nothing until the recovery
    /// timeout elapses, at which point the next caller flips the breaker to
    /// `HalfOpen` and becomes the first probe. `HalfOpen` admits up to
    /// `half_open_max_calls` concurrent probes; extra callers are rejected
    /// as if open. Every admitted call must be paired with exactly one
    /// [`CircuitBreaker::record_success`] or
    /// [`CircuitBreaker::record_failure`].
    pub fn acquire(&self) -> ConveyorResult<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.recovery_timeout() {
                    info!(agent = %self.name, "Circuit breaker half-open, probing");
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_in_flight = 1;
                    Ok(())
                } else {
                    Err(ConveyorError::CircuitOpen {
                        agent: self.name.clone(),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_calls {
                    inner.half_open_in_flight += 1;
                    Ok(())
                } else {
                    Err(ConveyorError::CircuitOpen {
                        agent: self.name.clone(),
                    })
                }
            }
        }
    }

    /// Time remaining until an open breaker admits a probe.
    ///
    /// Zero once the recovery timeout has elapsed, and for breakers that
    /// are not open.
    pub fn time_until_probe(&self) -> Duration {
        let inner = self.inner.lock();
        match (inner.state, inner.opened_at) {
            (BreakerState::Open, Some(opened_at)) => self
                .config
                .recovery_timeout()
                .saturating_sub(opened_at.elapsed()),
            _ => Duration::ZERO,
        }
    }

    /// Record a successful call admitted by [`CircuitBreaker::acquire`].
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                info!(agent = %self.name, "Circuit breaker closed after successful probe");
                inner.state = BreakerState::Closed;
                inner.failure_count = 0;
                inner.opened_at = None;
                inner.half_open_in_flight = 0;
            }
            _ => {
                inner.failure_count = 0;
            }
        }
    }

    /// Record a failed call admitted by [`CircuitBreaker::acquire`].
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                warn!(agent = %self.name, "Probe failed, circuit breaker re-opened");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_in_flight = 0;
            }
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        agent = %self.name,
                        failures = inner.failure_count,
                        "Failure threshold reached, circuit breaker opened"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::Open => {
                // A call admitted before the trip can still report its
                // failure after the trip; the timer keeps the later trip.
                inner.opened_at = Some(Instant::now());
            }
        }
    }
}

/// Lazily-populated map of agent name → breaker, one breaker per agent.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry whose breakers share `config`.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// The shared breaker configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get or create the breaker for an agent name.
    pub fn breaker(&self, agent: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(agent) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write();
        Arc::clone(
            breakers
                .entry(agent.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(agent, self.config.clone()))),
        )
    }

    /// Snapshot of every known breaker's state.
    pub fn states(&self) -> HashMap<String, BreakerState> {
        self.breakers
            .read()
            .iter()
            .map(|(name, b)| (name.clone(), b.state()))
            .collect()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout_ms: 50,
            half_open_max_calls: 2,
        }
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("deployer", fast_config());
        for _ in 0..2 {
            breaker.acquire().unwrap();
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.acquire().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        // Open rejects without invoking anything.
        match breaker.acquire() {
            Err(ConveyorError::CircuitOpen { agent }) => assert_eq!(agent, "deployer"),
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let breaker = CircuitBreaker::new("x", fast_config());
        breaker.acquire().unwrap();
        breaker.record_failure();
        breaker.acquire().unwrap();
        breaker.record_failure();
        breaker.acquire().unwrap();
        breaker.record_success(); // breaks the streak
        breaker.acquire().unwrap();
        breaker.record_failure();
        breaker.acquire().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_probe_success_closes() {
        let breaker = CircuitBreaker::new("x", fast_config());
        for _ in 0..3 {
            breaker.acquire().unwrap();
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(60));
        breaker.acquire().unwrap(); // flips to half-open
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);

        // failure_count was reset: one new failure must not re-open.
        breaker.acquire().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::new("x", fast_config());
        for _ in 0..3 {
            breaker.acquire().unwrap();
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        breaker.acquire().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        // The recovery timer restarted: immediate acquire is rejected.
        assert!(breaker.acquire().is_err());
    }

    #[test]
    fn test_half_open_caps_concurrent_probes() {
        let breaker = CircuitBreaker::new("x", fast_config()); // max 2 probes
        for _ in 0..3 {
            breaker.acquire().unwrap();
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));

        breaker.acquire().unwrap(); // probe 1 (flips to half-open)
        breaker.acquire().unwrap(); // probe 2
        assert!(breaker.acquire().is_err(), "third probe must be rejected");
    }

    #[test]
    fn test_time_until_probe_counts_down() {
        let breaker = CircuitBreaker::new("x", fast_config()); // recovery 50ms
        assert_eq!(breaker.time_until_probe(), Duration::ZERO);

        for _ in 0..3 {
            breaker.acquire().unwrap();
            breaker.record_failure();
        }
        let remaining = breaker.time_until_probe();
        assert!(remaining > Duration::ZERO);
        assert!(remaining <= Duration::from_millis(50));

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(breaker.time_until_probe(), Duration::ZERO);
    }

    #[test]
    fn test_registry_one_breaker_per_name() {
        let registry = CircuitBreakerRegistry::new(fast_config());
        let a1 = registry.breaker("alpha");
        let a2 = registry.breaker("alpha");
        let b = registry.breaker("beta");
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));

        a1.acquire().unwrap();
        for _ in 0..3 {
            let _ = a1.acquire();
            a1.record_failure();
        }
        let states = registry.states();
        assert_eq!(states["alpha"], BreakerState::Open);
        assert_eq!(states["beta"], BreakerState::Closed);
    }
}
