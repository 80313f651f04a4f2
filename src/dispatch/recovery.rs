//! Dispatch Recovery
//!
//! Keeps transport failures away from the planning core:
//! - Exponential backoff with jitter on `Unavailable`
//! - Circuit breaker that fails fast while the transport is down
//! - Counters for the run report

use super::{DispatchError, Dispatcher};
use crate::intent::{Intent, IntentId, IntentOutcome};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Backoff for transport-level resubmission of one intent
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Resubmissions after the first try
    pub resubmits: usize,
    pub base_delay: Duration,
    pub ceiling: Duration,
    pub factor: f64,
    /// Relative spread around the computed delay, e.g. 0.2 for ±20%
    pub jitter: Option<f64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            resubmits: 3,
            base_delay: Duration::from_millis(100),
            ceiling: Duration::from_secs(10),
            factor: 2.0,
            jitter: Some(0.2),
        }
    }
}

impl RetryPolicy {
    /// Fail on the first transport error
    pub fn none() -> Self {
        Self {
            resubmits: 0,
            ..Default::default()
        }
    }

    /// Delay before resubmission number `n` (zero-based)
    pub fn backoff(&self, n: usize) -> Duration {
        let exp = i32::try_from(n).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_secs_f64() * self.factor.powi(exp);
        let capped = raw.min(self.ceiling.as_secs_f64());
        match self.jitter {
            Some(spread) => Duration::from_secs_f64((capped * (1.0 + spread * (unit_noise() * 2.0 - 1.0))).max(0.0)),
            None => Duration::from_secs_f64(capped),
        }
    }
}

/// Uniform noise in [0, 1) from the std hasher's random keys
fn unit_noise() -> f64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    let mut h = RandomState::new().build_hasher();
    h.write_u32(nanos);
    (h.finish() >> 11) as f64 / (1u64 << 53) as f64
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    /// Letting a trial call through
    HalfOpen,
    Open,
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: usize,
    /// Successes needed to close from half-open
    pub success_threshold: usize,
    /// Time to wait before half-opening
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    /// Consecutive transport failures while closed
    failures: usize,
    /// Successful trial calls while half-open
    trials: usize,
    opened_at: Option<Instant>,
}

/// Circuit breaker around one dispatcher
pub struct CircuitBreaker {
    name: String,
    inner: Mutex<Breaker>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(name: &str) -> Self {
        Self::with_config(name, CircuitBreakerConfig::default())
    }

    pub fn with_config(name: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            inner: Mutex::new(Breaker {
                state: CircuitState::Closed,
                failures: 0,
                trials: 0,
                opened_at: None,
            }),
            config,
        }
    }

    /// Current state; an open breaker half-opens once `open_duration` has passed
    pub async fn state(&self) -> CircuitState {
        let mut b = self.inner.lock().await;
        let cooled = b.opened_at.is_some_and(|at| at.elapsed() >= self.config.open_duration);
        if b.state == CircuitState::Open && cooled {
            b.state = CircuitState::HalfOpen;
            b.trials = 0;
            info!("Dispatch breaker '{}' half-open, probing", self.name);
        }
        b.state
    }

    pub async fn allow(&self) -> bool {
        self.state().await != CircuitState::Open
    }

    pub async fn record_success(&self) {
        let mut b = self.inner.lock().await;
        match b.state {
            CircuitState::Closed => b.failures = 0,
            CircuitState::HalfOpen => {
                b.trials += 1;
                if b.trials >= self.config.success_threshold {
                    b.state = CircuitState::Closed;
                    b.failures = 0;
                    info!("Dispatch breaker '{}' closed", self.name);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        let mut b = self.inner.lock().await;
        let trip = match b.state {
            CircuitState::Closed => {
                b.failures += 1;
                b.failures >= self.config.failure_threshold
            }
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if trip {
            warn!("Dispatch breaker '{}' open after {} transport failures", self.name, b.failures);
            b.state = CircuitState::Open;
            b.trials = 0;
        }
        if b.state == CircuitState::Open {
            b.opened_at = Some(Instant::now());
        }
    }
}

#[derive(Default)]
struct RecoveryMetrics {
    submitted: AtomicU64,
    successful: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    short_circuited: AtomicU64,
}

/// Dispatcher wrapper that retries transport failures
pub struct RetryingDispatcher<D> {
    inner: D,
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    metrics: RecoveryMetrics,
}

impl<D: Dispatcher> RetryingDispatcher<D> {
    pub fn new(inner: D) -> Self {
        Self::with_policy(inner, RetryPolicy::default(), Arc::new(CircuitBreaker::new("dispatch")))
    }

    pub fn with_policy(inner: D, policy: RetryPolicy, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            inner,
            policy,
            breaker,
            metrics: RecoveryMetrics::default(),
        }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn stats(&self) -> RecoveryStats {
        RecoveryStats {
            submitted: self.metrics.submitted.load(Ordering::Relaxed),
            successful: self.metrics.successful.load(Ordering::Relaxed),
            retried: self.metrics.retried.load(Ordering::Relaxed),
            failed: self.metrics.failed.load(Ordering::Relaxed),
            short_circuited: self.metrics.short_circuited.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl<D: Dispatcher> Dispatcher for RetryingDispatcher<D> {
    async fn submit(&self, intent: Intent) -> Result<IntentOutcome, DispatchError> {
        self.metrics.submitted.fetch_add(1, Ordering::Relaxed);

        if !self.breaker.allow().await {
            self.metrics.short_circuited.fetch_add(1, Ordering::Relaxed);
            return Err(DispatchError::CircuitOpen);
        }

        let mut attempt = 0;
        loop {
            match self.inner.submit(intent.clone()).await {
                Ok(outcome) => {
                    self.breaker.record_success().await;
                    self.metrics.successful.fetch_add(1, Ordering::Relaxed);
                    return Ok(outcome);
                }
                Err(e) if e.is_retryable() && attempt < self.policy.resubmits => {
                    self.breaker.record_failure().await;
                    let delay = self.policy.backoff(attempt);
                    debug!("Retry {} for {} after {:?} (error: {})", attempt + 1, intent.id, delay, e);
                    self.metrics.retried.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        self.breaker.record_failure().await;
                    }
                    self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                    warn!("Dispatch of {} failed after {} retries: {}", intent.id, attempt, e);
                    return Err(e);
                }
            }
        }
    }

    async fn cancel(&self, id: &IntentId) -> Result<(), DispatchError> {
        self.inner.cancel(id).await
    }

    fn forget_plan(&self, plan: Uuid) {
        self.inner.forget_plan(plan)
    }
}

/// Counters for the dispatch boundary
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryStats {
    pub submitted: u64,
    pub successful: u64,
    pub retried: u64,
    pub failed: u64,
    pub short_circuited: u64,
}

impl RecoveryStats {
    pub fn success_rate(&self) -> f64 {
        if self.submitted == 0 {
            1.0
        } else {
            self.successful as f64 / self.submitted as f64
        }
    }

    /// Format for display
    pub fn format(&self) -> String {
        format!(
            "dispatch: {:.1}% success ({}/{} intents, {} retries, {} failed, {} short-circuited)",
            self.success_rate() * 100.0,
            self.successful,
            self.submitted,
            self.retried,
            self.failed,
            self.short_circuited
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::NodeId;
    use crate::time::Seconds;
    use chrono::Utc;

    /// Fails with `Unavailable` a fixed number of times, then completes
    struct Flaky {
        failures: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Dispatcher for Flaky {
        async fn submit(&self, _intent: Intent) -> Result<IntentOutcome, DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(DispatchError::Unavailable("connection reset".to_string()));
            }
            Ok(IntentOutcome::Completed)
        }

        async fn cancel(&self, _id: &IntentId) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    fn intent() -> Intent {
        Intent {
            id: IntentId::new(Uuid::nil(), NodeId(1), 1),
            action: "wave".to_string(),
            args: vec![],
            agent: None,
            preconditions: vec![],
            effects: vec![],
            duration: Seconds::ZERO,
            not_before: Seconds::ZERO,
            issued_at: Utc::now(),
        }
    }

    fn fast_policy(resubmits: usize) -> RetryPolicy {
        RetryPolicy {
            resubmits,
            base_delay: Duration::from_millis(1),
            jitter: None,
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(250),
            ceiling: Duration::from_secs(1),
            jitter: None,
            ..Default::default()
        };
        let delays: Vec<u128> = (0..4).map(|n| policy.backoff(n).as_millis()).collect();
        assert_eq!(delays, vec![250, 500, 1000, 1000]);
    }

    #[test]
    fn test_backoff_jitter_stays_in_band() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            jitter: Some(0.5),
            ..Default::default()
        };
        for _ in 0..32 {
            let d = policy.backoff(0).as_millis();
            assert!((50..=150).contains(&d), "{}", d);
        }
    }

    #[tokio::test]
    async fn test_retries_transport_failures() {
        let flaky = Flaky {
            failures: AtomicUsize::new(2),
            calls: AtomicUsize::new(0),
        };
        let dispatcher = RetryingDispatcher::with_policy(flaky, fast_policy(3), Arc::new(CircuitBreaker::new("t")));

        assert_eq!(dispatcher.submit(intent()).await, Ok(IntentOutcome::Completed));
        assert_eq!(dispatcher.inner().calls.load(Ordering::SeqCst), 3);
        assert_eq!(dispatcher.stats().retried, 2);
    }

    #[tokio::test]
    async fn test_gives_up_and_opens_circuit() {
        let flaky = Flaky {
            failures: AtomicUsize::new(10),
            calls: AtomicUsize::new(0),
        };
        let breaker = Arc::new(CircuitBreaker::with_config(
            "t",
            CircuitBreakerConfig {
                failure_threshold: 2,
                ..Default::default()
            },
        ));
        let dispatcher = RetryingDispatcher::with_policy(flaky, fast_policy(1), breaker);

        assert!(matches!(dispatcher.submit(intent()).await, Err(DispatchError::Unavailable(_))));
        assert_eq!(dispatcher.breaker().state().await, CircuitState::Open);
        assert_eq!(dispatcher.submit(intent()).await, Err(DispatchError::CircuitOpen));

        let stats = dispatcher.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.short_circuited, 1);
    }

    #[test]
    fn test_recovery_stats_format() {
        let stats = RecoveryStats {
            submitted: 20,
            successful: 19,
            retried: 3,
            failed: 1,
            short_circuited: 0,
        };
        let formatted = stats.format();
        assert!(formatted.contains("95.0%"));
        assert!(formatted.contains("19/20"));
    }
}
