//! Circuit breaker implementation for fault tolerance
//!
//! The circuit breaker prevents cascading failures by failing fast when a service
//! is experiencing issues. It has three states:
//! - Closed: Normal operation, requests pass through
//! - Open: Service is unhealthy, requests fail immediately
//! - HalfOpen: Testing if service has recovered
//!
//! ```text
//! ┌─────────┐  failures >= threshold  ┌─────────┐  recovery_timeout  ┌──────────┐
//! │ Closed  │ ──────────────────────► │  Open   │ ─────────────────► │ HalfOpen │
//! └─────────┘                         └─────────┘                    └──────────┘
//!      ▲                                   ▲          trial fails         │
//!      │                                   └──────────────────────────────┤
//!      │                     trial succeeds                               │
//!      └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each breaker is named after the dependency it guards and keeps a
//! timestamped event log (failures and state changes) for monitoring.

use super::error::{Classify, ErrorKind, ResilienceError};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately
    Open,
    /// Circuit is half-open, testing service recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: usize,
    /// Number of consecutive successes in half-open to close circuit
    pub success_threshold: usize,
    /// Duration to wait before transitioning from open to half-open
    pub recovery_timeout: Duration,
    /// How long events stay in the history log
    pub history_retention: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
            history_retention: Duration::from_secs(24 * 3600),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.failure_threshold == 0 {
            return Err(ResilienceError::InvalidConfig(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.success_threshold == 0 {
            return Err(ResilienceError::InvalidConfig(
                "success_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Entry in a breaker's event log
#[derive(Debug, Clone, PartialEq)]
pub enum BreakerEvent {
    /// A counted failure of the guarded dependency
    Failure { at: DateTime<Utc>, kind: ErrorKind },
    /// A transition between states
    StateChange {
        at: DateTime<Utc>,
        from: CircuitState,
        to: CircuitState,
    },
}

impl BreakerEvent {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            BreakerEvent::Failure { at, .. } | BreakerEvent::StateChange { at, .. } => *at,
        }
    }
}

/// Which series [`CircuitBreaker::get_failure_history`] returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryMetric {
    /// Failures per minute
    FailureRate,
    /// State transitions
    StateChanges,
}

/// Failures counted within one minute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRateSample {
    pub minute: DateTime<Utc>,
    pub failures: usize,
}

/// One recorded transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub at: DateTime<Utc>,
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Series returned by [`CircuitBreaker::get_failure_history`], oldest first
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureHistory {
    FailureRate(Vec<FailureRateSample>),
    StateChanges(Vec<StateTransition>),
}

impl FailureHistory {
    pub fn len(&self) -> usize {
        match self {
            FailureHistory::FailureRate(samples) => samples.len(),
            FailureHistory::StateChanges(changes) => changes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Internal state of the circuit breaker
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: usize,
    consecutive_successes: usize,
    opened_at: Option<Instant>,
    last_transition: DateTime<Utc>,
    events: VecDeque<BreakerEvent>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            last_transition: Utc::now(),
            events: VecDeque::new(),
        }
    }

    fn push_event(&mut self, event: BreakerEvent, retention: Duration) {
        self.events.push_back(event);
        self.prune(cutoff(retention));
    }

    fn prune(&mut self, cutoff: DateTime<Utc>) {
        while self.events.front().is_some_and(|e| e.at() < cutoff) {
            self.events.pop_front();
        }
    }

    fn transition(&mut self, name: &str, to: CircuitState, retention: Duration) {
        let from = self.state;
        if from == to {
            return;
        }

        let at = Utc::now();
        self.state = to;
        self.last_transition = at;
        self.consecutive_successes = 0;
        match to {
            CircuitState::Open => {
                self.opened_at = Some(Instant::now());
                warn!(breaker = name, %from, "circuit opened");
            }
            CircuitState::HalfOpen => {
                info!(breaker = name, "circuit half-open, probing dependency");
            }
            CircuitState::Closed => {
                self.opened_at = None;
                self.consecutive_failures = 0;
                info!(breaker = name, %from, "circuit closed");
            }
        }
        self.push_event(BreakerEvent::StateChange { at, from, to }, retention);
    }
}

/// Oldest timestamp still inside a trailing window
fn cutoff(window: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Circuit breaker for protecting against cascading failures
///
/// Clones share state. The internal lock is only held for bookkeeping, never
/// while the guarded operation runs.
///
/// # Example
/// ```no_run
/// use taskguard_core_resilience::{CircuitBreaker, CircuitBreakerConfig, ResilienceError};
///
/// #[tokio::main]
/// async fn main() -> Result<(), ResilienceError> {
///     let breaker = CircuitBreaker::new("billing-api", CircuitBreakerConfig::default());
///
///     let result = breaker.call(|| async {
///         // Your operation here
///         Ok::<_, ResilienceError>(42)
///     }).await?;
///
///     println!("Result: {}", result);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker guarding the dependency `name`
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: Arc::from(name.into()),
            config: Arc::new(config),
            state: Arc::new(Mutex::new(BreakerState::new())),
        }
    }

    /// Create a new circuit breaker with default configuration
    pub fn new_default(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the current state of the circuit breaker
    ///
    /// An open breaker only moves to half-open when the next call arrives.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Get current consecutive failure count
    pub fn failure_count(&self) -> usize {
        self.lock().consecutive_failures
    }

    /// Wall-clock time of the most recent state change
    pub fn last_transition(&self) -> DateTime<Utc> {
        self.lock().last_transition
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        let mut state = self.lock();
        state.transition(&self.name, CircuitState::Closed, self.config.history_retention);
        state.consecutive_failures = 0;
        state.consecutive_successes = 0;
    }

    /// Execute an operation with circuit breaker protection
    ///
    /// Fails fast with `CircuitOpen` while the breaker is open. Errors whose
    /// kind does not trip a breaker are passed through without being counted.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + From<ResilienceError>,
    {
        self.admit()?;

        match op().await {
            Ok(result) => {
                self.on_success();
                Ok(result)
            }
            Err(e) => {
                let kind = e.kind();
                if kind.trips_breaker() {
                    self.on_failure(kind);
                }
                Err(e)
            }
        }
    }

    /// Reject while open; move to half-open once the recovery timeout elapsed
    fn admit(&self) -> Result<(), ResilienceError> {
        let mut state = self.lock();
        if state.state != CircuitState::Open {
            return Ok(());
        }

        let recovered = state
            .opened_at
            .map_or(true, |at| at.elapsed() >= self.config.recovery_timeout);
        if !recovered {
            return Err(ResilienceError::CircuitOpen {
                name: self.name.to_string(),
            });
        }
        state.transition(&self.name, CircuitState::HalfOpen, self.config.history_retention);
        Ok(())
    }

    fn on_success(&self) {
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                state.consecutive_successes += 1;
                if state.consecutive_successes >= self.config.success_threshold {
                    state.transition(&self.name, CircuitState::Closed, self.config.history_retention);
                }
            }
            // Another caller reopened the circuit while this call was in flight
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, kind: ErrorKind) {
        let retention = self.config.history_retention;
        let mut state = self.lock();
        state.push_event(BreakerEvent::Failure { at: Utc::now(), kind }, retention);

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.transition(&self.name, CircuitState::Open, retention);
                }
            }
            CircuitState::HalfOpen => {
                state.consecutive_failures += 1;
                state.transition(&self.name, CircuitState::Open, retention);
            }
            CircuitState::Open => {}
        }
    }

    /// Raw event log, oldest first
    pub fn events(&self) -> Vec<BreakerEvent> {
        let mut state = self.lock();
        state.prune(cutoff(self.config.history_retention));
        state.events.iter().cloned().collect()
    }

    /// Failure-rate or state-change series over the trailing `window`
    pub fn get_failure_history(&self, metric: HistoryMetric, window: Duration) -> FailureHistory {
        let since = cutoff(window);
        let events = self.events();
        let recent = events.into_iter().filter(|e| e.at() >= since);

        match metric {
            HistoryMetric::FailureRate => {
                let mut buckets: BTreeMap<i64, usize> = BTreeMap::new();
                for event in recent {
                    if let BreakerEvent::Failure { at, .. } = event {
                        let minute = at.timestamp() - at.timestamp().rem_euclid(60);
                        *buckets.entry(minute).or_default() += 1;
                    }
                }
                FailureHistory::FailureRate(
                    buckets
                        .into_iter()
                        .filter_map(|(secs, failures)| {
                            DateTime::from_timestamp(secs, 0)
                                .map(|minute| FailureRateSample { minute, failures })
                        })
                        .collect(),
                )
            }
            HistoryMetric::StateChanges => FailureHistory::StateChanges(
                recent
                    .filter_map(|event| match event {
                        BreakerEvent::StateChange { at, from, to } => {
                            Some(StateTransition { at, from, to })
                        }
                        BreakerEvent::Failure { .. } => None,
                    })
                    .collect(),
            ),
        }
    }
}

/// Named breakers, one per downstream dependency
///
/// Breakers are created on first use with the registry's default config.
#[derive(Debug, Clone)]
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: Arc<RwLock<HashMap<String, CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Find a breaker by name
    pub fn get(&self, name: &str) -> Option<CircuitBreaker> {
        let breakers = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        breakers.get(name).cloned()
    }

    /// Get the breaker for `name`, creating it if needed
    pub fn get_or_create(&self, name: &str) -> CircuitBreaker {
        if let Some(breaker) = self.get(name) {
            return breaker;
        }
        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(name.to_string())
            .or_insert_with(|| CircuitBreaker::new(name, self.default_config.clone()))
            .clone()
    }

    /// Snapshot of all breaker states, sorted by name
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let breakers = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        let mut states: Vec<_> = breakers
            .iter()
            .map(|(name, b)| (name.clone(), b.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    pub fn len(&self) -> usize {
        self.breakers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(threshold: usize) -> CircuitBreaker {
        CircuitBreaker::new(
            "downstream",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_secs(30),
                ..Default::default()
            },
        )
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), ResilienceError> {
        breaker
            .call(|| async { Err(ResilienceError::Transient("test error".to_string())) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), ResilienceError> {
        breaker.call(|| async { Ok(()) }).await
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }

    #[test]
    fn test_config_validation() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
        let config = CircuitBreakerConfig {
            failure_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_circuit_breaker_closed_to_open() {
        let breaker = breaker(3);

        for _ in 0..3 {
            assert!(fail(&breaker).await.is_err());
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // Open circuit fails fast without invoking the operation
        let calls = AtomicUsize::new(0);
        let result: Result<(), ResilienceError> = breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert_eq!(
            result,
            Err(ResilienceError::CircuitOpen {
                name: "downstream".to_string()
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = breaker(3);
        fail(&breaker).await.ok();
        fail(&breaker).await.ok();
        assert_eq!(breaker.failure_count(), 2);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.failure_count(), 0);

        fail(&breaker).await.ok();
        fail(&breaker).await.ok();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let breaker = breaker(3);
        for _ in 0..3 {
            fail(&breaker).await.ok();
        }

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(matches!(
            succeed(&breaker).await,
            Err(ResilienceError::CircuitOpen { .. })
        ));

        tokio::time::advance(Duration::from_secs(21)).await;
        let probe = breaker.clone();
        let seen = breaker
            .call(|| async move { Ok::<_, ResilienceError>(probe.state()) })
            .await
            .unwrap();
        assert_eq!(seen, CircuitState::HalfOpen);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker(3);
        for _ in 0..3 {
            fail(&breaker).await.ok();
        }

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(matches!(
            fail(&breaker).await,
            Err(ResilienceError::Transient(_))
        ));
        assert_eq!(breaker.state(), CircuitState::Open);

        // Recovery timeout restarts from the reopen
        assert!(matches!(
            succeed(&breaker).await,
            Err(ResilienceError::CircuitOpen { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_threshold() {
        let breaker = CircuitBreaker::new(
            "downstream",
            CircuitBreakerConfig {
                failure_threshold: 1,
                success_threshold: 2,
                recovery_timeout: Duration::from_secs(5),
                ..Default::default()
            },
        );
        fail(&breaker).await.ok();
        tokio::time::advance(Duration::from_secs(6)).await;

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_caller_side_errors_do_not_count() {
        let breaker = breaker(2);
        for _ in 0..5 {
            let _: Result<(), ResilienceError> = breaker
                .call(|| async { Err(ResilienceError::PoolTimeout(Duration::from_secs(1))) })
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_history() {
        let breaker = breaker(3);
        for _ in 0..3 {
            fail(&breaker).await.ok();
        }

        let hour = Duration::from_secs(3600);
        match breaker.get_failure_history(HistoryMetric::FailureRate, hour) {
            FailureHistory::FailureRate(samples) => {
                let total: usize = samples.iter().map(|s| s.failures).sum();
                assert_eq!(total, 3);
            }
            other => panic!("Expected failure rate series, got {:?}", other),
        }

        match breaker.get_failure_history(HistoryMetric::StateChanges, hour) {
            FailureHistory::StateChanges(changes) => {
                assert_eq!(changes.len(), 1);
                assert_eq!(changes[0].from, CircuitState::Closed);
                assert_eq!(changes[0].to, CircuitState::Open);
            }
            other => panic!("Expected state change series, got {:?}", other),
        }
    }

    #[test]
    fn test_events_outside_retention_are_pruned() {
        let breaker = breaker(3);
        {
            let mut state = breaker.lock();
            let stale = Utc::now() - chrono::Duration::hours(48);
            state.events.push_back(BreakerEvent::Failure {
                at: stale,
                kind: ErrorKind::Transient,
            });
            state.events.push_back(BreakerEvent::Failure {
                at: Utc::now(),
                kind: ErrorKind::Timeout,
            });
        }

        let events = breaker.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            BreakerEvent::Failure {
                kind: ErrorKind::Timeout,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_reset_records_state_change() {
        let breaker = breaker(1);
        fail(&breaker).await.ok();
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);

        let history =
            breaker.get_failure_history(HistoryMetric::StateChanges, Duration::from_secs(60));
        assert_eq!(history.len(), 2);

        // Resetting a closed breaker is not a transition
        breaker.reset();
        let history =
            breaker.get_failure_history(HistoryMetric::StateChanges, Duration::from_secs(60));
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_registry_scopes_breakers_by_name() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });

        let billing = registry.get_or_create("billing");
        fail(&billing).await.ok();

        assert_eq!(registry.get_or_create("billing").state(), CircuitState::Open);
        assert_eq!(registry.get_or_create("search").state(), CircuitState::Closed);
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.states(),
            vec![
                ("billing".to_string(), CircuitState::Open),
                ("search".to_string(), CircuitState::Closed),
            ]
        );
    }
}
