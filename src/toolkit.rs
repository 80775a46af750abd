/*!
 * Toolkit: the primitives wired together from one configuration
 *
 * A service typically owns one [`Toolkit`]. Calls to a downstream dependency
 * go through [`Toolkit::call_dependency`], which layers the primitives in a
 * fixed order:
 *
 * ```text
 * retry ─▶ circuit breaker (per dependency) ─▶ rate limiter ─▶ operation
 * ```
 *
 * An open breaker rejects the attempt before a rate-limit token is spent.
 * When the retry loop gives up, the caller decides whether the task is
 * escalated to the dead-letter store.
 */

use std::future::Future;
use std::sync::Arc;
use taskguard_core_dead_letter::{DeadLetterEntry, DeadLetterStore, NewDeadLetter};
use taskguard_core_resilience::{
    CircuitBreaker, CircuitBreakerRegistry, Classify, Dispatcher, RateLimiter, ResilienceError,
    ResourceFactory, ResourcePool, RetryError, RetryExecutor,
};
use tracing::{info, warn};

use crate::config::ToolkitConfig;
use crate::error::Result;

/// Shared resilience primitives built from a [`ToolkitConfig`]
///
/// Cheap to clone; clones share limiter, breaker, and store state.
#[derive(Debug, Clone)]
pub struct Toolkit {
    config: Arc<ToolkitConfig>,
    rate_limiter: RateLimiter,
    breakers: CircuitBreakerRegistry,
    retry: RetryExecutor,
    dispatcher: Dispatcher,
    dead_letters: DeadLetterStore,
}

impl Toolkit {
    /// Validate `config`, build every primitive, and open the dead-letter store
    pub async fn from_config(config: ToolkitConfig) -> Result<Self> {
        config.validate()?;

        let retry = RetryExecutor::new(config.retry.to_policy()?);
        let dispatcher = config.dispatch.to_dispatcher()?;
        let breaker_config = config.circuit_breaker.to_breaker_config();
        breaker_config.validate()?;
        let rate_limiter = RateLimiter::new(config.rate_limiter.to_limiter_config());
        let dead_letters = DeadLetterStore::open(config.dead_letter.to_store_config()).await?;

        info!(
            dead_letter_path = %config.dead_letter.path.display(),
            max_concurrent = dispatcher.max_concurrent(),
            "toolkit ready"
        );

        Ok(Self {
            config: Arc::new(config),
            rate_limiter,
            breakers: CircuitBreakerRegistry::new(breaker_config),
            retry,
            dispatcher,
            dead_letters,
        })
    }

    pub fn config(&self) -> &ToolkitConfig {
        &self.config
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Breaker guarding `dependency`, created on first use
    pub fn breaker(&self, dependency: &str) -> CircuitBreaker {
        self.breakers.get_or_create(dependency)
    }

    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn dead_letters(&self) -> &DeadLetterStore {
        &self.dead_letters
    }

    /// Build a resource pool with the configured pool settings
    pub fn resource_pool<T: Send + 'static>(
        &self,
        factory: Arc<dyn ResourceFactory<T>>,
    ) -> Result<ResourcePool<T>> {
        Ok(ResourcePool::new(factory, self.config.pool.to_pool_config())?)
    }

    /// Call `dependency` with retry, its circuit breaker, and the rate limiter
    pub async fn call_dependency<F, Fut, T, E>(
        &self,
        dependency: &str,
        mut op: F,
    ) -> std::result::Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::error::Error + Classify + From<ResilienceError> + 'static,
    {
        let breaker = self.breaker(dependency);
        let limiter = &self.rate_limiter;

        self.retry
            .execute(|| {
                let breaker = breaker.clone();
                let attempt = op();
                async move {
                    breaker
                        .call(|| async move {
                            limiter.acquire().await;
                            attempt.await
                        })
                        .await
                }
            })
            .await
    }

    /// Record a permanently failed task
    pub async fn escalate(&self, new: NewDeadLetter) -> Result<DeadLetterEntry> {
        Ok(self.dead_letters.add_entry(new).await?)
    }

    /// Record the failure a retry loop gave up with
    pub async fn escalate_failure<E>(
        &self,
        task_id: &str,
        feature: &str,
        target_url: &str,
        failure: &RetryError<E>,
    ) -> Result<DeadLetterEntry>
    where
        E: std::error::Error + 'static,
    {
        warn!(task_id, feature, attempts = failure.attempts(), "escalating task to dead-letter store");
        self.escalate(NewDeadLetter::from_failure(
            task_id, feature, target_url, failure,
        ))
        .await
    }

    /// Close the dead-letter store
    pub async fn close(&self) {
        self.dead_letters.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::init_test_logging;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use taskguard_core_resilience::CircuitState;

    fn test_config(dir: &tempfile::TempDir) -> ToolkitConfig {
        let mut config = ToolkitConfig::default();
        config.dead_letter.path = dir.path().join("dlq.db");
        config.retry.min_wait_ms = 1;
        config.retry.max_wait_ms = 5;
        config
    }

    #[tokio::test]
    async fn test_from_config_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.retry.max_attempts = 0;

        assert!(Toolkit::from_config(config).await.is_err());
    }

    #[tokio::test]
    async fn test_call_dependency_retries_transient() {
        init_test_logging();
        let dir = tempfile::tempdir().unwrap();
        let toolkit = Toolkit::from_config(test_config(&dir)).await.unwrap();
        let calls = AtomicU32::new(0);

        let value = toolkit
            .call_dependency("search", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(ResilienceError::Transient("reset".to_string()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(toolkit.breaker("search").state(), CircuitState::Closed);
        assert_eq!(toolkit.rate_limiter().stats().await.hour_count, 2);
    }

    #[tokio::test]
    async fn test_open_breaker_spends_no_rate_limit_token() {
        let dir = tempfile::tempdir().unwrap();
        let toolkit = Toolkit::from_config(test_config(&dir)).await.unwrap();
        let breaker = toolkit.breaker("billing");
        for _ in 0..5 {
            let _ = breaker
                .call(|| async { Err::<(), _>(ResilienceError::Transient("down".to_string())) })
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = toolkit
            .call_dependency("billing", || async { Ok::<_, ResilienceError>(()) })
            .await
            .unwrap_err();

        assert!(!err.is_exhausted());
        assert_eq!(err.attempts(), 1);
        assert_eq!(toolkit.rate_limiter().stats().await.hour_count, 0);
    }

    #[tokio::test]
    async fn test_escalate_failure() {
        let dir = tempfile::tempdir().unwrap();
        let toolkit = Toolkit::from_config(test_config(&dir)).await.unwrap();

        let failure = toolkit
            .call_dependency("crawler", || async {
                Err::<(), _>(ResilienceError::Timeout(Duration::from_secs(5)))
            })
            .await
            .unwrap_err();
        assert!(failure.is_exhausted());

        let entry = toolkit
            .escalate_failure("task-42", "crawl", "https://site.example", &failure)
            .await
            .unwrap();
        assert_eq!(entry.retry_count, 3);
        assert!(entry.failure_reason.contains("timeout"));

        assert_eq!(toolkit.dead_letters().count().await.unwrap(), 1);
        toolkit.close().await;
        assert!(toolkit.dead_letters().is_closed());
    }
}
