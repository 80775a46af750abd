//! Taskguard Core Resilience: Pure-logic fault tolerance primitives
//!
//! # Overview
//!
//! This crate provides building blocks for task-processing systems that call
//! flaky downstream dependencies. It includes:
//!
//! - **Resource Pool**: Bounded reuse of expensive resources with health checks and idle expiry
//! - **Retry Executor**: Exponential backoff driven by error-kind retry and stop sets
//! - **Rate Limiter**: Burst tokens plus per-minute and per-hour sliding windows
//! - **Dispatcher**: Bounded concurrency fan-out with ordered results and deadlines
//! - **Circuit Breaker**: Fails fast while a dependency is unhealthy, with an event history
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Storage systems (the dead-letter store lives in its own crate)
//! - Network protocols
//! - Application-specific concerns
//!
//! Every blocking operation suspends only the calling task and is cancel-safe:
//! dropping its future releases any slot, permit or token it was holding.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Orchestrator / Worker           │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Dispatcher                        │  ← Bounded fan-out
//! │  (Concurrency gate, per-op deadline)    │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Retry Executor                    │  ← Backoff on transient errors
//! │  (Retry-set / stop-set by ErrorKind)    │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker                   │  ← Fail-fast protection
//! │  (Tracks failures, opens on threshold)  │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Rate Limiter                      │  ← Prevent overload
//! │  (Burst tokens, minute/hour windows)    │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Resource Pool                     │  ← Resource efficiency
//! │  (Reuse connections, health checks)     │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!      Downstream dependency
//!               │
//!        All recovery exhausted?
//!               ▼
//!    Dead-letter store (separate crate)
//! ```
//!
//! # Usage Example
//!
//! ## Retry inside a Circuit Breaker
//!
//! ```no_run
//! use taskguard_core_resilience::prelude::*;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), RetryError<ResilienceError>> {
//! let breaker = CircuitBreaker::new("search-api", CircuitBreakerConfig::default());
//! let retry = RetryExecutor::new(
//!     RetryPolicy::new()
//!         .with_max_attempts(3)
//!         .with_min_wait(Duration::from_millis(200)),
//! );
//!
//! let hits = retry
//!     .execute(|| breaker.call(|| async {
//!         // Your potentially failing operation
//!         Ok::<_, ResilienceError>(42)
//!     }))
//!     .await?;
//! # let _ = hits;
//! # Ok(())
//! # }
//! ```
//!
//! ## Resource Pool
//!
//! ```no_run
//! use taskguard_core_resilience::{PoolConfig, ResourceFactory, ResourcePool, ResilienceError};
//! use std::sync::Arc;
//!
//! # struct MyConnection;
//! struct MyConnectionFactory;
//!
//! #[async_trait::async_trait]
//! impl ResourceFactory<MyConnection> for MyConnectionFactory {
//!     async fn create(&self) -> Result<MyConnection, ResilienceError> {
//!         // Create your connection
//! #       Ok(MyConnection)
//!     }
//!
//!     async fn is_healthy(&self, _conn: &MyConnection) -> bool {
//!         // Check connection health
//!         true
//!     }
//! }
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let pool = ResourcePool::new(Arc::new(MyConnectionFactory), PoolConfig::default())?;
//! pool.initialize().await?;
//!
//! // Returned to the pool when the guard goes out of scope
//! let conn = pool.acquire().await?;
//! // Use connection...
//! drop(conn);
//!
//! pool.close().await;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod dispatch;
pub mod error;
pub mod rate_limiter;
pub mod resource_pool;
pub mod retry;

// Re-export main types for convenience
pub use circuit_breaker::{
    BreakerEvent, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
    FailureHistory, FailureRateSample, HistoryMetric, StateTransition,
};
pub use dispatch::{gather_settled, gather_with_concurrency, run_until, run_with_timeout, Dispatcher};
pub use error::{Classify, ErrorKind, ResilienceError};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterStats};
pub use resource_pool::{PoolConfig, PoolStats, PooledResource, ResourceFactory, ResourcePool};
pub use retry::{RetryDecision, RetryError, RetryExecutor, RetryPolicy};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use taskguard_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry};
    pub use super::dispatch::{gather_with_concurrency, run_with_timeout, Dispatcher};
    pub use super::error::{Classify, ErrorKind, ResilienceError};
    pub use super::rate_limiter::{RateLimiter, RateLimiterConfig};
    pub use super::resource_pool::{PoolConfig, ResourceFactory, ResourcePool};
    pub use super::retry::{RetryError, RetryExecutor, RetryPolicy};
}
