//! Generic bounded pool for reusable, costly-to-create resources
//!
//! Provides resource reuse with a hard upper bound, FIFO waiting when the
//! bound is reached, idle expiry and health checking.
//!
//! Slots are tracked by a fair semaphore sized to `max_size`. Each checked-out
//! resource carries its permit inside a [`PooledResource`] guard, so a slot
//! is returned on every exit path: explicit release, drop on error, or
//! cancellation of the task holding it or of the release itself.

use super::error::ResilienceError;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Configuration for resource pool behavior
///
/// Immutable once the pool is constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Resources created by [`ResourcePool::initialize`]
    pub min_size: usize,
    /// Upper bound on live resources (idle + checked out)
    pub max_size: usize,
    /// How long [`ResourcePool::acquire`] waits for a free slot
    pub acquire_timeout: Duration,
    /// Idle resources unused for longer than this are closed instead of reused
    pub max_inactive_time: Duration,
    /// Minimum spacing between health checks of an idle resource
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            max_inactive_time: Duration::from_secs(300), // 5 minutes
            health_check_interval: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    /// Check the size bounds
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.min_size < 1 {
            return Err(ResilienceError::InvalidConfig(
                "pool min_size must be at least 1".to_string(),
            ));
        }
        if self.max_size < self.min_size {
            return Err(ResilienceError::InvalidConfig(format!(
                "pool max_size ({}) must be >= min_size ({})",
                self.max_size, self.min_size
            )));
        }
        Ok(())
    }
}

/// Factory trait for creating, validating and closing resources
#[async_trait::async_trait]
pub trait ResourceFactory<T: Send + 'static>: Send + Sync {
    /// Create a new resource
    async fn create(&self) -> Result<T, ResilienceError>;

    /// Check if a resource is still usable. Defaults to always healthy.
    async fn is_healthy(&self, _resource: &T) -> bool {
        true
    }

    /// Close a resource (optional cleanup)
    async fn close(&self, resource: T) {
        drop(resource);
    }
}

/// An idle resource plus the metadata needed to judge it
struct IdleResource<T> {
    resource: T,
    created_at: Instant,
    last_used: Instant,
    last_checked: Instant,
}

/// Internal pool state, only ever touched for bookkeeping
struct PoolState<T> {
    /// Resources waiting to be reused (most recently returned last)
    idle: Vec<IdleResource<T>>,
    /// Resources checked out or being created for a caller
    outstanding: usize,
    /// Resources ever created
    created: u64,
    /// Resources closed because they expired, failed a check, or the pool shut down
    discarded: u64,
    closed: bool,
}

impl<T> PoolState<T> {
    fn new() -> Self {
        Self {
            idle: Vec::new(),
            outstanding: 0,
            created: 0,
            discarded: 0,
            closed: false,
        }
    }

    fn total_count(&self) -> usize {
        self.idle.len() + self.outstanding
    }
}

struct PoolInner<T> {
    config: PoolConfig,
    factory: Arc<dyn ResourceFactory<T>>,
    state: Mutex<PoolState<T>>,
    permits: Arc<Semaphore>,
}

impl<T: Send + 'static> PoolInner<T> {
    fn lock_state(&self) -> MutexGuard<'_, PoolState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One checked-out slot: a semaphore permit plus one unit of `outstanding`
///
/// Dropping an armed slot gives both back, which covers guards dropped
/// without [`PooledResource::release`] and releases cancelled mid-check.
struct Slot<T: Send + 'static> {
    inner: Arc<PoolInner<T>>,
    /// Dropped after `Drop::drop` runs, so a woken waiter sees settled counters
    _permit: OwnedSemaphorePermit,
    armed: bool,
}

impl<T: Send + 'static> Slot<T> {
    /// Take a resource back from a caller
    ///
    /// The permit is held until the resource is either idle again or closed,
    /// so a woken waiter always finds it.
    async fn reclaim(mut self, resource: T, created_at: Instant) {
        let closed = self.inner.lock_state().closed;
        let healthy = !closed && self.inner.factory.is_healthy(&resource).await;
        let now = Instant::now();

        let rejected = {
            let mut state = self.inner.lock_state();
            state.outstanding = state.outstanding.saturating_sub(1);
            self.armed = false;
            if healthy && !state.closed {
                state.idle.push(IdleResource {
                    resource,
                    created_at,
                    last_used: now,
                    last_checked: now,
                });
                None
            } else {
                state.discarded += 1;
                Some(resource)
            }
        };

        let inner = Arc::clone(&self.inner);
        drop(self);

        if let Some(resource) = rejected {
            debug!(healthy, "closing resource on release");
            inner.factory.close(resource).await;
        }
    }
}

impl<T: Send + 'static> Drop for Slot<T> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.inner.lock_state();
            state.outstanding = state.outstanding.saturating_sub(1);
            state.discarded += 1;
        }
    }
}

/// Undoes an `outstanding` reservation unless committed
struct Reservation<T: Send + 'static> {
    inner: Arc<PoolInner<T>>,
    armed: bool,
}

impl<T: Send + 'static> Reservation<T> {
    /// Hand the reserved unit over to a slot guard
    fn commit(mut self, permit: OwnedSemaphorePermit) -> Slot<T> {
        self.armed = false;
        Slot {
            inner: Arc::clone(&self.inner),
            _permit: permit,
            armed: true,
        }
    }
}

impl<T: Send + 'static> Drop for Reservation<T> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.inner.lock_state();
            state.outstanding = state.outstanding.saturating_sub(1);
        }
    }
}

enum Candidate<T> {
    Idle(IdleResource<T>),
    Create,
}

/// A bounded pool of reusable resources
///
/// # Example
/// ```no_run
/// use taskguard_core_resilience::{PoolConfig, ResilienceError, ResourceFactory, ResourcePool};
/// use std::sync::Arc;
///
/// struct Session { id: usize }
/// struct SessionFactory;
///
/// #[async_trait::async_trait]
/// impl ResourceFactory<Session> for SessionFactory {
///     async fn create(&self) -> Result<Session, ResilienceError> {
///         Ok(Session { id: 1 })
///     }
/// }
///
/// # async fn example() -> Result<(), ResilienceError> {
/// let pool = ResourcePool::new(Arc::new(SessionFactory), PoolConfig::default())?;
/// pool.initialize().await?;
///
/// let session = pool.acquire().await?;
/// println!("using session {}", session.id);
/// session.release().await;
///
/// pool.close().await;
/// # Ok(())
/// # }
/// ```
pub struct ResourcePool<T: Send + 'static> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Send + 'static> Clone for ResourcePool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> fmt::Debug for ResourcePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> ResourcePool<T> {
    /// Create an empty pool. Nothing is created until [`initialize`](Self::initialize)
    /// or the first acquire.
    pub fn new(
        factory: Arc<dyn ResourceFactory<T>>,
        config: PoolConfig,
    ) -> Result<Self, ResilienceError> {
        config.validate()?;
        Ok(Self::build(factory, config))
    }

    /// Create a pool with default configuration
    pub fn new_default(factory: Arc<dyn ResourceFactory<T>>) -> Self {
        Self::build(factory, PoolConfig::default())
    }

    fn build(factory: Arc<dyn ResourceFactory<T>>, config: PoolConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_size));
        Self {
            inner: Arc::new(PoolInner {
                config,
                factory,
                state: Mutex::new(PoolState::new()),
                permits,
            }),
        }
    }

    /// The pool's configuration
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Pre-create resources until `min_size` are live
    pub async fn initialize(&self) -> Result<(), ResilienceError> {
        let to_create = {
            let state = self.inner.lock_state();
            if state.closed {
                return Err(ResilienceError::PoolClosed);
            }
            self.inner.config.min_size.saturating_sub(state.total_count())
        };

        for _ in 0..to_create {
            let resource = self.inner.factory.create().await?;
            let now = Instant::now();

            let overflow = {
                let mut state = self.inner.lock_state();
                state.created += 1;
                if state.closed || state.total_count() >= self.inner.config.max_size {
                    state.discarded += 1;
                    Some(resource)
                } else {
                    state.idle.push(IdleResource {
                        resource,
                        created_at: now,
                        last_used: now,
                        last_checked: now,
                    });
                    None
                }
            };

            if let Some(resource) = overflow {
                self.inner.factory.close(resource).await;
                break;
            }
        }

        debug!(
            min_size = self.inner.config.min_size,
            created = to_create,
            "resource pool initialized"
        );
        Ok(())
    }

    /// Acquire a resource, waiting up to the configured `acquire_timeout`
    pub async fn acquire(&self) -> Result<PooledResource<T>, ResilienceError> {
        self.acquire_with_timeout(self.inner.config.acquire_timeout)
            .await
    }

    /// Acquire a resource, waiting up to `timeout`
    ///
    /// Returns an idle resource when one is usable, creates a new one when
    /// the pool has room, and otherwise queues behind earlier waiters. The
    /// deadline covers creating and health-checking the resource too.
    pub async fn acquire_with_timeout(
        &self,
        timeout: Duration,
    ) -> Result<PooledResource<T>, ResilienceError> {
        if self.inner.lock_state().closed {
            return Err(ResilienceError::PoolClosed);
        }

        match tokio::time::timeout(timeout, self.checkout()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(?timeout, max_size = self.inner.config.max_size, "resource pool acquire timed out");
                Err(ResilienceError::PoolTimeout(timeout))
            }
        }
    }

    async fn checkout(&self) -> Result<PooledResource<T>, ResilienceError> {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| ResilienceError::PoolClosed)?;

        loop {
            let candidate = {
                let mut state = self.inner.lock_state();
                if state.closed {
                    return Err(ResilienceError::PoolClosed);
                }
                state.outstanding += 1;
                match state.idle.pop() {
                    Some(idle) => Candidate::Idle(idle),
                    None => Candidate::Create,
                }
            };
            let reservation = Reservation {
                inner: Arc::clone(&self.inner),
                armed: true,
            };

            match candidate {
                Candidate::Idle(idle) => {
                    if idle.last_used.elapsed() > self.inner.config.max_inactive_time {
                        debug!("closing resource idle past max_inactive_time");
                        self.discard(idle.resource).await;
                        drop(reservation);
                        continue;
                    }

                    let mut last_checked = idle.last_checked;
                    if last_checked.elapsed() >= self.inner.config.health_check_interval {
                        if !self.inner.factory.is_healthy(&idle.resource).await {
                            debug!("closing idle resource that failed its health check");
                            self.discard(idle.resource).await;
                            drop(reservation);
                            continue;
                        }
                        last_checked = Instant::now();
                    }

                    return Ok(PooledResource {
                        resource: idle.resource,
                        slot: reservation.commit(permit),
                        created_at: idle.created_at,
                        last_checked,
                    });
                }
                Candidate::Create => {
                    let resource = self.inner.factory.create().await?;
                    let now = Instant::now();
                    self.inner.lock_state().created += 1;
                    debug!("created new pooled resource");

                    return Ok(PooledResource {
                        resource,
                        slot: reservation.commit(permit),
                        created_at: now,
                        last_checked: now,
                    });
                }
            }
        }
    }

    /// Return a resource to the pool
    ///
    /// Equivalent to [`PooledResource::release`].
    pub async fn release(&self, resource: PooledResource<T>) {
        resource.release().await;
    }

    /// Close idle resources that exceeded `max_inactive_time`
    ///
    /// Returns how many were closed.
    pub async fn prune_idle(&self) -> usize {
        let max_inactive = self.inner.config.max_inactive_time;
        let expired: Vec<T> = {
            let mut state = self.inner.lock_state();
            let (expired, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut state.idle)
                .into_iter()
                .partition(|idle| idle.last_used.elapsed() > max_inactive);
            state.idle = keep;
            state.discarded += expired.len() as u64;
            expired.into_iter().map(|idle| idle.resource).collect()
        };

        let count = expired.len();
        for resource in expired {
            self.inner.factory.close(resource).await;
        }
        count
    }

    /// Shut the pool down
    ///
    /// Idle resources are closed, blocked acquirers fail with
    /// [`ResilienceError::PoolClosed`], and so does every later acquire.
    /// Resources still checked out are closed when they come back.
    pub async fn close(&self) {
        let idle = {
            let mut state = self.inner.lock_state();
            state.closed = true;
            let idle = std::mem::take(&mut state.idle);
            state.discarded += idle.len() as u64;
            idle
        };
        self.inner.permits.close();

        let count = idle.len();
        for entry in idle {
            self.inner.factory.close(entry.resource).await;
        }
        debug!(closed = count, "resource pool closed");
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    /// Get current pool statistics
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock_state();
        PoolStats {
            idle: state.idle.len(),
            outstanding: state.outstanding,
            total: state.total_count(),
            max_size: self.inner.config.max_size,
            created: state.created,
            discarded: state.discarded,
        }
    }

    async fn discard(&self, resource: T) {
        self.inner.lock_state().discarded += 1;
        self.inner.factory.close(resource).await;
    }
}

/// A resource checked out of a [`ResourcePool`]
///
/// Derefs to the resource. Call [`release`](Self::release) to hand it back.
/// A guard dropped without releasing frees its slot at once and drops the
/// resource instead of returning it to the idle set.
pub struct PooledResource<T: Send + 'static> {
    resource: T,
    slot: Slot<T>,
    created_at: Instant,
    last_checked: Instant,
}

impl<T: Send + 'static> PooledResource<T> {
    /// Hand the resource back, health-checking it first
    pub async fn release(self) {
        let PooledResource {
            resource,
            slot,
            created_at,
            ..
        } = self;
        slot.reclaim(resource, created_at).await;
    }

    /// When this resource was created
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When this resource last passed a health check
    pub fn last_checked(&self) -> Instant {
        self.last_checked
    }
}

impl<T: Send + 'static> Deref for PooledResource<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.resource
    }
}

impl<T: Send + 'static> DerefMut for PooledResource<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.resource
    }
}

impl<T: Send + 'static> fmt::Debug for PooledResource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledResource")
            .field("created_at", &self.created_at)
            .field("last_checked", &self.last_checked)
            .finish_non_exhaustive()
    }
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of idle resources
    pub idle: usize,
    /// Number of checked-out resources
    pub outstanding: usize,
    /// Total live resources (idle + outstanding)
    pub total: usize,
    /// Maximum pool size
    pub max_size: usize,
    /// Resources created over the pool's lifetime
    pub created: u64,
    /// Resources closed over the pool's lifetime
    pub discarded: u64,
}

impl PoolStats {
    /// Get pool utilization as a percentage
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            (self.total as f64 / self.max_size as f64) * 100.0
        }
    }
}
