//! Bounded concurrency dispatch and deadline enforcement
//!
//! `gather_with_concurrency` fans a batch of operations out behind a counting
//! gate and fans the results back in input order. Operations run inside the
//! caller's task (no spawning), so dropping the returned future cancels every
//! operation still in flight and releases its slot.

use super::error::ResilienceError;
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::debug;

/// Race `fut` against a deadline `timeout` from now
///
/// On expiry the operation is dropped and `ResilienceError::Timeout` is
/// returned. An operation error that arrives first is passed through as-is.
/// A zero timeout fails without polling the operation.
pub async fn run_with_timeout<F, T, E>(timeout: Duration, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<ResilienceError>,
{
    if timeout.is_zero() {
        return Err(ResilienceError::Timeout(timeout).into());
    }
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            debug!(?timeout, "operation deadline exceeded");
            Err(ResilienceError::Timeout(timeout).into())
        }
    }
}

/// Race `fut` against an absolute deadline
///
/// A deadline that has already passed fails without polling the operation.
pub async fn run_until<F, T, E>(deadline: Instant, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<ResilienceError>,
{
    let budget = deadline.saturating_duration_since(Instant::now());
    run_with_timeout(budget, fut).await
}

/// Run `ops` with at most `max_concurrent` in flight, failing on the first error
///
/// Results come back in input order. On the first error the remaining
/// operations are dropped. A `max_concurrent` of zero is treated as one.
pub async fn gather_with_concurrency<I, F, T, E>(ops: I, max_concurrent: usize) -> Result<Vec<T>, E>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T, E>>,
{
    let gate = Semaphore::new(max_concurrent.max(1));
    let mut pending: FuturesUnordered<_> = ops
        .into_iter()
        .enumerate()
        .map(|(idx, op)| gated(&gate, idx, op))
        .collect();

    let mut slots: Vec<Option<T>> = std::iter::repeat_with(|| None).take(pending.len()).collect();
    while let Some((idx, result)) = pending.next().await {
        slots[idx] = Some(result?);
    }

    Ok(slots.into_iter().flatten().collect())
}

/// Run `ops` with at most `max_concurrent` in flight, capturing every outcome
///
/// Each slot of the output holds the result of the operation at the same
/// input index. A `max_concurrent` of zero is treated as one.
pub async fn gather_settled<I, F, T, E>(ops: I, max_concurrent: usize) -> Vec<Result<T, E>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T, E>>,
{
    let gate = Semaphore::new(max_concurrent.max(1));
    let mut pending: FuturesUnordered<_> = ops
        .into_iter()
        .enumerate()
        .map(|(idx, op)| gated(&gate, idx, op))
        .collect();

    let mut slots: Vec<Option<Result<T, E>>> =
        std::iter::repeat_with(|| None).take(pending.len()).collect();
    while let Some((idx, result)) = pending.next().await {
        slots[idx] = Some(result);
    }

    slots.into_iter().flatten().collect()
}

/// Hold a gate slot for the whole life of `op`
async fn gated<F, T, E>(gate: &Semaphore, idx: usize, op: F) -> (usize, Result<T, E>)
where
    F: Future<Output = Result<T, E>>,
{
    // The gate is never closed, so acquisition cannot fail
    let _permit = gate.acquire().await;
    (idx, op.await)
}

/// Reusable dispatch settings: a concurrency ceiling plus an optional
/// per-operation deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatcher {
    max_concurrent: usize,
    operation_timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(max_concurrent: usize) -> Result<Self, ResilienceError> {
        if max_concurrent == 0 {
            return Err(ResilienceError::InvalidConfig(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            max_concurrent,
            operation_timeout: None,
        })
    }

    /// Wrap every dispatched operation in [`run_with_timeout`]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout
    }

    /// Like [`gather_with_concurrency`], applying the per-operation deadline
    pub async fn gather<I, F, T, E>(&self, ops: I) -> Result<Vec<T>, E>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = Result<T, E>>,
        E: From<ResilienceError>,
    {
        let timeout = self.operation_timeout;
        gather_with_concurrency(
            ops.into_iter().map(|op| bounded(timeout, op)),
            self.max_concurrent,
        )
        .await
    }

    /// Like [`gather_settled`], applying the per-operation deadline
    pub async fn gather_settled<I, F, T, E>(&self, ops: I) -> Vec<Result<T, E>>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = Result<T, E>>,
        E: From<ResilienceError>,
    {
        let timeout = self.operation_timeout;
        gather_settled(
            ops.into_iter().map(|op| bounded(timeout, op)),
            self.max_concurrent,
        )
        .await
    }
}

async fn bounded<F, T, E>(timeout: Option<Duration>, op: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<ResilienceError>,
{
    match timeout {
        Some(timeout) => run_with_timeout(timeout, op).await,
        None => op.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_results_keep_input_order() {
        let ops = (0..10u64).map(|i| async move {
            tokio::time::sleep(Duration::from_millis((10 - i) * 10)).await;
            Ok::<_, ResilienceError>(i)
        });

        let results = gather_with_concurrency(ops, 10).await.unwrap();
        assert_eq!(results, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_ceiling() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let ops = (0..20).map(|i| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, ResilienceError>(i)
            }
        });

        let results = gather_with_concurrency(ops, 5).await.unwrap();
        assert_eq!(results.len(), 20);
        assert_eq!(peak.load(Ordering::SeqCst), 5);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_error_propagates_and_cancels_siblings() {
        let finished = Arc::new(AtomicBool::new(false));

        let slow = {
            let finished = finished.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                finished.store(true, Ordering::SeqCst);
                Ok::<i32, ResilienceError>(1)
            }
        };
        let failing = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err::<i32, _>(ResilienceError::Permanent("bad input".into()))
        };

        let ops: Vec<std::pin::Pin<Box<dyn Future<Output = Result<i32, ResilienceError>>>>> =
            vec![Box::pin(slow), Box::pin(failing)];
        let result = gather_with_concurrency(ops, 2).await;
        assert_eq!(
            result,
            Err(ResilienceError::Permanent("bad input".into()))
        );

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_settled_captures_errors_in_place() {
        let ops = (0..4).map(|i| async move {
            if i % 2 == 0 {
                Ok(i)
            } else {
                Err(ResilienceError::Transient(format!("op {}", i)))
            }
        });

        let results = gather_settled(ops, 2).await;
        assert_eq!(results.len(), 4);
        assert_eq!(results[0], Ok(0));
        assert_eq!(results[1], Err(ResilienceError::Transient("op 1".into())));
        assert_eq!(results[2], Ok(2));
        assert_eq!(results[3], Err(ResilienceError::Transient("op 3".into())));
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let ops: Vec<std::future::Ready<Result<u8, ResilienceError>>> = Vec::new();
        assert!(gather_with_concurrency(ops, 3).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_concurrency_is_clamped() {
        let ops = (0..3).map(|i| async move { Ok::<_, ResilienceError>(i) });
        assert_eq!(gather_with_concurrency(ops, 0).await.unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_expires() {
        let start = Instant::now();
        let result: Result<(), ResilienceError> = run_with_timeout(Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        assert_eq!(result, Err(ResilienceError::Timeout(Duration::from_secs(1))));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_timeout_passes_operation_error_through() {
        let result: Result<(), ResilienceError> =
            run_with_timeout(Duration::from_secs(5), async {
                Err(ResilienceError::Permanent("denied".into()))
            })
            .await;
        assert_eq!(result, Err(ResilienceError::Permanent("denied".into())));
    }

    #[tokio::test]
    async fn test_zero_timeout_never_polls() {
        let polled = AtomicBool::new(false);
        let result: Result<(), ResilienceError> = run_with_timeout(Duration::ZERO, async {
            polled.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await;

        assert_eq!(result, Err(ResilienceError::Timeout(Duration::ZERO)));
        assert!(!polled.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_deadline_fails_immediately() {
        let deadline = Instant::now();
        tokio::time::advance(Duration::from_millis(5)).await;

        let result: Result<u8, ResilienceError> = run_until(deadline, async { Ok(1) }).await;
        assert!(matches!(result, Err(ResilienceError::Timeout(_))));
    }

    #[test]
    fn test_dispatcher_rejects_zero() {
        assert!(matches!(
            Dispatcher::new(0),
            Err(ResilienceError::InvalidConfig(_))
        ));
        assert_eq!(Dispatcher::new(4).unwrap().max_concurrent(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatcher_applies_operation_timeout() {
        let dispatcher = Dispatcher::new(2)
            .unwrap()
            .with_operation_timeout(Duration::from_millis(100));

        let ops = [10u64, 500, 20].map(|ms| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, ResilienceError>(ms)
        });

        let results = dispatcher.gather_settled(ops).await;
        assert_eq!(results[0], Ok(10));
        assert_eq!(
            results[1],
            Err(ResilienceError::Timeout(Duration::from_millis(100)))
        );
        assert_eq!(results[2], Ok(20));
    }
}
