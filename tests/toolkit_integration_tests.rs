/*!
 * Integration tests for the assembled toolkit
 *
 * A fake downstream "search API" with its own error type runs through
 * pooling, bounded dispatch, retry, circuit breaking, and finally the
 * dead-letter store.
 */

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use taskguard::{
    config::ToolkitConfig,
    dead_letter::NewDeadLetter,
    resilience::{
        CircuitState, Classify, ErrorKind, ResilienceError, ResourceFactory, RetryError,
    },
    Toolkit,
};
use tempfile::TempDir;
use thiserror::Error;

#[derive(Debug, Error)]
enum SearchError {
    #[error("search backend returned 503")]
    Unavailable,

    #[error("query rejected: {0}")]
    BadQuery(String),

    #[error(transparent)]
    Resilience(#[from] ResilienceError),
}

impl Classify for SearchError {
    fn kind(&self) -> ErrorKind {
        match self {
            SearchError::Unavailable => ErrorKind::Transient,
            SearchError::BadQuery(_) => ErrorKind::InvalidInput,
            SearchError::Resilience(e) => e.kind(),
        }
    }
}

struct ClientFactory {
    created: AtomicUsize,
}

#[async_trait]
impl ResourceFactory<usize> for ClientFactory {
    async fn create(&self) -> Result<usize, ResilienceError> {
        Ok(self.created.fetch_add(1, Ordering::SeqCst))
    }

    async fn is_healthy(&self, _client: &usize) -> bool {
        true
    }

    async fn close(&self, _client: usize) {}
}

fn config(dir: &TempDir) -> ToolkitConfig {
    let mut config = ToolkitConfig::default();
    config.dead_letter.path = dir.path().join("dlq.db");
    config.retry.min_wait_ms = 1;
    config.retry.max_wait_ms = 2;
    config.pool.max_size = 2;
    config.dispatch.max_concurrent = 4;
    config.rate_limiter.burst_size = 50;
    config.rate_limiter.max_calls_per_minute = 100;
    config
}

#[tokio::test]
async fn test_exhausted_task_lands_in_dead_letter_store() {
    let dir = tempfile::tempdir().unwrap();
    let toolkit = Toolkit::from_config(config(&dir)).await.unwrap();
    let calls = AtomicU32::new(0);

    let failure = toolkit
        .call_dependency("search", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(SearchError::Unavailable) }
        })
        .await
        .unwrap_err();

    assert!(failure.is_exhausted());
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let entry = toolkit
        .escalate_failure("query-17", "search", "https://search.example", &failure)
        .await
        .unwrap();
    assert_eq!(entry.failure_reason, "search backend returned 503");

    let stored = toolkit
        .dead_letters()
        .get_entry("query-17")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored, entry);
    assert_eq!(stored.retry_count, 3);
}

#[tokio::test]
async fn test_invalid_input_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let toolkit = Toolkit::from_config(config(&dir)).await.unwrap();
    let calls = AtomicU32::new(0);

    let failure = toolkit
        .call_dependency("search", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(SearchError::BadQuery("empty".to_string())) }
        })
        .await
        .unwrap_err();

    assert!(!failure.is_exhausted());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // InvalidInput still says the call failed, so it counts against the breaker
    assert_eq!(toolkit.breaker("search").failure_count(), 1);
}

#[tokio::test]
async fn test_repeated_exhaustion_opens_breaker() {
    let dir = tempfile::tempdir().unwrap();
    let toolkit = Toolkit::from_config(config(&dir)).await.unwrap();
    let calls = AtomicU32::new(0);

    // 3 attempts each: the breaker opens on the fifth failure, during the
    // second call, and that call's third attempt is rejected
    for _ in 0..2 {
        let _ = toolkit
            .call_dependency("search", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(SearchError::Unavailable) }
            })
            .await;
    }

    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(toolkit.breaker("search").state(), CircuitState::Open);

    let failure = toolkit
        .call_dependency("search", || async { Ok::<_, SearchError>(()) })
        .await
        .unwrap_err();
    assert_eq!(failure.last_error().kind(), ErrorKind::CircuitOpen);

    // Other dependencies keep their own breaker
    toolkit
        .call_dependency("embeddings", || async { Ok::<_, SearchError>(()) })
        .await
        .unwrap();
    assert_eq!(toolkit.breaker("embeddings").state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_dispatch_through_configured_pool() {
    let dir = tempfile::tempdir().unwrap();
    let toolkit = Toolkit::from_config(config(&dir)).await.unwrap();
    let factory = Arc::new(ClientFactory {
        created: AtomicUsize::new(0),
    });
    let pool = toolkit.resource_pool(factory.clone()).unwrap();

    let ops = (0..8).map(|i| {
        let pool = pool.clone();
        let toolkit = toolkit.clone();
        async move {
            toolkit
                .call_dependency("search", || {
                    let pool = pool.clone();
                    async move {
                        let client = pool.acquire().await?;
                        client.release().await;
                        Ok::<_, SearchError>(i * 10)
                    }
                })
                .await
                .map_err(RetryError::into_inner)
        }
    });

    let results = toolkit.dispatcher().gather(ops).await.unwrap();

    assert_eq!(results, vec![0, 10, 20, 30, 40, 50, 60, 70]);
    assert!(factory.created.load(Ordering::SeqCst) <= 2);
    assert!(pool.stats().total <= 2);
}

#[tokio::test]
async fn test_manual_escalation_with_workflow_state() {
    let dir = tempfile::tempdir().unwrap();
    let toolkit = Toolkit::from_config(config(&dir)).await.unwrap();

    toolkit
        .escalate(
            NewDeadLetter::new("doc-3", "summarize", "https://llm.example", "policy violation")
                .with_workflow_state(serde_json::json!({ "chunk": 4 }))
                .with_last_error_phase("generate"),
        )
        .await
        .unwrap();

    let entries = toolkit.dead_letters().get_entries(10, 0).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].last_error_phase.as_deref(), Some("generate"));

    toolkit.close().await;
}
