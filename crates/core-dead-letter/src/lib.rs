//! Taskguard Core Dead Letter: durable quarantine for permanently failed tasks
//!
//! When a task has exhausted its retries (or its circuit breaker stays
//! open), the orchestrator records it here instead of dropping it. Entries
//! stay until an operator resolves them with
//! [`DeadLetterStore::remove_entry`].
//!
//! # Storage
//!
//! Entries live in a single SQLite table keyed on `task_id`. The database
//! runs in WAL mode with `synchronous = NORMAL`, trading a little durability
//! for write throughput. Connections come from a small soft cache (default
//! capacity 5): a checkout with nothing idle opens a connection on the spot,
//! and a checkin into a full cache closes the surplus connection.
//!
//! All SQLite work runs on tokio's blocking pool, so async callers are never
//! stalled by disk I/O.

pub mod conn_cache;
pub mod entry;
pub mod error;
pub mod store;

pub use conn_cache::CacheStats;
pub use entry::{DeadLetterEntry, NewDeadLetter};
pub use error::{DeadLetterError, Result};
pub use store::{DeadLetterConfig, DeadLetterStore};
