//! Soft connection cache for the dead-letter store
//!
//! Unlike the general resource pool this is not a concurrency bound: a
//! checkout with nothing idle opens a fresh connection, and a checkin with
//! the cache already full closes the connection instead of waiting.

use crate::error::{DeadLetterError, Result};
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Cache counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Connections waiting in the cache
    pub idle: usize,
    /// Most connections the cache keeps
    pub capacity: usize,
    /// Connections opened over the store's lifetime
    pub opened: u64,
    /// Connections closed on checkin because the cache was full or closed
    pub discarded: u64,
}

pub(crate) struct ConnectionCache {
    path: PathBuf,
    busy_timeout: Duration,
    capacity: usize,
    idle: Mutex<Vec<Connection>>,
    opened: AtomicU64,
    discarded: AtomicU64,
    closed: AtomicBool,
}

impl ConnectionCache {
    pub(crate) fn new(path: PathBuf, busy_timeout: Duration, capacity: usize) -> Self {
        Self {
            path,
            busy_timeout,
            capacity,
            idle: Mutex::new(Vec::with_capacity(capacity)),
            opened: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Connection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take an idle connection, or open one if none is cached
    ///
    /// Blocking; call from a blocking worker.
    pub(crate) fn checkout(&self) -> Result<Connection> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DeadLetterError::Closed);
        }
        if let Some(conn) = self.lock().pop() {
            return Ok(conn);
        }

        let conn = open_connection(&self.path, self.busy_timeout)?;
        self.opened.fetch_add(1, Ordering::Relaxed);
        debug!(path = %self.path.display(), "opened dead-letter connection");
        Ok(conn)
    }

    /// Return a connection, closing it if the cache is full or shut down
    pub(crate) fn checkin(&self, conn: Connection) {
        let overflow = {
            let mut idle = self.lock();
            if self.closed.load(Ordering::Acquire) || idle.len() >= self.capacity {
                Some(conn)
            } else {
                idle.push(conn);
                None
            }
        };

        if let Some(conn) = overflow {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            if let Err((_, err)) = conn.close() {
                debug!(error = %err, "failed to close surplus dead-letter connection");
            }
        }
    }

    /// Refuse further checkouts and close everything idle
    pub(crate) fn close(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<Connection> = std::mem::take(&mut *self.lock());
        let count = drained.len();
        for conn in drained {
            if let Err((_, err)) = conn.close() {
                debug!(error = %err, "failed to close dead-letter connection");
            }
        }
        count
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn stats(&self) -> CacheStats {
        CacheStats {
            idle: self.lock().len(),
            capacity: self.capacity,
            opened: self.opened.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let conn = Connection::open_with_flags(path, flags)?;
    apply_pragmas(&conn, busy_timeout)?;
    Ok(conn)
}

/// Write-ahead journaling with relaxed fsync
fn apply_pragmas(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA journal_mode = wal;")?;
    conn.execute_batch("PRAGMA synchronous = normal;")?;
    Ok(())
}
