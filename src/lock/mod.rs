//! Advisory distributed mutex for short critical sections.
//!
//! Acquire is an atomic "set if not present, with expiry" that hands back
//! a [`LockLease`] capability holding the owner token. Release is a
//! compare-and-delete that only succeeds while the caller's token still
//! matches, so a late release never clobbers a newer holder. Failing to
//! acquire is not an error: callers get `None` and decide whether to skip
//! or proceed unguarded.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error, Diagnostic)]
pub enum LockError {
    #[error("lock backend error: {0}")]
    #[diagnostic(code(pagewright::lock::backend))]
    Backend(#[from] sqlx::Error),
}

/// Proof of lock ownership; required to release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub key: String,
    pub token: String,
}

#[async_trait]
pub trait DistributedMutex: Send + Sync {
    /// Try-acquire `key` for `ttl`; `None` means the lock is held and the
    /// caller should treat that as busy.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, LockError>;

    /// Compare-and-delete; returns `false` when the lease went stale and
    /// the row now belongs to someone else (a no-op, never an error).
    async fn release(&self, lease: &LockLease) -> Result<bool, LockError>;
}

/// Mutex rows live in `advisory_locks`. An expired row counts as absent,
/// so crashed holders never wedge a key.
#[derive(Debug, Clone)]
pub struct SqliteMutex {
    pool: SqlitePool,
}

impl SqliteMutex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DistributedMutex for SqliteMutex {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, LockError> {
        let token = Uuid::new_v4().to_string();
        let now_ms = Utc::now().timestamp_millis();
        let expires_at_ms = now_ms + ttl.as_millis() as i64;
        let result = sqlx::query(
            r#"
            INSERT INTO advisory_locks (key, token, expires_at_ms)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                token = excluded.token,
                expires_at_ms = excluded.expires_at_ms
            WHERE advisory_locks.expires_at_ms <= ?4
        "#,
        )
        .bind(key)
        .bind(&token)
        .bind(expires_at_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            debug!(key, "acquired advisory lock");
            Ok(Some(LockLease {
                key: key.to_string(),
                token,
            }))
        } else {
            Ok(None)
        }
    }

    async fn release(&self, lease: &LockLease) -> Result<bool, LockError> {
        let result = sqlx::query("DELETE FROM advisory_locks WHERE key = ?1 AND token = ?2")
            .bind(&lease.key)
            .bind(&lease.token)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Process-local implementation with the same contract; useful in tests
/// and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryMutex {
    held: Mutex<FxHashMap<String, (String, std::time::Instant)>>,
}

impl InMemoryMutex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedMutex for InMemoryMutex {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, LockError> {
        let mut held = self.held.lock();
        let now = std::time::Instant::now();
        if let Some((_, expires)) = held.get(key)
            && *expires > now
        {
            return Ok(None);
        }
        let token = Uuid::new_v4().to_string();
        held.insert(key.to_string(), (token.clone(), now + ttl));
        Ok(Some(LockLease {
            key: key.to_string(),
            token,
        }))
    }

    async fn release(&self, lease: &LockLease) -> Result<bool, LockError> {
        let mut held = self.held.lock();
        match held.get(&lease.key) {
            Some((token, _)) if *token == lease.token => {
                held.remove(&lease.key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
