//! Distributed ingestion lock.
//!
//! One ingestion run at a time, cluster-wide, keyed `ingestion:run` with a
//! one-hour lease so a crashed holder expires on its own. Without a lock
//! backend (no `REDIS_URL`, or the backend is unreachable) the lock degrades
//! to a no-op with a warning - acceptable on single-node deployments, where
//! the OS process is the only writer.

use anyhow::Result;
use prodplan_common::error::ProdplanError;
use redis::aio::ConnectionManager;
use tracing::{info, warn};

/// Lock key in the backend.
pub const LOCK_KEY: &str = "ingestion:run";

/// Lease duration; a second invocation inside it fails fast.
pub const LOCK_TTL_SECS: u64 = 3600;

/// Cluster-wide mutual exclusion for the ingestion pipeline.
pub struct IngestionLock {
    conn: Option<ConnectionManager>,
    held: bool,
}

impl IngestionLock {
    /// Connect to the lock backend. Failure to connect degrades to no-op.
    pub async fn connect(redis_url: Option<&str>) -> Self {
        let conn = match redis_url {
            Some(url) => match Self::try_connect(url).await {
                Ok(conn) => Some(conn),
                Err(e) => {
                    warn!(error = %e, "lock backend unavailable, distributed lock degrades to no-op");
                    None
                }
            },
            None => {
                warn!("REDIS_URL not set, distributed lock degrades to no-op");
                None
            }
        };
        Self { conn, held: false }
    }

    async fn try_connect(url: &str) -> Result<ConnectionManager> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(conn)
    }

    /// Acquire the lock or fail fast with `CONCURRENT_RUN`.
    pub async fn acquire(&mut self) -> Result<()> {
        let Some(conn) = self.conn.as_mut() else {
            self.held = true;
            return Ok(());
        };

        let acquired: Option<String> = redis::cmd("SET")
            .arg(LOCK_KEY)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(LOCK_TTL_SECS)
            .query_async(conn)
            .await?;

        if acquired.is_none() {
            return Err(ProdplanError::ConcurrentRun(format!(
                "lock {LOCK_KEY} is held by another ingestion process"
            ))
            .into());
        }

        info!(key = LOCK_KEY, ttl_secs = LOCK_TTL_SECS, "ingestion lock acquired");
        self.held = true;
        Ok(())
    }

    /// Release the lock. A failed release is logged; the TTL is the backstop.
    pub async fn release(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        if let Some(conn) = self.conn.as_mut() {
            let result: redis::RedisResult<()> =
                redis::cmd("DEL").arg(LOCK_KEY).query_async(conn).await;
            match result {
                Ok(()) => info!(key = LOCK_KEY, "ingestion lock released"),
                Err(e) => warn!(error = %e, "failed to release ingestion lock, lease will expire"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_backend_degrades_to_noop() {
        let mut lock = IngestionLock::connect(None).await;
        assert!(lock.acquire().await.is_ok());
        lock.release().await;
    }

    #[tokio::test]
    async fn test_unreachable_backend_degrades_to_noop() {
        let mut lock = IngestionLock::connect(Some("redis://127.0.0.1:1/0")).await;
        assert!(lock.acquire().await.is_ok());
        lock.release().await;
    }
}
