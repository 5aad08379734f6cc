use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::{debug, error};

use crate::error::Result;

/// SQLite-backed key-value cache with optional per-key expiry and atomic
/// counters.
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        // An in-memory database lives and dies with its single connection
        let in_memory = database_url.contains(":memory:");
        let mut options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            options = options.idle_timeout(None).max_lifetime(None);
        }
        let pool = options.connect(database_url).await?;

        Ok(Self { pool })
    }

    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS counters (
                key TEXT PRIMARY KEY,
                count INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_cache_expires
            ON cache(expires_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Utc::now().timestamp();
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT value FROM cache
            WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.0))
    }

    /// Overwrite `key`. Without a TTL the value lives until the next write.
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| Utc::now().timestamp() + ttl.as_secs() as i64);

        sqlx::query(
            r#"
            INSERT INTO cache (key, value, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Increment the counter at `key` and return the new count. A counter
    /// whose lifetime has ended restarts at 1 with a fresh lifetime.
    pub async fn increment(&self, key: &str, ttl: Duration) -> Result<u64> {
        let now = Utc::now().timestamp();
        let expires_at = now + ttl.as_secs() as i64;

        let (count,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO counters (key, count, expires_at)
            VALUES (?, 1, ?)
            ON CONFLICT(key) DO UPDATE SET
                count = CASE WHEN counters.expires_at <= ? THEN 1 ELSE counters.count + 1 END,
                expires_at = CASE WHEN counters.expires_at <= ? THEN excluded.expires_at
                                  ELSE counters.expires_at END
            RETURNING count
            "#,
        )
        .bind(key)
        .bind(expires_at)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }

    /// Delete expired cache entries and counters, returning how many rows went.
    pub async fn purge_expired(&self) -> Result<u64> {
        let now = Utc::now().timestamp();

        let cache = sqlx::query("DELETE FROM cache WHERE expires_at IS NOT NULL AND expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        let counters = sqlx::query("DELETE FROM counters WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(cache.rows_affected() + counters.rows_affected())
    }

    /// Periodically drop expired rows so memos and counters don't pile up.
    pub async fn start_background_purge(self: Arc<Self>, every: Duration) {
        loop {
            tokio::time::sleep(every).await;
            match self.purge_expired().await {
                Ok(0) => {}
                Ok(removed) => debug!("Purged {} expired cache rows", removed),
                Err(e) => error!("Failed to purge expired cache rows: {}", e),
            }
        }
    }

    #[cfg(test)]
    async fn force_expire(&self, key: &str) -> Result<()> {
        sqlx::query("UPDATE cache SET expires_at = 0 WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        sqlx::query("UPDATE counters SET expires_at = 0 WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn create_test_db() -> Database {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.initialize().await.unwrap();
        db
    }

    mod initialization_tests {
        use super::*;

        #[tokio::test]
        async fn test_database_creation() {
            let db = Database::new("sqlite::memory:").await;
            assert!(db.is_ok());
        }

        #[tokio::test]
        async fn test_double_initialization_is_safe() {
            let db = create_test_db().await;
            let result = db.initialize().await;
            assert!(result.is_ok());
        }
    }

    mod get_set_tests {
        use super::*;

        #[tokio::test]
        async fn test_get_missing_key() {
            let db = create_test_db().await;
            assert_eq!(db.get("news:general").await.unwrap(), None);
        }

        #[tokio::test]
        async fn test_set_then_get() {
            let db = create_test_db().await;
            db.set("news:general", "[]", None).await.unwrap();
            assert_eq!(db.get("news:general").await.unwrap().as_deref(), Some("[]"));
        }

        #[tokio::test]
        async fn test_set_overwrites() {
            let db = create_test_db().await;
            db.set("key", "first", None).await.unwrap();
            db.set("key", "second", None).await.unwrap();
            assert_eq!(db.get("key").await.unwrap().as_deref(), Some("second"));
        }

        #[tokio::test]
        async fn test_overwrite_without_ttl_clears_expiry() {
            let db = create_test_db().await;
            db.set("key", "first", Some(Duration::from_secs(60))).await.unwrap();
            db.set("key", "second", None).await.unwrap();
            db.purge_expired().await.unwrap();
            assert_eq!(db.get("key").await.unwrap().as_deref(), Some("second"));
        }

        #[tokio::test]
        async fn test_expired_entry_is_invisible() {
            let db = create_test_db().await;
            db.set("memo", "text", Some(Duration::from_secs(60))).await.unwrap();
            assert!(db.get("memo").await.unwrap().is_some());

            db.force_expire("memo").await.unwrap();
            assert_eq!(db.get("memo").await.unwrap(), None);
        }
    }

    mod counter_tests {
        use super::*;

        #[tokio::test]
        async fn test_increment_counts_up() {
            let db = create_test_db().await;
            let ttl = Duration::from_secs(60);
            assert_eq!(db.increment("c", ttl).await.unwrap(), 1);
            assert_eq!(db.increment("c", ttl).await.unwrap(), 2);
            assert_eq!(db.increment("c", ttl).await.unwrap(), 3);
        }

        #[tokio::test]
        async fn test_counters_are_independent() {
            let db = create_test_db().await;
            let ttl = Duration::from_secs(60);
            db.increment("a", ttl).await.unwrap();
            db.increment("a", ttl).await.unwrap();
            assert_eq!(db.increment("b", ttl).await.unwrap(), 1);
        }

        #[tokio::test]
        async fn test_expired_counter_restarts() {
            let db = create_test_db().await;
            let ttl = Duration::from_secs(60);
            db.increment("c", ttl).await.unwrap();
            db.increment("c", ttl).await.unwrap();

            db.force_expire("c").await.unwrap();
            assert_eq!(db.increment("c", ttl).await.unwrap(), 1);
        }
    }

    mod purge_tests {
        use super::*;

        #[tokio::test]
        async fn test_purge_removes_only_expired() {
            let db = create_test_db().await;
            db.set("keep", "v", None).await.unwrap();
            db.set("keep-ttl", "v", Some(Duration::from_secs(600))).await.unwrap();
            db.set("drop", "v", Some(Duration::from_secs(600))).await.unwrap();
            db.increment("counter", Duration::from_secs(60)).await.unwrap();
            db.force_expire("drop").await.unwrap();
            db.force_expire("counter").await.unwrap();

            let removed = db.purge_expired().await.unwrap();
            assert_eq!(removed, 2);
            assert!(db.get("keep").await.unwrap().is_some());
            assert!(db.get("keep-ttl").await.unwrap().is_some());
        }
    }
}
