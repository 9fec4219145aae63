// ===============================
// src/cache/durable.rs (SQLite tier)
// ===============================
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};

use super::{CacheError, CacheTier, TierEntry};
use crate::domain::now_ms;

type DbPool = Pool<SqliteConnectionManager>;

/// Durable tier; semua query jalan di `spawn_blocking`.
pub struct SqliteTier {
    pool: DbPool,
}

impl SqliteTier {
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder().max_size(4).build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE IF NOT EXISTS cache (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                expiry     INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
             );",
        )?;

        Ok(Self { pool })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, CacheError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T, CacheError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await?
    }
}

#[async_trait]
impl CacheTier for SqliteTier {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<TierEntry>, CacheError> {
        let key = key.to_string();
        self.blocking(move |conn| {
            let row: Option<(String, i64)> = conn
                .query_row(
                    "SELECT value, expiry FROM cache WHERE key = ?1",
                    params![key],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            let now = now_ms();
            match row {
                Some((payload, expiry)) if expiry > now => Ok(Some(TierEntry {
                    payload,
                    ttl: Some(Duration::from_millis((expiry - now) as u64)),
                })),
                Some(_) => {
                    // expired: hapus saat dibaca
                    conn.execute("DELETE FROM cache WHERE key = ?1", params![key])?;
                    Ok(None)
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn set(&self, key: &str, payload: &str, ttl: Duration) -> Result<(), CacheError> {
        let key = key.to_string();
        let payload = payload.to_string();
        self.blocking(move |conn| {
            let now = now_ms();
            let expiry = now + ttl.as_millis() as i64;
            conn.execute(
                "INSERT OR REPLACE INTO cache (key, value, expiry, updated_at) VALUES (?1, ?2, ?3, ?4)",
                params![key, payload, expiry, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let key = key.to_string();
        self.blocking(move |conn| {
            conn.execute("DELETE FROM cache WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.blocking(|conn| {
            conn.execute("DELETE FROM cache", [])?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryTier, TieredCache};

    #[tokio::test]
    async fn round_trip_and_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let tier = SqliteTier::open(&dir.path().join("nested").join("cache.db")).unwrap();

        tier.set("k", "\"v\"", Duration::from_secs(30)).await.unwrap();
        let entry = tier.get("k").await.unwrap().unwrap();
        assert_eq!(entry.payload, "\"v\"");
        assert!(entry.ttl.unwrap() <= Duration::from_secs(30));

        tier.set("short", "1", Duration::from_millis(50)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(tier.get("short").await.unwrap().is_none());

        tier.delete("k").await.unwrap();
        assert!(tier.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn survives_a_fresh_memory_tier() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");

        let first = TieredCache::new(
            Some(MemoryTier::new(8)),
            vec![Box::new(SqliteTier::open(&path).unwrap())],
            Duration::from_secs(60),
        );
        first.set("pnl:current", &123.45f64, None).await;
        drop(first);

        // "restart": memory kosong, nilai datang dari sqlite lalu dipromosikan
        let second = TieredCache::new(
            Some(MemoryTier::new(8)),
            vec![Box::new(SqliteTier::open(&path).unwrap())],
            Duration::from_secs(60),
        );
        assert_eq!(second.get::<f64>("pnl:current").await, Some(123.45));
        assert_eq!(second.stats().size, 1);

        second.clear().await;
        assert_eq!(second.get::<f64>("pnl:current").await, None);
    }
}
