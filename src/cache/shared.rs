// ===============================
// src/cache/shared.rs (Redis tier)
// ===============================
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use super::{CacheError, CacheTier, TierEntry};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Shared tier. Every key is stored under `{namespace}:` so `clear()` only
/// touches our own keys.
pub struct RedisTier {
    conn: ConnectionManager,
    namespace: String,
}

impl RedisTier {
    pub async fn connect(url: &str, namespace: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| CacheError::Timeout("redis connect"))??;
        Ok(Self { conn, namespace: namespace.to_string() })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }
}

#[async_trait]
impl CacheTier for RedisTier {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<TierEntry>, CacheError> {
        // ConnectionManager murah di-clone; tidak ada lock yang ditahan saat I/O
        let mut con = self.conn.clone();
        let k = self.full_key(key);
        let (payload, pttl): (Option<String>, i64) = redis::pipe()
            .cmd("GET")
            .arg(&k)
            .cmd("PTTL")
            .arg(&k)
            .query_async(&mut con)
            .await?;
        Ok(payload.map(|payload| TierEntry {
            payload,
            ttl: (pttl > 0).then(|| Duration::from_millis(pttl as u64)),
        }))
    }

    async fn set(&self, key: &str, payload: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut con = self.conn.clone();
        let ttl_ms = ttl.as_millis().max(1) as u64;
        redis::cmd("SET")
            .arg(self.full_key(key))
            .arg(payload)
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<_, ()>(&mut con)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut con = self.conn.clone();
        redis::cmd("DEL")
            .arg(self.full_key(key))
            .query_async::<_, ()>(&mut con)
            .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut con = self.conn.clone();
        let pattern = format!("{}:*", self.namespace);
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut con)
                .await?;
            if !keys.is_empty() {
                redis::cmd("DEL").arg(&keys).query_async::<_, ()>(&mut con).await?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(())
    }
}
