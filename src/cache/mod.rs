// ===============================
// src/cache/mod.rs (tiered cache)
// ===============================
//
// Lookup order: memory -> shared (Redis) -> durable (SQLite) -> miss.
// - Hit di tier lambat dipromosikan ke semua tier yang lebih cepat.
// - Set menulis ke semua tier aktif; error tier lambat hanya di-log.
// - Expiry dicek saat baca (lazy), tidak ada purge aktif.
// - Tiap operasi tier lambat dibatasi `tier_timeout`; timeout = error = miss.
// - Semua tier boleh dimatikan; cache jadi no-op yang selalu miss.
//
mod durable;
mod memory;
mod shared;

pub use durable::SqliteTier;
pub use memory::MemoryTier;
pub use shared::RedisTier;

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{now_iso, round2};
use crate::metrics::{CACHE_ERRORS, CACHE_HITS, CACHE_MISSES, CONFIG_CACHE_TIER};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("sqlite pool: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0} timed out")]
    Timeout(&'static str),
}

/// Serialized value plus its remaining lifetime (if the tier knows it).
#[derive(Debug, Clone, PartialEq)]
pub struct TierEntry {
    pub payload: String,
    pub ttl: Option<Duration>,
}

/// A slower cache tier reached over I/O.
#[async_trait]
pub trait CacheTier: Send + Sync {
    fn name(&self) -> &'static str;
    async fn get(&self, key: &str) -> Result<Option<TierEntry>, CacheError>;
    async fn set(&self, key: &str, payload: &str, ttl: Duration) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    async fn clear(&self) -> Result<(), CacheError>;
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub default_ttl: Duration,
    /// Upper bound for a single Redis / SQLite call
    pub tier_timeout: Duration,
    pub max_entries: usize,
    pub enable_memory: bool,
    pub redis_url: Option<String>,
    pub sqlite_path: Option<PathBuf>,
    pub namespace: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            tier_timeout: DEFAULT_TIER_TIMEOUT,
            max_entries: 1000,
            enable_memory: true,
            redis_url: None,
            sqlite_path: None,
            namespace: "pnl".to_string(),
        }
    }
}

const DEFAULT_TIER_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    pub total: u64,
    /// Percentage, 2 decimals
    pub hit_rate: f64,
    /// Entries currently held by the memory tier
    pub size: usize,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheHealth {
    pub memory: &'static str,
    pub tiers: Vec<&'static str>,
}

pub struct TieredCache {
    memory: Option<MemoryTier>,
    slower: Vec<Box<dyn CacheTier>>,
    default_ttl: Duration,
    tier_timeout: Duration,
    counters: Counters,
}

impl TieredCache {
    pub fn new(
        memory: Option<MemoryTier>,
        slower: Vec<Box<dyn CacheTier>>,
        default_ttl: Duration,
    ) -> Self {
        Self {
            memory,
            slower,
            default_ttl,
            tier_timeout: DEFAULT_TIER_TIMEOUT,
            counters: Counters::default(),
        }
    }

    pub fn with_tier_timeout(mut self, tier_timeout: Duration) -> Self {
        self.tier_timeout = tier_timeout;
        self
    }

    /// Cache with every tier off: always misses, never fails.
    pub fn disabled() -> Self {
        Self::new(None, Vec::new(), Duration::from_secs(300))
    }

    /// Build tiers from config. Tier yang gagal connect dimatikan (warn), startup jalan terus.
    pub async fn connect(cfg: &CacheConfig) -> Self {
        let memory = cfg.enable_memory.then(|| MemoryTier::new(cfg.max_entries));
        CONFIG_CACHE_TIER
            .with_label_values(&["memory"])
            .set(memory.is_some() as i64);

        let mut slower: Vec<Box<dyn CacheTier>> = Vec::new();

        if let Some(url) = &cfg.redis_url {
            match RedisTier::connect(url, &cfg.namespace).await {
                Ok(t) => {
                    info!(%url, "cache: redis tier connected");
                    slower.push(Box::new(t));
                }
                Err(e) => warn!(?e, %url, "cache: redis tier disabled"),
            }
        }
        if let Some(path) = &cfg.sqlite_path {
            match SqliteTier::open(path) {
                Ok(t) => {
                    info!(path = %path.display(), "cache: sqlite tier ready");
                    slower.push(Box::new(t));
                }
                Err(e) => warn!(?e, path = %path.display(), "cache: sqlite tier disabled"),
            }
        }
        for t in &slower {
            CONFIG_CACHE_TIER.with_label_values(&[t.name()]).set(1);
        }

        Self::new(memory, slower, cfg.default_ttl).with_tier_timeout(cfg.tier_timeout)
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if let Some(mem) = &self.memory {
            if let Some(entry) = mem.get(key) {
                if let Some(v) = self.decode(key, &entry.payload) {
                    self.hit("memory");
                    return Some(v);
                }
                mem.delete(key);
            }
        }

        for (idx, tier) in self.slower.iter().enumerate() {
            let entry = match self.bounded(tier.name(), tier.get(key)).await {
                Ok(Some(e)) => e,
                Ok(None) => continue,
                Err(e) => {
                    self.tier_error(tier.name(), "get", key, &e);
                    continue;
                }
            };
            let Some(v) = self.decode(key, &entry.payload) else {
                continue;
            };
            self.promote(key, &entry, idx).await;
            self.hit(tier.name());
            return Some(v);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        CACHE_MISSES.inc();
        debug!(%key, "cache miss");
        None
    }

    /// Returns true if at least one tier stored the value.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        let payload = match serde_json::to_string(value) {
            Ok(p) => p,
            Err(e) => {
                self.tier_error("encode", "set", key, &CacheError::from(e));
                return false;
            }
        };
        let ttl = ttl.unwrap_or(self.default_ttl);
        let mut stored = false;

        if let Some(mem) = &self.memory {
            mem.set(key, &payload, ttl);
            stored = true;
        }
        for tier in &self.slower {
            match self.bounded(tier.name(), tier.set(key, &payload, ttl)).await {
                Ok(()) => stored = true,
                Err(e) => self.tier_error(tier.name(), "set", key, &e),
            }
        }

        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        stored
    }

    pub async fn delete(&self, key: &str) {
        if let Some(mem) = &self.memory {
            mem.delete(key);
        }
        for tier in &self.slower {
            if let Err(e) = self.bounded(tier.name(), tier.delete(key)).await {
                self.tier_error(tier.name(), "delete", key, &e);
            }
        }
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn clear(&self) {
        if let Some(mem) = &self.memory {
            mem.clear();
        }
        for tier in &self.slower {
            if let Err(e) = self.bounded(tier.name(), tier.clear()).await {
                self.tier_error(tier.name(), "clear", "*", &e);
            }
        }
        info!("cache cleared");
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            round2(hits as f64 / total as f64 * 100.0)
        } else {
            0.0
        };
        CacheStats {
            hits,
            misses,
            sets: self.counters.sets.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            total,
            hit_rate,
            size: self.memory.as_ref().map(|m| m.len()).unwrap_or(0),
            timestamp: now_iso(),
        }
    }

    pub fn health(&self) -> CacheHealth {
        CacheHealth {
            memory: if self.memory.is_some() { "enabled" } else { "disabled" },
            tiers: self.slower.iter().map(|t| t.name()).collect(),
        }
    }

    // Write a slower-tier hit back into every faster tier.
    async fn promote(&self, key: &str, entry: &TierEntry, found_at: usize) {
        let ttl = entry.ttl.unwrap_or(self.default_ttl);
        if let Some(mem) = &self.memory {
            mem.set(key, &entry.payload, ttl);
        }
        for tier in &self.slower[..found_at] {
            if let Err(e) = self.bounded(tier.name(), tier.set(key, &entry.payload, ttl)).await {
                self.tier_error(tier.name(), "promote", key, &e);
            }
        }
    }

    async fn bounded<T>(
        &self,
        tier: &'static str,
        op: impl Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        match tokio::time::timeout(self.tier_timeout, op).await {
            Ok(res) => res,
            Err(_) => Err(CacheError::Timeout(tier)),
        }
    }

    fn decode<T: DeserializeOwned>(&self, key: &str, payload: &str) -> Option<T> {
        match serde_json::from_str(payload) {
            Ok(v) => Some(v),
            Err(e) => {
                self.tier_error("decode", "get", key, &CacheError::from(e));
                None
            }
        }
    }

    fn hit(&self, tier: &str) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        CACHE_HITS.with_label_values(&[tier]).inc();
    }

    fn tier_error(&self, tier: &str, op: &str, key: &str, e: &CacheError) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        CACHE_ERRORS.with_label_values(&[tier, op]).inc();
        warn!(tier, op, %key, error = %e, "cache tier error (ignored)");
    }
}

/// Namespaced key, e.g. `cache_key("trading", "data") == "trading:data"`.
pub fn cache_key(namespace: &str, key: &str) -> String {
    format!("{namespace}:{key}")
}
