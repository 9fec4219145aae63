// ===============================
// src/sources/mod.rs
// ===============================
//
// Source adapters:
// - trading : trading venue balance + positions (REST, bearer + HMAC signature)
// - billing : LLM usage billing, daily spend
// - ledger  : manual revenue ledger, invoiced / collected
// - mock    : generator lokal untuk ketiganya (default, tanpa kredensial)
//
// Setiap fetch lewat `SourceGuard::fetch`: cache -> live -> fallback, semuanya
// di bawah circuit breaker per nama sumber. Baca cache, fetch live, tulis cache
// dan baca fallback masing-masing dibatasi timeout sumber; cache yang macet
// dianggap miss dan tidak dihitung sebagai kegagalan sumber.
//
mod billing;
mod ledger;
mod mock;
mod trading;

pub use billing::BillingApi;
pub use ledger::LedgerApi;
pub use mock::{MockBilling, MockLedger, MockTrading};
pub use trading::TradingVenue;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::breaker::{BreakerError, CircuitBreaker};
use crate::cache::{cache_key, TieredCache};
use crate::config::{SourceCfg, SourceMode};
use crate::domain::{BillingSnapshot, DataOrigin, LedgerSnapshot, TradingSnapshot};
use crate::metrics::{CONFIG_SOURCE_MODE, SOURCE_FETCH, SOURCE_LATENCY};

pub const TRADING: &str = "trading";
pub const BILLING: &str = "billing";
pub const LEDGER: &str = "ledger";

/// Last-known-good copies outlive the regular TTL so a long outage still
/// has something better than zeros to show.
const LAST_GOOD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{name} returned {status}: {body}")]
    Status { name: &'static str, status: u16, body: String },
    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("{0} unavailable")]
    Unavailable(&'static str),
}

/// Snapshot types that carry a [`DataOrigin`] marker.
pub trait Sourced {
    fn origin(&self) -> DataOrigin;
    fn with_origin(self, origin: DataOrigin) -> Self;
}

impl Sourced for TradingSnapshot {
    fn origin(&self) -> DataOrigin {
        self.origin
    }

    fn with_origin(mut self, origin: DataOrigin) -> Self {
        self.origin = origin;
        self
    }
}

impl Sourced for BillingSnapshot {
    fn origin(&self) -> DataOrigin {
        self.origin
    }

    fn with_origin(mut self, origin: DataOrigin) -> Self {
        self.origin = origin;
        self
    }
}

impl Sourced for LedgerSnapshot {
    fn origin(&self) -> DataOrigin {
        self.origin
    }

    fn with_origin(mut self, origin: DataOrigin) -> Self {
        self.origin = origin;
        self
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    type Snapshot: Sourced + Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static;

    /// Dependency name, also used as circuit name and cache namespace.
    fn name(&self) -> &'static str;
    /// Cache TTL matching how volatile the source is.
    fn ttl(&self) -> Duration;
    async fn fetch_live(&self) -> Result<Self::Snapshot, SourceError>;
}

pub type TradingSource = Arc<dyn SourceAdapter<Snapshot = TradingSnapshot>>;
pub type BillingSource = Arc<dyn SourceAdapter<Snapshot = BillingSnapshot>>;
pub type LedgerSource = Arc<dyn SourceAdapter<Snapshot = LedgerSnapshot>>;

#[derive(Clone)]
pub struct Sources {
    pub trading: TradingSource,
    pub billing: BillingSource,
    pub ledger: LedgerSource,
}

impl Sources {
    /// Build adapters from config (mock atau live per sumber).
    pub fn build(
        trading: &SourceCfg,
        billing: &SourceCfg,
        ledger: &SourceCfg,
        http: reqwest::Client,
    ) -> Result<Self, SourceError> {
        for (name, cfg) in [(TRADING, trading), (BILLING, billing), (LEDGER, ledger)] {
            CONFIG_SOURCE_MODE
                .with_label_values(&[name, cfg.mode.as_str()])
                .set(1);
        }

        let trading: TradingSource = match trading.mode {
            SourceMode::Mock => Arc::new(MockTrading::new(trading.ttl)),
            SourceMode::Live => Arc::new(TradingVenue::new(http.clone(), trading)?),
        };
        let billing: BillingSource = match billing.mode {
            SourceMode::Mock => Arc::new(MockBilling::new(billing.ttl)),
            SourceMode::Live => Arc::new(BillingApi::new(http.clone(), billing)?),
        };
        let ledger: LedgerSource = match ledger.mode {
            SourceMode::Mock => Arc::new(MockLedger::new(ledger.ttl)),
            SourceMode::Live => Arc::new(LedgerApi::new(http, ledger)?),
        };
        Ok(Self { trading, billing, ledger })
    }
}

/// Wraps every adapter call with cache, timeout and circuit breaker.
#[derive(Clone)]
pub struct SourceGuard {
    cache: Arc<TieredCache>,
    breaker: Arc<CircuitBreaker>,
    timeout: Duration,
}

impl SourceGuard {
    pub fn new(cache: Arc<TieredCache>, breaker: Arc<CircuitBreaker>, timeout: Duration) -> Self {
        Self { cache, breaker, timeout }
    }

    /// Never fails: degraded results are marked through `origin`.
    pub async fn fetch<S>(&self, src: &S) -> S::Snapshot
    where
        S: SourceAdapter + ?Sized,
    {
        let name = src.name();
        let key = cache_key(name, "data");
        let last_good = cache_key(name, "last_good");
        let started = Instant::now();

        let cache = &self.cache;
        let timeout = self.timeout;
        let key = key.as_str();
        let last_good = last_good.as_str();

        let res = self
            .breaker
            .execute(
                name,
                move || async move {
                    match tokio::time::timeout(timeout, cache.get::<S::Snapshot>(key)).await {
                        Ok(Some(hit)) => return Ok(hit.with_origin(DataOrigin::Cache)),
                        Ok(None) => {}
                        Err(_) => warn!(source = name, "cache read timed out, treated as miss"),
                    }
                    let live = tokio::time::timeout(timeout, src.fetch_live())
                        .await
                        .map_err(|_| SourceError::Timeout(name, timeout))??
                        .with_origin(DataOrigin::Live);
                    // memory tier ditulis di poll pertama; tier lambat dapat sisa waktu
                    let writes = async {
                        tokio::join!(
                            cache.set(key, &live, Some(src.ttl())),
                            cache.set(last_good, &live, Some(LAST_GOOD_TTL)),
                        )
                    };
                    if tokio::time::timeout(timeout, writes).await.is_err() {
                        warn!(source = name, "cache write timed out");
                    }
                    Ok::<_, SourceError>(live)
                },
                None,
            )
            .await;

        let snap = match res {
            Ok(s) => s,
            Err(BreakerError::Open(_)) => {
                debug!(source = name, "circuit open, serving fallback");
                self.fallback::<S>(name).await
            }
            Err(BreakerError::Inner(e)) => {
                warn!(source = name, error = %e, "source fetch failed, serving fallback");
                self.fallback::<S>(name).await
            }
        };

        SOURCE_LATENCY.observe(started.elapsed().as_secs_f64() * 1000.0);
        SOURCE_FETCH
            .with_label_values(&[name, snap.origin().as_str()])
            .inc();
        snap
    }

    async fn fallback<S>(&self, name: &'static str) -> S::Snapshot
    where
        S: SourceAdapter + ?Sized,
    {
        let key = cache_key(name, "last_good");
        match tokio::time::timeout(self.timeout, self.cache.get::<S::Snapshot>(&key)).await {
            Ok(Some(s)) => s.with_origin(DataOrigin::Stale),
            _ => <S::Snapshot as Default>::default().with_origin(DataOrigin::Default),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable adapters shared by the aggregator/scheduler tests.
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    pub struct Scripted<T> {
        pub name: &'static str,
        pub value: Mutex<Option<T>>,
        pub delay: Duration,
        pub calls: AtomicU32,
    }

    impl<T> Scripted<T> {
        pub fn ok(name: &'static str, value: T) -> Self {
            Self { name, value: Mutex::new(Some(value)), delay: Duration::ZERO, calls: AtomicU32::new(0) }
        }

        pub fn failing(name: &'static str) -> Self {
            Self { name, value: Mutex::new(None), delay: Duration::ZERO, calls: AtomicU32::new(0) }
        }

        pub fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl<T> SourceAdapter for Scripted<T>
    where
        T: Sourced + Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static,
    {
        type Snapshot = T;

        fn name(&self) -> &'static str {
            self.name
        }

        fn ttl(&self) -> Duration {
            // 0 -> memory tier effectively never serves it, every call goes live
            Duration::ZERO
        }

        async fn fetch_live(&self) -> Result<T, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let v = self.value.lock().clone();
            v.ok_or(SourceError::Unavailable(self.name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::Scripted;
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::cache::{CacheError, CacheTier, MemoryTier, TierEntry};

    /// Redis-like tier that never answers in time.
    struct HangingTier;

    #[async_trait]
    impl CacheTier for HangingTier {
        fn name(&self) -> &'static str {
            "hanging"
        }
        async fn get(&self, _key: &str) -> Result<Option<TierEntry>, CacheError> {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok(None)
        }
        async fn set(&self, _key: &str, _payload: &str, _ttl: Duration) -> Result<(), CacheError> {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok(())
        }
        async fn delete(&self, _key: &str) -> Result<(), CacheError> {
            Ok(())
        }
        async fn clear(&self) -> Result<(), CacheError> {
            Ok(())
        }
    }

    fn guard(threshold: u32, timeout: Duration) -> SourceGuard {
        let cache = Arc::new(TieredCache::new(
            Some(MemoryTier::new(64)),
            Vec::new(),
            Duration::from_secs(60),
        ));
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            ..Default::default()
        }));
        SourceGuard::new(cache, breaker, timeout)
    }

    #[tokio::test]
    async fn live_then_stale_after_failure() {
        let g = guard(5, Duration::from_secs(1));
        let src = Scripted::ok(LEDGER, LedgerSnapshot { collected: 10.0, ..Default::default() });

        let first = g.fetch(&src).await;
        assert_eq!(first.origin, DataOrigin::Live);
        assert_eq!(first.collected, 10.0);

        *src.value.lock() = None;
        let second = g.fetch(&src).await;
        assert_eq!(second.origin, DataOrigin::Stale);
        assert_eq!(second.collected, 10.0);
    }

    #[tokio::test]
    async fn no_history_falls_back_to_default() {
        let g = guard(5, Duration::from_secs(1));
        let src = Scripted::<BillingSnapshot>::failing(BILLING);
        let snap = g.fetch(&src).await;
        assert_eq!(snap.origin, DataOrigin::Default);
        assert_eq!(snap.daily_spend, 0.0);
    }

    #[tokio::test]
    async fn slow_source_is_abandoned_at_timeout() {
        let g = guard(5, Duration::from_millis(50));
        let src = Scripted::ok(TRADING, TradingSnapshot { pnl: 1.0, ..Default::default() })
            .slow(Duration::from_secs(5));

        let started = Instant::now();
        let snap = g.fetch(&src).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(snap.origin, DataOrigin::Default);
    }

    #[tokio::test]
    async fn hung_cache_tier_does_not_stall_source() {
        // tier timeout (1s default) jauh di atas timeout sumber
        let cache = Arc::new(TieredCache::new(
            Some(MemoryTier::new(64)),
            vec![Box::new(HangingTier)],
            Duration::from_secs(60),
        ));
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
        let g = SourceGuard::new(cache, breaker.clone(), Duration::from_millis(50));
        let src = Scripted::ok(LEDGER, LedgerSnapshot { collected: 10.0, ..Default::default() });

        let started = Instant::now();
        let snap = g.fetch(&src).await;
        assert!(started.elapsed() < Duration::from_millis(500), "{:?}", started.elapsed());
        assert_eq!(snap.origin, DataOrigin::Live);
        assert_eq!(snap.collected, 10.0);
        assert_eq!(breaker.failure_count(LEDGER), 0);

        // last_good sudah ada di memory walau tier lambat macet
        *src.value.lock() = None;
        let started = Instant::now();
        let snap = g.fetch(&src).await;
        assert!(started.elapsed() < Duration::from_millis(500), "{:?}", started.elapsed());
        assert_eq!(snap.origin, DataOrigin::Stale);
        assert_eq!(snap.collected, 10.0);
    }

    #[tokio::test]
    async fn open_circuit_stops_calling_source() {
        let g = guard(2, Duration::from_secs(1));
        let src = Scripted::<TradingSnapshot>::failing(TRADING);
        for _ in 0..5 {
            let _ = g.fetch(&src).await;
        }
        assert_eq!(src.calls(), 2);
    }

    #[tokio::test]
    async fn cached_value_is_marked() {
        let g = guard(5, Duration::from_secs(1));
        let snap = BillingSnapshot { daily_spend: 4.2, origin: DataOrigin::Live, ..Default::default() };
        g.cache.set(&cache_key(BILLING, "data"), &snap, None).await;

        let src = Scripted::<BillingSnapshot>::failing(BILLING);
        let got = g.fetch(&src).await;
        assert_eq!(got.origin, DataOrigin::Cache);
        assert_eq!(got.daily_spend, 4.2);
        assert_eq!(src.calls(), 0);
    }
}
