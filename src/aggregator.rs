// ===============================
// src/aggregator.rs
// ===============================
//
// Satu siklus agregasi:
//   1) fetch trading/billing/ledger paralel (task terpisah, lewat SourceGuard)
//   2) hitung revenue / expenses / netPnL / grossMargin
//   3) append ke history (FIFO) + window trend dalam satu write-lock
//   4) cache `pnl:current`
//
// Siklus diserialkan; pemanggil yang menunggu di belakang siklus yang mulai
// setelah permintaannya memakai hasil siklus itu (coalescing).
//
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{debug, error, info};

use crate::cache::TieredCache;
use crate::domain::{now_iso, window_trend, Breakdown, Components, HistoryPage, PnLMetrics};
use crate::metrics::{AGG_CYCLES, PNL_EXPENSES, PNL_NET, PNL_REVENUE};
use crate::sources::{SourceGuard, Sources};

pub const CURRENT_KEY: &str = "pnl:current";

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("source task failed: {0}")]
    Task(#[from] JoinError),
    #[error("non-finite metrics (revenue={revenue}, expenses={expenses})")]
    NonFinite { revenue: f64, expenses: f64 },
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub history_size: usize,
    pub snapshot_ttl: Duration,
}

pub struct Aggregator {
    sources: Sources,
    guard: SourceGuard,
    cache: Arc<TieredCache>,
    cfg: AggregatorConfig,
    history: RwLock<VecDeque<PnLMetrics>>,
    cycle: tokio::sync::Mutex<()>,
    started: AtomicU64,
    // (generation, result) of the newest successful cycle
    last_ok: Mutex<Option<(u64, PnLMetrics)>>,
}

impl Aggregator {
    pub fn new(
        sources: Sources,
        guard: SourceGuard,
        cache: Arc<TieredCache>,
        cfg: AggregatorConfig,
    ) -> Self {
        Self {
            sources,
            guard,
            cache,
            history: RwLock::new(VecDeque::with_capacity(cfg.history_size)),
            cfg,
            cycle: tokio::sync::Mutex::new(()),
            started: AtomicU64::new(0),
            last_ok: Mutex::new(None),
        }
    }

    /// Run (or join) an aggregation cycle. Errors only on unexpected failure;
    /// source outages are absorbed by the fallbacks.
    pub async fn try_snapshot(&self) -> Result<PnLMetrics, AggregateError> {
        let requested = self.started.load(Ordering::SeqCst);
        let _cycle = self.cycle.lock().await;

        let joined = self
            .last_ok
            .lock()
            .as_ref()
            .filter(|(gen, _)| *gen > requested)
            .map(|(_, m)| m.clone());
        if let Some(m) = joined {
            AGG_CYCLES.with_label_values(&["coalesced"]).inc();
            return Ok(m);
        }

        let gen = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        match self.run_cycle().await {
            Ok(m) => {
                *self.last_ok.lock() = Some((gen, m.clone()));
                AGG_CYCLES.with_label_values(&["ok"]).inc();
                Ok(m)
            }
            Err(e) => {
                AGG_CYCLES.with_label_values(&["failed"]).inc();
                Err(e)
            }
        }
    }

    /// Never fails: cached `pnl:current`, lalu snapshot nol.
    pub async fn get_snapshot(&self) -> PnLMetrics {
        match self.try_snapshot().await {
            Ok(m) => m,
            Err(e) => {
                error!(error = %e, "aggregation failed, serving last good snapshot");
                match self.cache.get::<PnLMetrics>(CURRENT_KEY).await {
                    Some(m) => m,
                    None => PnLMetrics::zeroed(),
                }
            }
        }
    }

    /// Newest `limit` entries, oldest first.
    pub fn get_history(&self, limit: usize) -> HistoryPage {
        let h = self.history.read();
        let skip = h.len().saturating_sub(limit);
        let data: Vec<PnLMetrics> = h.iter().skip(skip).cloned().collect();
        HistoryPage { count: data.len(), data, timestamp: now_iso() }
    }

    /// Derived from the newest snapshot, so it matches `get_snapshot`.
    pub async fn get_component_breakdown(&self) -> Breakdown {
        match self.latest() {
            Some(m) => Breakdown::from(&m),
            None => Breakdown::from(&self.get_snapshot().await),
        }
    }

    pub fn latest(&self) -> Option<PnLMetrics> {
        self.history.read().back().cloned()
    }

    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }

    async fn run_cycle(&self) -> Result<PnLMetrics, AggregateError> {
        let trading = {
            let (g, s) = (self.guard.clone(), self.sources.trading.clone());
            tokio::spawn(async move { g.fetch(s.as_ref()).await })
        };
        let billing = {
            let (g, s) = (self.guard.clone(), self.sources.billing.clone());
            tokio::spawn(async move { g.fetch(s.as_ref()).await })
        };
        let ledger = {
            let (g, s) = (self.guard.clone(), self.sources.ledger.clone());
            tokio::spawn(async move { g.fetch(s.as_ref()).await })
        };
        let (trading, billing, ledger) = tokio::try_join!(trading, billing, ledger)?;

        let mut m = PnLMetrics::compute(Components { trading, billing, ledger });
        if !m.is_finite() {
            return Err(AggregateError::NonFinite {
                revenue: m.total_revenue,
                expenses: m.total_expenses,
            });
        }

        {
            let mut h = self.history.write();
            h.push_back(m.clone());
            while h.len() > self.cfg.history_size {
                h.pop_front();
            }
            let trend = match (h.front(), h.back()) {
                (Some(oldest), Some(newest)) if h.len() >= 2 => {
                    window_trend(oldest.net_pnl, newest.net_pnl)
                }
                _ => 0.0,
            };
            m.daily_trend = trend;
            if let Some(newest) = h.back_mut() {
                newest.daily_trend = trend;
            }
        }

        self.cache.set(CURRENT_KEY, &m, Some(self.cfg.snapshot_ttl)).await;

        PNL_REVENUE.set(m.total_revenue);
        PNL_EXPENSES.set(m.total_expenses);
        PNL_NET.set(m.net_pnl);
        debug!(
            revenue = m.total_revenue,
            expenses = m.total_expenses,
            net = m.net_pnl,
            trend = m.daily_trend,
            "aggregation cycle done"
        );
        Ok(m)
    }
}

/// Log sekali saat startup.
pub fn log_config(cfg: &AggregatorConfig) {
    info!(
        history_size = cfg.history_size,
        snapshot_ttl_ms = cfg.snapshot_ttl.as_millis() as u64,
        "aggregator ready"
    );
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, CircuitBreaker};
    use crate::cache::MemoryTier;
    use crate::domain::{BillingSnapshot, DataOrigin, LedgerSnapshot, TradingSnapshot};
    use crate::sources::testing::Scripted;
    use crate::sources::{BILLING, LEDGER, TRADING};

    pub(crate) struct Rig {
        pub agg: Arc<Aggregator>,
        pub trading: Arc<Scripted<TradingSnapshot>>,
        pub billing: Arc<Scripted<BillingSnapshot>>,
        pub ledger: Arc<Scripted<LedgerSnapshot>>,
    }

    pub(crate) fn rig_with(
        trading: Scripted<TradingSnapshot>,
        billing: Scripted<BillingSnapshot>,
        ledger: Scripted<LedgerSnapshot>,
        history_size: usize,
    ) -> Rig {
        let cache = Arc::new(TieredCache::new(
            Some(MemoryTier::new(64)),
            Vec::new(),
            Duration::from_secs(60),
        ));
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
        let guard = SourceGuard::new(cache.clone(), breaker, Duration::from_secs(1));
        let (trading, billing, ledger) = (Arc::new(trading), Arc::new(billing), Arc::new(ledger));
        let sources = Sources {
            trading: trading.clone(),
            billing: billing.clone(),
            ledger: ledger.clone(),
        };
        let agg = Arc::new(Aggregator::new(
            sources,
            guard,
            cache,
            AggregatorConfig { history_size, snapshot_ttl: Duration::from_secs(60) },
        ));
        Rig { agg, trading, billing, ledger }
    }

    pub(crate) fn scenario_rig(history_size: usize) -> Rig {
        rig_with(
            Scripted::ok(TRADING, TradingSnapshot { pnl: 5000.0, ..Default::default() }),
            Scripted::ok(BILLING, BillingSnapshot { daily_spend: 150.0, ..Default::default() }),
            Scripted::ok(LEDGER, LedgerSnapshot { collected: 10000.0, ..Default::default() }),
            history_size,
        )
    }

    fn set_trading_pnl(r: &Rig, pnl: f64) {
        *r.trading.value.lock() = Some(TradingSnapshot { pnl, ..Default::default() });
    }

    fn zero_costs(history_size: usize) -> Rig {
        rig_with(
            Scripted::ok(TRADING, TradingSnapshot::default()),
            Scripted::ok(BILLING, BillingSnapshot::default()),
            Scripted::ok(LEDGER, LedgerSnapshot::default()),
            history_size,
        )
    }

    #[tokio::test]
    async fn scenario_numbers() {
        let r = scenario_rig(10);
        let m = r.agg.get_snapshot().await;
        assert_eq!(m.total_revenue, 15000.0);
        assert_eq!(m.total_expenses, 150.0);
        assert_eq!(m.net_pnl, 14850.0);
        assert_eq!(m.gross_margin, 99.0);
        assert_eq!(m.components.trading.origin, DataOrigin::Live);
        assert_eq!(m.daily_trend, 0.0);
    }

    #[tokio::test]
    async fn total_outage_is_zeroed_not_an_error() {
        let r = rig_with(
            Scripted::failing(TRADING),
            Scripted::failing(BILLING),
            Scripted::failing(LEDGER),
            10,
        );
        let m = r.agg.try_snapshot().await.unwrap();
        assert_eq!(m.total_revenue, 0.0);
        assert_eq!(m.total_expenses, 0.0);
        assert_eq!(m.net_pnl, 0.0);
        assert_eq!(m.gross_margin, 0.0);
        assert_eq!(m.components.billing.origin, DataOrigin::Default);
        assert_eq!(r.billing.calls(), 1);
        assert_eq!(r.ledger.calls(), 1);
    }

    #[tokio::test]
    async fn trading_outage_keeps_other_sources_live() {
        let r = rig_with(
            Scripted::failing(TRADING),
            Scripted::ok(BILLING, BillingSnapshot { daily_spend: 150.0, ..Default::default() }),
            Scripted::ok(LEDGER, LedgerSnapshot { collected: 10000.0, ..Default::default() }),
            10,
        );
        let m = r.agg.try_snapshot().await.unwrap();
        assert_eq!(m.components.trading.origin, DataOrigin::Default);
        assert_eq!(m.components.billing.origin, DataOrigin::Live);
        assert_eq!(m.components.ledger.origin, DataOrigin::Live);
        assert_eq!(m.components.ledger.collected, 10000.0);
        assert_eq!(m.total_revenue, 10000.0);
        assert_eq!(m.net_pnl, 9850.0);
    }

    #[tokio::test]
    async fn hung_trading_source_costs_one_timeout() {
        // guard timeout di rig = 1s
        let r = rig_with(
            Scripted::ok(TRADING, TradingSnapshot { pnl: 5000.0, ..Default::default() })
                .slow(Duration::from_secs(5)),
            Scripted::ok(BILLING, BillingSnapshot { daily_spend: 150.0, ..Default::default() }),
            Scripted::ok(LEDGER, LedgerSnapshot { collected: 10000.0, ..Default::default() }),
            10,
        );
        let started = std::time::Instant::now();
        let m = r.agg.try_snapshot().await.unwrap();
        let took = started.elapsed();
        assert!(took >= Duration::from_millis(900) && took < Duration::from_secs(2), "{took:?}");

        assert_eq!(m.components.trading.origin, DataOrigin::Default);
        assert_eq!(m.components.billing.origin, DataOrigin::Live);
        assert_eq!(m.components.ledger.collected, 10000.0);
        assert_eq!(m.total_revenue, 10000.0);
        assert_eq!(m.total_expenses, 150.0);
    }

    #[tokio::test]
    async fn history_is_capped_fifo() {
        let r = zero_costs(3);
        for pnl in [1.0, 2.0, 3.0, 4.0, 5.0] {
            set_trading_pnl(&r, pnl);
            r.agg.get_snapshot().await;
        }
        let page = r.agg.get_history(10);
        assert_eq!(page.count, 3);
        let nets: Vec<f64> = page.data.iter().map(|m| m.net_pnl).collect();
        assert_eq!(nets, vec![3.0, 4.0, 5.0]);

        let tail = r.agg.get_history(2);
        assert_eq!(tail.data.iter().map(|m| m.net_pnl).collect::<Vec<_>>(), vec![4.0, 5.0]);
        assert_eq!(r.agg.get_history(0).count, 0);
    }

    #[tokio::test]
    async fn trend_spans_retained_window() {
        let r = zero_costs(10);
        set_trading_pnl(&r, 100.0);
        assert_eq!(r.agg.get_snapshot().await.daily_trend, 0.0);
        set_trading_pnl(&r, 150.0);
        let m = r.agg.get_snapshot().await;
        assert_eq!(m.daily_trend, 50.0);
        assert_eq!(r.agg.latest().unwrap().daily_trend, 50.0);
    }

    #[tokio::test]
    async fn concurrent_callers_are_consistent_and_coalesced() {
        let r = rig_with(
            Scripted::ok(TRADING, TradingSnapshot { pnl: 5000.0, ..Default::default() })
                .slow(Duration::from_millis(20)),
            Scripted::ok(BILLING, BillingSnapshot { daily_spend: 150.0, ..Default::default() }),
            Scripted::ok(LEDGER, LedgerSnapshot { collected: 10000.0, ..Default::default() }),
            100,
        );

        let mut handles = Vec::new();
        for _ in 0..50 {
            let agg = r.agg.clone();
            handles.push(tokio::spawn(async move { agg.get_snapshot().await }));
        }
        for h in handles {
            let m = h.await.unwrap();
            assert_eq!(m.net_pnl, 14850.0);
            assert!((m.net_pnl - (m.total_revenue - m.total_expenses)).abs() < 0.01);
        }
        assert!(r.trading.calls() < 50);
        assert_eq!(r.agg.history_len() as u32, r.trading.calls());
    }

    #[tokio::test]
    async fn failure_serves_cached_snapshot() {
        let r = zero_costs(10);
        set_trading_pnl(&r, 100.0);
        let good = r.agg.get_snapshot().await;

        set_trading_pnl(&r, f64::NAN);
        assert!(matches!(
            r.agg.try_snapshot().await,
            Err(AggregateError::NonFinite { .. })
        ));
        let served = r.agg.get_snapshot().await;
        assert_eq!(served.net_pnl, good.net_pnl);
        assert_eq!(served.calculated_at, good.calculated_at);
        // failed cycles are not appended
        assert_eq!(r.agg.history_len(), 1);
    }

    #[tokio::test]
    async fn failure_without_cache_is_zeroed() {
        let r = zero_costs(10);
        set_trading_pnl(&r, f64::INFINITY);
        let m = r.agg.get_snapshot().await;
        assert_eq!(m.net_pnl, 0.0);
        assert!(m.is_finite());
    }

    #[tokio::test]
    async fn breakdown_matches_latest_snapshot() {
        let r = scenario_rig(10);
        // empty history -> computes one
        let b = r.agg.get_component_breakdown().await;
        assert_eq!(b.summary.net_pnl, 14850.0);
        assert_eq!(r.agg.history_len(), 1);

        let m = r.agg.latest().unwrap();
        let b = r.agg.get_component_breakdown().await;
        assert_eq!(b.calculated_at, m.calculated_at);
        assert_eq!(b.billing, m.components.billing);
        assert_eq!(r.agg.history_len(), 1);
    }
}
