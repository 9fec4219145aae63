// ===============================
// src/sources/mock.rs
// ===============================
//
// Generator lokal, dipakai saat *_MODE=mock (default). Trading P&L jalan
// random-walk per panggilan; billing dan ledger hampir konstan.
//
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;

use super::{SourceAdapter, SourceError, BILLING, LEDGER, TRADING};
use crate::domain::{now_iso, round2, BillingSnapshot, DataOrigin, LedgerSnapshot, TradingSnapshot};

pub struct MockTrading {
    // cents
    pnl: Mutex<i64>,
    ttl: Duration,
}

impl MockTrading {
    pub fn new(ttl: Duration) -> Self {
        Self { pnl: Mutex::new(500_000), ttl }
    }
}

#[async_trait]
impl SourceAdapter for MockTrading {
    type Snapshot = TradingSnapshot;

    fn name(&self) -> &'static str {
        TRADING
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn fetch_live(&self) -> Result<TradingSnapshot, SourceError> {
        // jangan simpan ThreadRng melewati .await
        let step = rand::thread_rng().gen_range(-2_500..=2_500);
        let pnl = {
            let mut p = self.pnl.lock();
            *p += step;
            *p
        };
        Ok(TradingSnapshot {
            balance: 25_000.0,
            positions: 4,
            pnl: round2(pnl as f64 / 100.0),
            fetched_at: now_iso(),
            origin: DataOrigin::Live,
        })
    }
}

pub struct MockBilling {
    ttl: Duration,
}

impl MockBilling {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }
}

#[async_trait]
impl SourceAdapter for MockBilling {
    type Snapshot = BillingSnapshot;

    fn name(&self) -> &'static str {
        BILLING
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn fetch_live(&self) -> Result<BillingSnapshot, SourceError> {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..5.0);
        Ok(BillingSnapshot {
            daily_spend: round2(150.0 + jitter),
            fetched_at: now_iso(),
            origin: DataOrigin::Live,
        })
    }
}

pub struct MockLedger {
    ttl: Duration,
}

impl MockLedger {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }
}

#[async_trait]
impl SourceAdapter for MockLedger {
    type Snapshot = LedgerSnapshot;

    fn name(&self) -> &'static str {
        LEDGER
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn fetch_live(&self) -> Result<LedgerSnapshot, SourceError> {
        Ok(LedgerSnapshot {
            invoiced: 12_000.0,
            collected: 10_000.0,
            fetched_at: now_iso(),
            origin: DataOrigin::Live,
        })
    }
}
