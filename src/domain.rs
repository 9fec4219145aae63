// ===============================
// src/domain.rs
// ===============================
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Round to 2 decimals (currency)
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Asal data sebuah snapshot sumber
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataOrigin {
    Live,
    Cache,
    Stale,
    #[default]
    Default,
}

impl DataOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataOrigin::Live => "live",
            DataOrigin::Cache => "cache",
            DataOrigin::Stale => "stale",
            DataOrigin::Default => "default",
        }
    }
}

// ---- Source snapshots ----

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradingSnapshot {
    pub balance: f64,
    pub positions: u32,
    pub pnl: f64,
    pub fetched_at: String,
    pub origin: DataOrigin,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingSnapshot {
    pub daily_spend: f64,
    pub fetched_at: String,
    pub origin: DataOrigin,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSnapshot {
    pub invoiced: f64,
    pub collected: f64,
    pub fetched_at: String,
    pub origin: DataOrigin,
}

/// Snapshot mentah ketiga sumber (audit trail, tidak diubah)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Components {
    pub trading: TradingSnapshot,
    pub billing: BillingSnapshot,
    pub ledger: LedgerSnapshot,
}

// ---- Aggregate ----

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PnLMetrics {
    pub total_revenue: f64,
    pub total_expenses: f64,
    #[serde(rename = "netPnL")]
    pub net_pnl: f64,
    pub gross_margin: f64,
    /// Window trend: newest vs oldest retained history entry (%).
    pub daily_trend: f64,
    pub components: Components,
    pub timestamp: String,
    pub calculated_at: i64,
}

impl PnLMetrics {
    /// Hitung metrik dari tiga snapshot sumber. `daily_trend` diisi belakangan
    /// oleh aggregator karena butuh history.
    pub fn compute(components: Components) -> Self {
        let total_revenue = round2(components.trading.pnl + components.ledger.collected);
        let total_expenses = round2(components.billing.daily_spend);
        let net_pnl = round2(total_revenue - total_expenses);
        Self {
            total_revenue,
            total_expenses,
            net_pnl,
            gross_margin: gross_margin(total_revenue, net_pnl),
            daily_trend: 0.0,
            components,
            timestamp: now_iso(),
            calculated_at: now_ms(),
        }
    }

    /// Zeroed snapshot served when nothing else is available.
    pub fn zeroed() -> Self {
        Self {
            timestamp: now_iso(),
            calculated_at: now_ms(),
            ..Default::default()
        }
    }

    pub fn is_finite(&self) -> bool {
        [
            self.total_revenue,
            self.total_expenses,
            self.net_pnl,
            self.gross_margin,
            self.daily_trend,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

pub fn gross_margin(total_revenue: f64, net_pnl: f64) -> f64 {
    if total_revenue == 0.0 {
        return 0.0;
    }
    round2(net_pnl / total_revenue * 100.0)
}

/// Percentage change between the oldest and newest retained net P&L.
pub fn window_trend(oldest_net: f64, newest_net: f64) -> f64 {
    if oldest_net == 0.0 {
        return if newest_net > 0.0 { 100.0 } else { 0.0 };
    }
    round2((newest_net - oldest_net) / oldest_net.abs() * 100.0)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakdownSummary {
    pub total_revenue: f64,
    pub total_expenses: f64,
    #[serde(rename = "netPnL")]
    pub net_pnl: f64,
    pub gross_margin: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Breakdown {
    pub trading: TradingSnapshot,
    pub billing: BillingSnapshot,
    pub ledger: LedgerSnapshot,
    pub summary: BreakdownSummary,
    /// `calculatedAt` of the snapshot this was derived from
    pub calculated_at: i64,
    pub timestamp: String,
}

impl From<&PnLMetrics> for Breakdown {
    fn from(m: &PnLMetrics) -> Self {
        Self {
            trading: m.components.trading.clone(),
            billing: m.components.billing.clone(),
            ledger: m.components.ledger.clone(),
            summary: BreakdownSummary {
                total_revenue: m.total_revenue,
                total_expenses: m.total_expenses,
                net_pnl: m.net_pnl,
                gross_margin: m.gross_margin,
            },
            calculated_at: m.calculated_at,
            timestamp: now_iso(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub count: usize,
    pub data: Vec<PnLMetrics>,
    pub timestamp: String,
}

// ---- Push protocol ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushSource {
    Initial,
    Stream,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Push<T> {
    pub data: T,
    pub timestamp: String,
    pub source: PushSource,
}

impl<T> Push<T> {
    pub fn new(data: T, source: PushSource) -> Self {
        Self { data, timestamp: now_iso(), source }
    }
}

/// Pesan keluar ke client (didrain oleh transport adapter)
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Outbound {
    Connected {
        #[serde(rename = "clientId")]
        client_id: u64,
        timestamp: String,
    },
    PnlUpdate(Push<PnLMetrics>),
    ComponentsUpdate(Push<Breakdown>),
    History(HistoryPage),
    StreamError { message: String, timestamp: String },
    Error { message: String, timestamp: String },
}

impl Outbound {
    pub fn error(message: impl Into<String>) -> Self {
        Outbound::Error { message: message.into(), timestamp: now_iso() }
    }

    pub fn stream_error(message: impl Into<String>) -> Self {
        Outbound::StreamError { message: message.into(), timestamp: now_iso() }
    }
}

/// Journal event (JSONL)
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Snapshot(PnLMetrics),
    CycleFailed { message: String, timestamp: String },
}
