// ===============================
// src/sources/trading.rs
// ===============================
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{de::DeserializeOwned, Deserialize};
use sha2::Sha256;
use tracing::debug;
use url::Url;

use super::{SourceAdapter, SourceError, TRADING};
use crate::config::SourceCfg;
use crate::domain::{now_iso, round2, DataOrigin, TradingSnapshot};

pub fn timestamp_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Hex HMAC-SHA256 over `{ts}{METHOD}{path}`.
pub fn sign_request(secret: &str, ts: i64, method: &str, path: &str) -> String {
    // HMAC menerima key sepanjang apa pun, jadi new_from_slice tidak gagal
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return String::new(),
    };
    mac.update(format!("{ts}{method}{path}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[derive(Debug, Default, Deserialize)]
struct BalanceResp {
    #[serde(default)]
    balance_cents: i64,
}

#[derive(Debug, Default, Deserialize)]
struct PositionRow {
    #[serde(default)]
    pnl_cents: i64,
}

#[derive(Debug, Default, Deserialize)]
struct PositionsResp {
    #[serde(default)]
    positions: Vec<PositionRow>,
}

/// Live trading venue (REST). Amounts arrive in cents.
pub struct TradingVenue {
    http: reqwest::Client,
    base: Url,
    api_key: Option<String>,
    api_secret: Option<String>,
    ttl: Duration,
}

impl TradingVenue {
    pub fn new(http: reqwest::Client, cfg: &SourceCfg) -> Result<Self, SourceError> {
        // trailing slash supaya Url::join tidak membuang segmen terakhir
        let mut base = cfg.url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        Ok(Self {
            http,
            base: Url::parse(&base)?,
            api_key: cfg.api_key.clone(),
            api_secret: cfg.api_secret.clone(),
            ttl: cfg.ttl,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T, SourceError> {
        let mut url = self.base.join(path)?;
        if !params.is_empty() {
            let query = params
                .iter()
                .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            url.set_query(Some(&query));
        }

        let mut req = self.http.get(url.clone());
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        if let Some(secret) = &self.api_secret {
            let ts = timestamp_ms();
            let sig = sign_request(secret, ts, "GET", url.path());
            req = req
                .header("X-TIMESTAMP", ts.to_string())
                .header("X-SIGNATURE", sig);
        }

        let rsp = req.send().await?;
        let status = rsp.status();
        if !status.is_success() {
            let body = rsp.text().await.unwrap_or_default();
            return Err(SourceError::Status { name: TRADING, status: status.as_u16(), body });
        }
        debug!(%url, %status, "trading venue response");
        Ok(rsp.json::<T>().await?)
    }
}

#[async_trait]
impl SourceAdapter for TradingVenue {
    type Snapshot = TradingSnapshot;

    fn name(&self) -> &'static str {
        TRADING
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn fetch_live(&self) -> Result<TradingSnapshot, SourceError> {
        let (balance, positions) = tokio::try_join!(
            self.get_json::<BalanceResp>("portfolio/balance", &[]),
            self.get_json::<PositionsResp>("portfolio/positions", &[("limit", "200")]),
        )?;
        Ok(snapshot_from(balance, positions))
    }
}

fn snapshot_from(balance: BalanceResp, positions: PositionsResp) -> TradingSnapshot {
    let pnl_cents: i64 = positions.positions.iter().map(|p| p.pnl_cents).sum();
    TradingSnapshot {
        balance: round2(balance.balance_cents as f64 / 100.0),
        positions: positions.positions.len() as u32,
        pnl: round2(pnl_cents as f64 / 100.0),
        fetched_at: now_iso(),
        origin: DataOrigin::Live,
    }
}
