// ===============================
// src/sources/billing.rs
// ===============================
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use super::{SourceAdapter, SourceError, BILLING};
use crate::config::SourceCfg;
use crate::domain::{now_iso, round2, BillingSnapshot, DataOrigin};

#[derive(Debug, Default, Deserialize)]
struct UsageResp {
    #[serde(default, alias = "dailySpend")]
    daily_spend: f64,
}

/// LLM usage billing endpoint, reports today's spend.
pub struct BillingApi {
    http: reqwest::Client,
    url: Url,
    api_key: Option<String>,
    ttl: Duration,
}

impl BillingApi {
    pub fn new(http: reqwest::Client, cfg: &SourceCfg) -> Result<Self, SourceError> {
        Ok(Self {
            http,
            url: Url::parse(&cfg.url)?,
            api_key: cfg.api_key.clone(),
            ttl: cfg.ttl,
        })
    }
}

#[async_trait]
impl SourceAdapter for BillingApi {
    type Snapshot = BillingSnapshot;

    fn name(&self) -> &'static str {
        BILLING
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn fetch_live(&self) -> Result<BillingSnapshot, SourceError> {
        let mut req = self.http.get(self.url.clone());
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }
        let rsp = req.send().await?;
        let status = rsp.status();
        if !status.is_success() {
            let body = rsp.text().await.unwrap_or_default();
            return Err(SourceError::Status { name: BILLING, status: status.as_u16(), body });
        }
        let usage: UsageResp = rsp.json().await?;
        Ok(BillingSnapshot {
            daily_spend: round2(usage.daily_spend),
            fetched_at: now_iso(),
            origin: DataOrigin::Live,
        })
    }
}
