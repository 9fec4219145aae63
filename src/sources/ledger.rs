// ===============================
// src/sources/ledger.rs
// ===============================
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use super::{SourceAdapter, SourceError, LEDGER};
use crate::config::SourceCfg;
use crate::domain::{now_iso, round2, DataOrigin, LedgerSnapshot};

#[derive(Debug, Default, Deserialize)]
struct LedgerResp {
    #[serde(default)]
    invoiced: f64,
    #[serde(default)]
    collected: f64,
}

pub struct LedgerApi {
    http: reqwest::Client,
    url: Url,
    api_key: Option<String>,
    ttl: Duration,
}

impl LedgerApi {
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
impl SourceAdapter for LedgerApi {
    type Snapshot = LedgerSnapshot;

    fn name(&self) -> &'static str {
        LEDGER
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn fetch_live(&self) -> Result<LedgerSnapshot, SourceError> {
        let mut req = self.http.get(self.url.clone());
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let rsp = req.send().await?;
        let status = rsp.status();
        if !status.is_success() {
            let body = rsp.text().await.unwrap_or_default();
            return Err(SourceError::Status { name: LEDGER, status: status.as_u16(), body });
        }
        let body: LedgerResp = rsp.json().await?;
        Ok(LedgerSnapshot {
            invoiced: round2(body.invoiced),
            collected: round2(body.collected),
            fetched_at: now_iso(),
            origin: DataOrigin::Live,
        })
    }
}
