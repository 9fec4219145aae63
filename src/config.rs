// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : pnl_stream_rust — real-time P&L aggregation & streaming service
Module  : config.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Pulls trading venue P&L, LLM billing spend and ledger revenue,
          protects each source with a circuit breaker, caches results in
          memory / Redis / SQLite tiers, and streams net P&L to dashboards
          over WebSocket and a small HTTP API.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::breaker::BreakerConfig;
use crate::cache::CacheConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key}={value:?} is not a valid URL: {source}")]
    InvalidUrl {
        key: &'static str,
        value: String,
        source: url::ParseError,
    },
    #[error("{0} is required when the source runs in live mode")]
    MissingUrl(&'static str),
    #[error("env file {path}: {source}")]
    EnvFile { path: String, source: dotenvy::Error },
}

/// CLI overrides (di atas env / .env)
#[derive(Parser, Debug, Default, Clone)]
#[command(name = "pnl_stream_rust", version, about = "Real-time P&L aggregation & streaming")]
pub struct Cli {
    /// Load this file instead of ./.env
    #[arg(long)]
    pub env_file: Option<PathBuf>,
    #[arg(long)]
    pub http_port: Option<u16>,
    #[arg(long)]
    pub ws_port: Option<u16>,
    /// tracing filter, e.g. "info,pnl_stream_rust=debug"
    #[arg(long)]
    pub log_filter: Option<String>,
    /// Force every source to mock mode
    #[arg(long)]
    pub mock: bool,
}

/// Mode sumber data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceMode {
    Mock,
    Live,
}

impl SourceMode {
    pub fn parse(s: &str, default_mode: SourceMode) -> SourceMode {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => SourceMode::Mock,
            "live" | "real" => SourceMode::Live,
            _ => default_mode,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceMode::Mock => "mock",
            SourceMode::Live => "live",
        }
    }
}

#[derive(Clone, Debug)]
pub struct SourceCfg {
    pub mode: SourceMode,
    pub url: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub ttl: Duration,
}

#[derive(Clone, Debug)]
pub struct Args {
    // servers
    pub http_port: u16,
    pub ws_port: u16,

    // streaming / aggregation
    pub stream_interval: Duration,
    pub history_size: usize,
    pub snapshot_ttl: Duration,
    pub source_timeout: Duration,
    pub subscriber_buffer: usize,

    // journal
    pub record_file: Option<String>,

    pub cache: CacheConfig,
    pub breaker: BreakerConfig,

    pub trading: SourceCfg,
    pub billing: SourceCfg,
    pub ledger: SourceCfg,
}

/// Baca `.env` (atau `--env-file`), lalu environment.
pub fn load(cli: &Cli) -> Result<Args, ConfigError> {
    match &cli.env_file {
        Some(path) => {
            dotenvy::from_path(path).map_err(|source| ConfigError::EnvFile {
                path: path.display().to_string(),
                source,
            })?;
        }
        None => {
            let _ = dotenvy::dotenv();
        }
    }
    from_lookup(|k| env::var(k).ok(), cli)
}

fn parse_or<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    get(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn millis_or(get: &impl Fn(&str) -> Option<String>, key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(parse_or(get, key, default_ms))
}

/// TTL / timeout / interval ceiling; `Instant::now() + d` must never overflow.
pub const MAX_DURATION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

fn millis_within(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default_ms: u64,
    min: Duration,
) -> Duration {
    millis_or(get, key, default_ms).clamp(min, MAX_DURATION)
}

pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn flag_or(get: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    get(key).and_then(|s| parse_bool(&s)).unwrap_or(default)
}

fn non_empty(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    get(key).map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn source_cfg(
    get: &impl Fn(&str) -> Option<String>,
    prefix: &'static str,
    url_key: &'static str,
    default_ttl_ms: u64,
    force_mock: bool,
) -> Result<SourceCfg, ConfigError> {
    let mode = if force_mock {
        SourceMode::Mock
    } else {
        let raw = non_empty(get, &format!("{prefix}_MODE")).unwrap_or_default();
        SourceMode::parse(&raw, SourceMode::Mock)
    };
    let url = non_empty(get, url_key).unwrap_or_default();

    if mode == SourceMode::Live {
        if url.is_empty() {
            return Err(ConfigError::MissingUrl(url_key));
        }
        url::Url::parse(&url).map_err(|source| ConfigError::InvalidUrl {
            key: url_key,
            value: url.clone(),
            source,
        })?;
    }

    Ok(SourceCfg {
        mode,
        url,
        api_key: non_empty(get, &format!("{prefix}_API_KEY")),
        api_secret: non_empty(get, &format!("{prefix}_API_SECRET")),
        ttl: millis_within(get, &format!("{prefix}_TTL_MS"), default_ttl_ms, Duration::ZERO),
    })
}

pub fn from_lookup(get: impl Fn(&str) -> Option<String>, cli: &Cli) -> Result<Args, ConfigError> {
    // ===== Cache tiers =====
    let redis_url = flag_or(&get, "CACHE_ENABLE_REDIS", false).then(|| {
        non_empty(&get, "REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string())
    });
    let sqlite_path = flag_or(&get, "CACHE_ENABLE_SQLITE", false).then(|| {
        PathBuf::from(
            non_empty(&get, "CACHE_SQLITE_PATH").unwrap_or_else(|| "data/pnl-cache.db".to_string()),
        )
    });
    let cache = CacheConfig {
        default_ttl: millis_within(&get, "CACHE_DEFAULT_TTL_MS", 300_000, Duration::ZERO),
        tier_timeout: millis_within(&get, "CACHE_TIER_TIMEOUT_MS", 1_000, Duration::from_millis(1)),
        max_entries: parse_or(&get, "CACHE_MAX_ENTRIES", 1000),
        enable_memory: flag_or(&get, "CACHE_ENABLE_MEMORY", true),
        redis_url,
        sqlite_path,
        namespace: non_empty(&get, "CACHE_NAMESPACE").unwrap_or_else(|| "pnl".to_string()),
    };

    // ===== Breaker =====
    let breaker = BreakerConfig {
        failure_threshold: parse_or(&get, "BREAKER_FAILURE_THRESHOLD", 5u32).max(1),
        reset_timeout: millis_within(&get, "BREAKER_RESET_TIMEOUT_MS", 60_000, Duration::ZERO),
        sweep_interval: millis_within(
            &get,
            "BREAKER_SWEEP_INTERVAL_MS",
            5_000,
            Duration::from_millis(100),
        ),
    };

    // ===== Sources =====
    // TTL mengikuti volatilitas: trading 30s, ledger 5m, billing 1h
    let trading = source_cfg(&get, "TRADING", "TRADING_API_URL", 30_000, cli.mock)?;
    let billing = source_cfg(&get, "BILLING", "BILLING_API_URL", 3_600_000, cli.mock)?;
    let ledger = source_cfg(&get, "LEDGER", "LEDGER_API_URL", 300_000, cli.mock)?;

    Ok(Args {
        http_port: cli.http_port.unwrap_or_else(|| parse_or(&get, "HTTP_PORT", 3000)),
        ws_port: cli.ws_port.unwrap_or_else(|| parse_or(&get, "WS_PORT", 3001)),
        stream_interval: millis_within(&get, "STREAM_INTERVAL_MS", 5_000, Duration::from_millis(100)),
        history_size: parse_or(&get, "HISTORY_SIZE", 100usize).max(1),
        snapshot_ttl: millis_within(&get, "SNAPSHOT_TTL_MS", 60_000, Duration::ZERO),
        source_timeout: millis_within(&get, "SOURCE_TIMEOUT_MS", 5_000, Duration::from_millis(1)),
        subscriber_buffer: parse_or(&get, "SUBSCRIBER_BUFFER", 64usize).max(1),
        record_file: non_empty(&get, "RECORD_FILE"),
        cache,
        breaker,
        trading,
        billing,
        ledger,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::AHashMap as HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let a = from_lookup(lookup(&[]), &Cli::default()).unwrap();
        assert_eq!((a.http_port, a.ws_port), (3000, 3001));
        assert_eq!(a.stream_interval, Duration::from_secs(5));
        assert_eq!(a.history_size, 100);
        assert_eq!(a.trading.mode, SourceMode::Mock);
        assert_eq!(a.trading.ttl, Duration::from_secs(30));
        assert_eq!(a.billing.ttl, Duration::from_secs(3600));
        assert_eq!(a.ledger.ttl, Duration::from_secs(300));
        assert!(a.cache.enable_memory);
        assert!(a.cache.redis_url.is_none());
        assert!(a.cache.sqlite_path.is_none());
        assert_eq!(a.breaker.failure_threshold, 5);
        assert!(a.record_file.is_none());
    }

    #[test]
    fn env_values_and_cli_overrides() {
        let get = lookup(&[
            ("HTTP_PORT", "8080"),
            ("WS_PORT", "8081"),
            ("HISTORY_SIZE", "10"),
            ("CACHE_ENABLE_REDIS", "true"),
            ("CACHE_ENABLE_SQLITE", "1"),
            ("CACHE_SQLITE_PATH", "/tmp/x.db"),
            ("BREAKER_FAILURE_THRESHOLD", "3"),
            ("RECORD_FILE", "out/pnl.jsonl"),
        ]);
        let cli = Cli { ws_port: Some(9001), ..Default::default() };
        let a = from_lookup(get, &cli).unwrap();
        assert_eq!(a.http_port, 8080);
        assert_eq!(a.ws_port, 9001);
        assert_eq!(a.history_size, 10);
        assert_eq!(a.cache.redis_url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert_eq!(a.cache.sqlite_path, Some(PathBuf::from("/tmp/x.db")));
        assert_eq!(a.breaker.failure_threshold, 3);
        assert_eq!(a.record_file.as_deref(), Some("out/pnl.jsonl"));
    }

    #[test]
    fn live_source_needs_valid_url() {
        let err = from_lookup(lookup(&[("TRADING_MODE", "live")]), &Cli::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingUrl("TRADING_API_URL")));

        let err = from_lookup(
            lookup(&[("LEDGER_MODE", "live"), ("LEDGER_API_URL", "::nope")]),
            &Cli::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { key: "LEDGER_API_URL", .. }));

        let ok = from_lookup(
            lookup(&[("BILLING_MODE", "LIVE"), ("BILLING_API_URL", "https://billing.example/usage")]),
            &Cli::default(),
        )
        .unwrap();
        assert_eq!(ok.billing.mode, SourceMode::Live);
    }

    #[test]
    fn mock_flag_wins_over_env() {
        let cli = Cli { mock: true, ..Default::default() };
        let a = from_lookup(lookup(&[("TRADING_MODE", "live")]), &cli).unwrap();
        assert_eq!(a.trading.mode, SourceMode::Mock);
    }

    #[test]
    fn durations_are_clamped() {
        let get = lookup(&[
            ("BREAKER_SWEEP_INTERVAL_MS", "0"),
            ("STREAM_INTERVAL_MS", "0"),
            ("SOURCE_TIMEOUT_MS", "0"),
            ("CACHE_TIER_TIMEOUT_MS", "0"),
            ("BREAKER_RESET_TIMEOUT_MS", "18446744073709551615"),
            ("TRADING_TTL_MS", "18446744073709551615"),
            ("CACHE_DEFAULT_TTL_MS", "18446744073709551615"),
        ]);
        let a = from_lookup(get, &Cli::default()).unwrap();
        assert_eq!(a.breaker.sweep_interval, Duration::from_millis(100));
        assert_eq!(a.stream_interval, Duration::from_millis(100));
        assert_eq!(a.source_timeout, Duration::from_millis(1));
        assert_eq!(a.cache.tier_timeout, Duration::from_millis(1));
        assert_eq!(a.breaker.reset_timeout, MAX_DURATION);
        assert_eq!(a.trading.ttl, MAX_DURATION);
        assert_eq!(a.cache.default_ttl, MAX_DURATION);
        // still usable as a deadline
        assert!(std::time::Instant::now().checked_add(a.trading.ttl).is_some());
    }

    #[test]
    fn bool_and_mode_parsing() {
        assert_eq!(parse_bool(" Yes "), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(SourceMode::parse("bogus", SourceMode::Mock), SourceMode::Mock);
        assert_eq!(SourceMode::parse("real", SourceMode::Mock), SourceMode::Live);
    }
}
