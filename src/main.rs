// ===============================
// src/main.rs
// ===============================
/*
 # snapshot & history
 curl -s localhost:3000/api/pnl/current | jq .data.netPnL
 curl -s 'localhost:3000/api/pnl/history?limit=5' | jq .data.count

 # circuit breaker & cache
 curl -s localhost:3000/api/circuit-breaker/status | jq .data.services
 curl -s -XPOST 'localhost:3000/api/circuit-breaker/reset?service=trading'
 curl -s localhost:3000/metrics | egrep '^(circuit_state|cache_hits_total|pnl_net)'

 # stream
 websocat ws://localhost:3001 <<< '{"action":"subscribe","group":"metrics"}'
*/
/*
=============================================================================
Project : pnl_stream_rust — real-time P&L aggregation & streaming service
Module  : main.rs
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
mod aggregator;
mod breaker;
mod cache;
mod config;
mod domain;
mod http;
mod metrics;
mod recorder;
mod scheduler;
mod sources;
mod subscriptions;
mod ws;

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::{
    select,
    sync::{mpsc, watch},
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::aggregator::{Aggregator, AggregatorConfig};
use crate::breaker::CircuitBreaker;
use crate::cache::TieredCache;
use crate::domain::Event;
use crate::scheduler::Scheduler;
use crate::sources::{SourceGuard, Sources};
use crate::subscriptions::{Group, SubscriptionRegistry};

#[tokio::main]
async fn main() {
    let cli = config::Cli::parse();

    // ---- Logging ----
    // --log-filter > RUST_LOG > "info"
    let filter = match &cli.log_filter {
        Some(f) => EnvFilter::new(f),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ---- Config ----
    let args = match config::load(&cli) {
        Ok(a) => a,
        Err(e) => {
            error!(%e, "invalid configuration");
            std::process::exit(2);
        }
    };

    // ---- Metrics ----
    metrics::init();

    info!(
        http_port = args.http_port,
        ws_port = args.ws_port,
        stream_interval_ms = args.stream_interval.as_millis() as u64,
        source_timeout_ms = args.source_timeout.as_millis() as u64,
        trading = args.trading.mode.as_str(),
        billing = args.billing.mode.as_str(),
        ledger = args.ledger.mode.as_str(),
        redis = args.cache.redis_url.is_some(),
        sqlite = ?args.cache.sqlite_path,
        cache_tier_timeout_ms = args.cache.tier_timeout.as_millis() as u64,
        breaker_threshold = args.breaker.failure_threshold,
        breaker_reset_ms = args.breaker.reset_timeout.as_millis() as u64,
        record_file = ?args.record_file,
        "startup config"
    );

    // ---- Cache & breaker ----
    let cache = Arc::new(TieredCache::connect(&args.cache).await);
    let breaker = Arc::new(CircuitBreaker::new(args.breaker.clone()));

    // ---- Sources ----
    let http_client = match reqwest::Client::builder()
        .timeout(args.source_timeout)
        .user_agent(concat!("pnl_stream_rust/", env!("CARGO_PKG_VERSION")))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            error!(?e, "http client init failed");
            std::process::exit(1);
        }
    };
    let sources = match Sources::build(&args.trading, &args.billing, &args.ledger, http_client) {
        Ok(s) => s,
        Err(e) => {
            error!(%e, "source init failed");
            std::process::exit(2);
        }
    };
    let guard = SourceGuard::new(cache.clone(), breaker.clone(), args.source_timeout);

    // ---- Aggregator ----
    let agg_cfg = AggregatorConfig {
        history_size: args.history_size,
        snapshot_ttl: args.snapshot_ttl,
    };
    aggregator::log_config(&agg_cfg);
    let agg = Arc::new(Aggregator::new(sources, guard, cache.clone(), agg_cfg));
    let registry = Arc::new(SubscriptionRegistry::new(args.subscriber_buffer));

    // ---- Journal (optional) ----
    let journal = args.record_file.clone().map(|path| {
        let (tx, rx) = mpsc::channel::<Event>(1024);
        tokio::spawn(recorder::run(rx, path));
        tx
    });

    // ---- Tasks ----
    let (stop_tx, stop_rx) = watch::channel(false);

    tokio::spawn(breaker::run_sweep(breaker.clone(), stop_rx.clone()));

    let sched = Arc::new(Scheduler::new(
        agg.clone(),
        registry.clone(),
        args.stream_interval,
        journal,
    ));
    let sched_task = tokio::spawn(sched.clone().run(stop_rx.clone()));

    let state = Arc::new(http::AppState {
        agg: agg.clone(),
        breaker: breaker.clone(),
        cache: cache.clone(),
        registry: registry.clone(),
        started: Instant::now(),
    });
    let http_task = tokio::spawn({
        let rx = stop_rx.clone();
        let port = args.http_port;
        async move {
            if let Err(e) = http::serve(port, state, rx).await {
                error!(?e, port, "http server failed");
            }
        }
    });
    let ws_task = tokio::spawn({
        let rx = stop_rx.clone();
        let port = args.ws_port;
        let sched = sched.clone();
        async move {
            if let Err(e) = ws::serve(port, sched, rx).await {
                error!(?e, port, "websocket server failed");
            }
        }
    });

    // ---- Heartbeat ----
    let mut hb = interval(Duration::from_secs(30));
    hb.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        select! {
            _ = hb.tick() => {
                let stats = cache.stats();
                info!(
                    clients = registry.client_count(),
                    metrics_subs = registry.count(Group::Metrics),
                    breakdown_subs = registry.count(Group::Breakdown),
                    history = agg.history_len(),
                    cache_hit_rate = stats.hit_rate,
                    cache_size = stats.size,
                    "heartbeat"
                );
            }
            _ = &mut ctrl_c => {
                info!("shutdown requested");
                break;
            }
        }
    }

    let _ = stop_tx.send(true);
    let _ = tokio::join!(sched_task, http_task, ws_task);
    info!("stopped");
}
