// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Cache --------
pub static CACHE_HITS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("cache_hits_total", "cache hits per tier"), &["tier"]).unwrap()
});

pub static CACHE_MISSES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("cache_misses_total", "cache misses (all tiers)").unwrap());

pub static CACHE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("cache_errors_total", "swallowed tier errors (labels: tier, op)"),
        &["tier", "op"],
    )
    .unwrap()
});

// -------- Circuit breaker --------
// 0 = closed, 1 = half_open, 2 = open
pub static CIRCUIT_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("circuit_state", "circuit state per service (0 closed, 1 half-open, 2 open)"),
        &["service"],
    )
    .unwrap()
});

pub static CIRCUIT_REJECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("circuit_rejected_total", "calls short-circuited while open"),
        &["service"],
    )
    .unwrap()
});

// -------- Sources --------
pub static SOURCE_FETCH: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("source_fetch_total", "source fetches by outcome (labels: source, origin)"),
        &["source", "origin"],
    )
    .unwrap()
});

pub static SOURCE_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("source_fetch_latency_ms", "Guarded source fetch latency (ms)")
            .buckets(vec![1.0, 5.0, 25.0, 100.0, 250.0, 1000.0, 2500.0, 5000.0]),
    )
    .unwrap()
});

// -------- Aggregation --------
pub static AGG_CYCLES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("aggregation_cycles_total", "aggregation cycles by outcome"),
        &["outcome"],
    )
    .unwrap()
});

pub static PNL_REVENUE: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_total_revenue", "latest total revenue").unwrap());

pub static PNL_EXPENSES: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_total_expenses", "latest total expenses").unwrap());

pub static PNL_NET: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_net", "latest net P&L").unwrap());

// -------- Streaming --------
pub static SUBSCRIBERS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("stream_subscribers", "subscribers per group"), &["group"])
        .unwrap()
});

pub static PUSHES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("stream_pushes_total", "messages pushed (labels: group, source)"),
        &["group", "source"],
    )
    .unwrap()
});

pub static DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("stream_dropped_total", "subscribers dropped after a failed push"),
        &["group"],
    )
    .unwrap()
});

// ---- Config visibility (source modes / tiers) ----
pub static CONFIG_SOURCE_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_source_mode", "source mode (labels: source, mode)"),
        &["source", "mode"],
    )
    .unwrap()
});

pub static CONFIG_CACHE_TIER: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_cache_tier", "1 if cache tier is enabled (label: tier)"),
        &["tier"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry (double register -> Err, diabaikan)
    for m in [
        REGISTRY.register(Box::new(CACHE_HITS.clone())),
        REGISTRY.register(Box::new(CACHE_MISSES.clone())),
        REGISTRY.register(Box::new(CACHE_ERRORS.clone())),
        REGISTRY.register(Box::new(CIRCUIT_STATE.clone())),
        REGISTRY.register(Box::new(CIRCUIT_REJECTS.clone())),
        REGISTRY.register(Box::new(SOURCE_FETCH.clone())),
        REGISTRY.register(Box::new(SOURCE_LATENCY.clone())),
        REGISTRY.register(Box::new(AGG_CYCLES.clone())),
        REGISTRY.register(Box::new(PNL_REVENUE.clone())),
        REGISTRY.register(Box::new(PNL_EXPENSES.clone())),
        REGISTRY.register(Box::new(PNL_NET.clone())),
        REGISTRY.register(Box::new(SUBSCRIBERS.clone())),
        REGISTRY.register(Box::new(PUSHES.clone())),
        REGISTRY.register(Box::new(DROPPED.clone())),
        // Config visibility
        REGISTRY.register(Box::new(CONFIG_SOURCE_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_CACHE_TIER.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent_and_encodes() {
        init();
        init();
        AGG_CYCLES.with_label_values(&["ok"]).inc();
        let body = String::from_utf8(encode_metrics()).unwrap();
        assert!(body.contains("aggregation_cycles_total"));
    }
}
