// ===============================
// src/breaker.rs (per-dependency circuit breaker)
// ===============================
//
// CLOSED (normal) -> OPEN (reject + fallback) -> HALF_OPEN (satu probe) -> CLOSED
//
// - State per nama dependency, dibuat lazy saat panggilan pertama.
// - Lock tidak pernah ditahan saat `f` di-await.
// - Sweep periodik me-reset circuit OPEN yang timeout-nya sudah lewat (pakai try_lock).
//
use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};

use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::domain::{now_iso, now_ms};
use crate::metrics::{CIRCUIT_REJECTS, CIRCUIT_STATE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn gauge(self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

#[derive(Debug, Error)]
pub enum BreakerError<E: std::error::Error + 'static> {
    #[error("circuit breaker OPEN for service: {0}")]
    Open(String),
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    failure_count: u32,
    last_failure_ms: Option<i64>,
    last_success_ms: Option<i64>,
    next_attempt: Option<Instant>,
    probe_in_flight: bool,
}

impl Default for Circuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_ms: None,
            last_success_ms: None,
            next_attempt: None,
            probe_in_flight: false,
        }
    }
}

impl Circuit {
    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.next_attempt = None;
        self.probe_in_flight = false;
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitStatus {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_time: Option<i64>,
    pub last_success_time: Option<i64>,
    /// Epoch ms, only while OPEN
    pub next_attempt_time: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStatus {
    pub timestamp: String,
    pub services: BTreeMap<String, CircuitStatus>,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

/// Outcome of the pre-call check.
enum Gate {
    Pass,
    Probe,
    Reject,
}

pub struct CircuitBreaker {
    cfg: BreakerConfig,
    circuits: Mutex<HashMap<String, Circuit>>,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self { cfg, circuits: Mutex::new(HashMap::new()) }
    }

    /// Jalankan `f` di bawah proteksi circuit `name`.
    ///
    /// On failure (or while OPEN) the `fallback` is returned when given,
    /// otherwise the error propagates.
    pub async fn execute<T, E, F, Fut>(
        &self,
        name: &str,
        f: F,
        fallback: Option<T>,
    ) -> Result<T, BreakerError<E>>
    where
        E: std::error::Error + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.gate(name) {
            Gate::Reject => {
                CIRCUIT_REJECTS.with_label_values(&[name]).inc();
                warn!(service = %name, "circuit OPEN, using fallback");
                return fallback.ok_or_else(|| BreakerError::Open(name.to_string()));
            }
            Gate::Probe => info!(service = %name, "circuit HALF_OPEN, probing"),
            Gate::Pass => {}
        }

        match f().await {
            Ok(v) => {
                self.on_success(name);
                Ok(v)
            }
            Err(e) => {
                self.on_failure(name, &e);
                match fallback {
                    Some(fb) => {
                        debug!(service = %name, "using fallback");
                        Ok(fb)
                    }
                    None => Err(BreakerError::Inner(e)),
                }
            }
        }
    }

    fn gate(&self, name: &str) -> Gate {
        let mut circuits = self.circuits.lock();
        let c = circuits.entry(name.to_string()).or_default();
        match c.state {
            CircuitState::Closed => Gate::Pass,
            CircuitState::Open => {
                let due = c.next_attempt.map(|t| Instant::now() >= t).unwrap_or(true);
                if !due {
                    return Gate::Reject;
                }
                c.state = CircuitState::HalfOpen;
                c.probe_in_flight = true;
                CIRCUIT_STATE.with_label_values(&[name]).set(c.state.gauge());
                Gate::Probe
            }
            CircuitState::HalfOpen => {
                // satu probe saja; yang lain ditolak seperti OPEN
                if c.probe_in_flight {
                    Gate::Reject
                } else {
                    c.probe_in_flight = true;
                    Gate::Probe
                }
            }
        }
    }

    fn on_success(&self, name: &str) {
        let mut circuits = self.circuits.lock();
        let c = circuits.entry(name.to_string()).or_default();
        if c.state == CircuitState::HalfOpen {
            info!(service = %name, "circuit CLOSED, service recovered");
        }
        c.close();
        c.last_success_ms = Some(now_ms());
        CIRCUIT_STATE.with_label_values(&[name]).set(c.state.gauge());
    }

    fn on_failure<E: std::error::Error>(&self, name: &str, err: &E) {
        let mut circuits = self.circuits.lock();
        let c = circuits.entry(name.to_string()).or_default();
        c.failure_count += 1;
        c.last_failure_ms = Some(now_ms());
        c.probe_in_flight = false;

        warn!(
            service = %name,
            failures = c.failure_count,
            threshold = self.cfg.failure_threshold,
            error = %err,
            "dependency call failed"
        );

        let reopen = c.state == CircuitState::HalfOpen;
        if reopen || c.failure_count >= self.cfg.failure_threshold {
            c.state = CircuitState::Open;
            c.next_attempt = Some(Instant::now() + self.cfg.reset_timeout);
            warn!(
                service = %name,
                failures = c.failure_count,
                reset_in_ms = self.cfg.reset_timeout.as_millis() as u64,
                "circuit OPEN"
            );
        }
        CIRCUIT_STATE.with_label_values(&[name]).set(c.state.gauge());
    }

    pub fn state(&self, name: &str) -> Option<CircuitState> {
        self.circuits.lock().get(name).map(|c| c.state)
    }

    pub fn failure_count(&self, name: &str) -> u32 {
        self.circuits.lock().get(name).map(|c| c.failure_count).unwrap_or(0)
    }

    /// Force one circuit (or all, with `None`) back to CLOSED.
    pub fn reset(&self, name: Option<&str>) -> usize {
        let mut circuits = self.circuits.lock();
        let mut n = 0;
        for (svc, c) in circuits.iter_mut() {
            if name.map(|want| want == svc).unwrap_or(true) {
                c.close();
                c.last_failure_ms = None;
                CIRCUIT_STATE.with_label_values(&[svc.as_str()]).set(0);
                n += 1;
            }
        }
        match name {
            Some(svc) => info!(service = %svc, found = n > 0, "circuit reset"),
            None => info!(count = n, "all circuits reset"),
        }
        n
    }

    pub fn status(&self) -> BreakerStatus {
        let now = Instant::now();
        let now_epoch = now_ms();
        let services = self
            .circuits
            .lock()
            .iter()
            .map(|(name, c)| {
                let next_attempt_time = match (c.state, c.next_attempt) {
                    (CircuitState::Open, Some(t)) => {
                        Some(now_epoch + t.saturating_duration_since(now).as_millis() as i64)
                    }
                    _ => None,
                };
                let st = CircuitStatus {
                    state: c.state,
                    failure_count: c.failure_count,
                    last_failure_time: c.last_failure_ms,
                    last_success_time: c.last_success_ms,
                    next_attempt_time,
                };
                (name.clone(), st)
            })
            .collect();
        BreakerStatus {
            timestamp: now_iso(),
            services,
            failure_threshold: self.cfg.failure_threshold,
            reset_timeout_ms: self.cfg.reset_timeout.as_millis() as u64,
        }
    }

    /// One sweep pass. Returns how many circuits were reset; skips the pass
    /// entirely if the map is busy.
    pub fn sweep(&self) -> usize {
        let Some(mut circuits) = self.circuits.try_lock() else {
            return 0;
        };
        let now = Instant::now();
        let mut n = 0;
        for (name, c) in circuits.iter_mut() {
            let due = c.next_attempt.map(|t| now >= t).unwrap_or(false);
            if c.state == CircuitState::Open && due {
                info!(service = %name, "auto-resetting circuit");
                c.close();
                CIRCUIT_STATE.with_label_values(&[name.as_str()]).set(0);
                n += 1;
            }
        }
        n
    }
}

/// Lower bound for the sweep period; `interval` panics on zero.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Background sweep task, jalan sampai shutdown.
pub async fn run_sweep(breaker: std::sync::Arc<CircuitBreaker>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = interval(breaker.cfg.sweep_interval.max(MIN_SWEEP_INTERVAL));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => { breaker.sweep(); }
            _ = shutdown.changed() => {
                debug!("breaker sweep stopped");
                break;
            }
        }
    }
}
