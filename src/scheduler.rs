// ===============================
// src/scheduler.rs
// ===============================
//
// Loop periodik: agregasi -> publish ke grup `metrics` & `breakdown`.
// Gagal -> `stream_error` ke semua client (snapshot terakhir tetap di cache).
//
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::aggregator::{AggregateError, Aggregator};
use crate::domain::{now_iso, Breakdown, Event, Outbound, PnLMetrics, Push, PushSource};
use crate::metrics::PUSHES;
use crate::subscriptions::{ClientId, Group, SubscriptionRegistry};

pub struct Scheduler {
    agg: Arc<Aggregator>,
    registry: Arc<SubscriptionRegistry>,
    every: Duration,
    journal: Option<mpsc::Sender<Event>>,
}

impl Scheduler {
    pub fn new(
        agg: Arc<Aggregator>,
        registry: Arc<SubscriptionRegistry>,
        every: Duration,
        journal: Option<mpsc::Sender<Event>>,
    ) -> Self {
        Self { agg, registry, every, journal }
    }

    /// One aggregation + broadcast cycle.
    pub async fn tick(&self) -> Result<PnLMetrics, AggregateError> {
        match self.agg.try_snapshot().await {
            Ok(m) => {
                let breakdown = Breakdown::from(&m);
                let sent_m = self.registry.publish(
                    Group::Metrics,
                    &Outbound::PnlUpdate(Push::new(m.clone(), PushSource::Stream)),
                );
                let sent_b = self.registry.publish(
                    Group::Breakdown,
                    &Outbound::ComponentsUpdate(Push::new(breakdown, PushSource::Stream)),
                );
                PUSHES.with_label_values(&["metrics", "stream"]).inc_by(sent_m as u64);
                PUSHES.with_label_values(&["breakdown", "stream"]).inc_by(sent_b as u64);
                debug!(metrics = sent_m, breakdown = sent_b, net = m.net_pnl, "stream tick");
                self.record(Event::Snapshot(m.clone()));
                Ok(m)
            }
            Err(e) => {
                error!(error = %e, "stream cycle failed");
                let n = self.registry.broadcast_all(&Outbound::stream_error(e.to_string()));
                warn!(clients = n, "stream_error broadcast");
                self.record(Event::CycleFailed { message: e.to_string(), timestamp: now_iso() });
                Err(e)
            }
        }
    }

    /// Push the current value to `id` (tagged `initial`), then join the group.
    pub async fn subscribe(&self, id: ClientId, group: Group) -> bool {
        let msg = match group {
            Group::Metrics => {
                let m = match self.agg.latest() {
                    Some(m) => m,
                    None => self.agg.get_snapshot().await,
                };
                Outbound::PnlUpdate(Push::new(m, PushSource::Initial))
            }
            Group::Breakdown => Outbound::ComponentsUpdate(Push::new(
                self.agg.get_component_breakdown().await,
                PushSource::Initial,
            )),
        };
        if self.registry.send_to(id, msg) {
            PUSHES.with_label_values(&[group.as_str(), "initial"]).inc();
        }
        self.registry.subscribe(id, group)
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.agg
    }

    fn record(&self, ev: Event) {
        if let Some(tx) = &self.journal {
            // journal lambat tidak boleh menahan stream
            if tx.try_send(ev).is_err() {
                debug!("journal busy, event skipped");
            }
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.every.as_millis() as u64, "stream scheduler started");
        let mut tick = interval(self.every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let _ = self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("stream scheduler stopped");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::tests::scenario_rig;

    fn scheduler(journal: Option<mpsc::Sender<Event>>) -> (Arc<Scheduler>, crate::aggregator::tests::Rig) {
        let rig = scenario_rig(10);
        let registry = Arc::new(SubscriptionRegistry::new(16));
        let s = Arc::new(Scheduler::new(
            rig.agg.clone(),
            registry,
            Duration::from_millis(20),
            journal,
        ));
        (s, rig)
    }

    async fn skip_connected(rx: &mut mpsc::Receiver<Outbound>) {
        assert!(matches!(rx.recv().await, Some(Outbound::Connected { .. })));
    }

    #[tokio::test]
    async fn initial_push_precedes_stream() {
        let (s, _rig) = scheduler(None);
        let (id, mut rx) = s.registry().connect();
        skip_connected(&mut rx).await;

        assert!(s.subscribe(id, Group::Metrics).await);
        s.tick().await.unwrap();

        match rx.recv().await.unwrap() {
            Outbound::PnlUpdate(p) => {
                assert_eq!(p.source, PushSource::Initial);
                assert_eq!(p.data.net_pnl, 14850.0);
            }
            other => panic!("unexpected {other:?}"),
        }
        match rx.recv().await.unwrap() {
            Outbound::PnlUpdate(p) => assert_eq!(p.source, PushSource::Stream),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn groups_receive_their_own_payload() {
        let (s, _rig) = scheduler(None);
        let (m_id, mut m_rx) = s.registry().connect();
        let (b_id, mut b_rx) = s.registry().connect();
        skip_connected(&mut m_rx).await;
        skip_connected(&mut b_rx).await;

        s.subscribe(m_id, Group::Metrics).await;
        s.subscribe(b_id, Group::Breakdown).await;
        let _ = m_rx.recv().await;
        match b_rx.recv().await.unwrap() {
            Outbound::ComponentsUpdate(p) => {
                assert_eq!(p.source, PushSource::Initial);
                assert_eq!(p.data.summary.total_revenue, 15000.0);
            }
            other => panic!("unexpected {other:?}"),
        }

        s.tick().await.unwrap();
        assert!(matches!(m_rx.try_recv(), Ok(Outbound::PnlUpdate(_))));
        assert!(matches!(b_rx.try_recv(), Ok(Outbound::ComponentsUpdate(_))));
        assert!(m_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_cycle_broadcasts_stream_error() {
        let (tx, mut journal) = mpsc::channel(8);
        let (s, rig) = scheduler(Some(tx));
        let (_id, mut rx) = s.registry().connect();
        skip_connected(&mut rx).await;

        *rig.trading.value.lock() = Some(crate::domain::TradingSnapshot {
            pnl: f64::NAN,
            ..Default::default()
        });
        assert!(s.tick().await.is_err());
        assert!(matches!(rx.try_recv(), Ok(Outbound::StreamError { .. })));
        assert!(matches!(journal.try_recv(), Ok(Event::CycleFailed { .. })));
    }

    #[tokio::test]
    async fn snapshots_are_journaled() {
        let (tx, mut journal) = mpsc::channel(8);
        let (s, _rig) = scheduler(Some(tx));
        s.tick().await.unwrap();
        match journal.try_recv() {
            Ok(Event::Snapshot(m)) => assert_eq!(m.net_pnl, 14850.0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (s, rig) = scheduler(None);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(s.clone().run(stop_rx));

        tokio::time::sleep(Duration::from_millis(70)).await;
        let _ = stop_tx.send(true);
        handle.await.unwrap();
        assert!(rig.agg.history_len() >= 2);
    }
}
