// ===============================
// src/subscriptions.rs
// ===============================
//
// Registry client -> channel + keanggotaan grup (metrics / breakdown).
// Transport (WS) hanya men-drain `mpsc::Receiver<Outbound>` per client;
// registry tidak tahu apa-apa soal socket.
//
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::domain::{now_iso, Outbound};
use crate::metrics::{DROPPED, SUBSCRIBERS};

pub type ClientId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Group {
    Metrics,
    Breakdown,
}

impl Group {
    pub const ALL: [Group; 2] = [Group::Metrics, Group::Breakdown];

    pub fn as_str(&self) -> &'static str {
        match self {
            Group::Metrics => "metrics",
            Group::Breakdown => "breakdown",
        }
    }
}

impl FromStr for Group {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "metrics" | "pnl" => Ok(Group::Metrics),
            "breakdown" | "components" => Ok(Group::Breakdown),
            other => Err(format!("unknown group: {other}")),
        }
    }
}

#[derive(Default)]
struct Inner {
    clients: HashMap<ClientId, mpsc::Sender<Outbound>>,
    groups: HashMap<Group, HashSet<ClientId>>,
}

impl Inner {
    fn drop_client(&mut self, id: ClientId) -> bool {
        let existed = self.clients.remove(&id).is_some();
        for members in self.groups.values_mut() {
            members.remove(&id);
        }
        existed
    }

    fn refresh_gauges(&self) {
        for g in Group::ALL {
            let n = self.groups.get(&g).map(|m| m.len()).unwrap_or(0);
            SUBSCRIBERS.with_label_values(&[g.as_str()]).set(n as i64);
        }
    }
}

pub struct SubscriptionRegistry {
    buffer: usize,
    next_id: AtomicU64,
    inner: Mutex<Inner>,
}

impl SubscriptionRegistry {
    pub fn new(buffer: usize) -> Self {
        Self { buffer: buffer.max(1), next_id: AtomicU64::new(1), inner: Mutex::new(Inner::default()) }
    }

    /// Register a client. The first message on the receiver is `connected`.
    pub fn connect(&self) -> (ClientId, mpsc::Receiver<Outbound>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        let _ = tx.try_send(Outbound::Connected { client_id: id, timestamp: now_iso() });
        self.inner.lock().clients.insert(id, tx);
        info!(client = id, "client connected");
        (id, rx)
    }

    /// Join a group. Unknown clients are ignored.
    pub fn subscribe(&self, id: ClientId, group: Group) -> bool {
        let mut inner = self.inner.lock();
        if !inner.clients.contains_key(&id) {
            return false;
        }
        let added = inner.groups.entry(group).or_default().insert(id);
        inner.refresh_gauges();
        debug!(client = id, group = group.as_str(), "subscribed");
        added
    }

    pub fn unsubscribe(&self, id: ClientId, group: Group) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.groups.get_mut(&group).map(|m| m.remove(&id)).unwrap_or(false);
        inner.refresh_gauges();
        removed
    }

    pub fn disconnect(&self, id: ClientId) {
        let mut inner = self.inner.lock();
        if inner.drop_client(id) {
            info!(client = id, "client disconnected");
        }
        inner.refresh_gauges();
    }

    /// Direct message to one client. A closed channel disconnects it.
    pub fn send_to(&self, id: ClientId, msg: Outbound) -> bool {
        let mut inner = self.inner.lock();
        let Some(tx) = inner.clients.get(&id) else {
            return false;
        };
        match tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(client = id, "client channel full, message dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                inner.drop_client(id);
                inner.refresh_gauges();
                false
            }
        }
    }

    /// Push to every member of `group`; returns how many received it.
    /// Full channel -> removed from this group, closed channel -> disconnected.
    pub fn publish(&self, group: Group, msg: &Outbound) -> usize {
        let mut inner = self.inner.lock();
        let members: Vec<ClientId> = match inner.groups.get(&group) {
            Some(m) => m.iter().copied().collect(),
            None => return 0,
        };

        let mut delivered = 0;
        let mut full = Vec::new();
        let mut closed = Vec::new();
        for id in members {
            let Some(tx) = inner.clients.get(&id) else {
                closed.push(id);
                continue;
            };
            match tx.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => full.push(id),
                Err(TrySendError::Closed(_)) => closed.push(id),
            }
        }

        for id in &full {
            if let Some(m) = inner.groups.get_mut(&group) {
                m.remove(id);
            }
            warn!(client = id, group = group.as_str(), "slow subscriber dropped from group");
        }
        for id in &closed {
            inner.drop_client(*id);
        }
        let dropped = full.len() + closed.len();
        if dropped > 0 {
            DROPPED.with_label_values(&[group.as_str()]).inc_by(dropped as u64);
            inner.refresh_gauges();
        }
        delivered
    }

    /// Every connected client, regardless of groups.
    pub fn broadcast_all(&self, msg: &Outbound) -> usize {
        let mut inner = self.inner.lock();
        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, tx) in inner.clients.iter() {
            match tx.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        for id in closed {
            inner.drop_client(id);
        }
        inner.refresh_gauges();
        delivered
    }

    pub fn count(&self, group: Group) -> usize {
        self.inner.lock().groups.get(&group).map(|m| m.len()).unwrap_or(0)
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    pub fn is_subscribed(&self, id: ClientId, group: Group) -> bool {
        self.inner.lock().groups.get(&group).map(|m| m.contains(&id)).unwrap_or(false)
    }
}
