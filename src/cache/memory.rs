// ===============================
// src/cache/memory.rs (fast in-process tier)
// ===============================
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use ahash::AHashMap as HashMap;
use parking_lot::Mutex;

use super::TierEntry;

struct Slot {
    payload: String,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    map: HashMap<String, Slot>,
    // insertion order, front = oldest
    order: VecDeque<String>,
}

impl Inner {
    fn remove(&mut self, key: &str) -> bool {
        if self.map.remove(key).is_some() {
            self.order.retain(|k| k != key);
            true
        } else {
            false
        }
    }
}

/// Bounded map with FIFO eviction. The lock only guards map operations.
pub struct MemoryTier {
    inner: Mutex<Inner>,
    max_entries: usize,
}

impl MemoryTier {
    pub fn new(max_entries: usize) -> Self {
        Self { inner: Mutex::new(Inner::default()), max_entries }
    }

    pub fn get(&self, key: &str) -> Option<TierEntry> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expires_at = inner.map.get(key)?.expires_at;
        if expires_at <= now {
            inner.remove(key);
            return None;
        }
        inner.map.get(key).map(|slot| TierEntry {
            payload: slot.payload.clone(),
            ttl: Some(expires_at - now),
        })
    }

    pub fn set(&self, key: &str, payload: &str, ttl: Duration) {
        if self.max_entries == 0 {
            return;
        }
        let slot = Slot { payload: payload.to_string(), expires_at: Instant::now() + ttl };
        let mut inner = self.inner.lock();

        // overwrite keeps the original insertion position
        if let Some(existing) = inner.map.get_mut(key) {
            *existing = slot;
            return;
        }
        while inner.map.len() >= self.max_entries {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.map.remove(&oldest);
        }
        inner.order.push_back(key.to_string());
        inner.map.insert(key.to_string(), slot);
    }

    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().remove(key)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrite_keeps_position() {
        let t = MemoryTier::new(2);
        t.set("a", "1", Duration::from_secs(10));
        t.set("b", "2", Duration::from_secs(10));
        t.set("a", "3", Duration::from_secs(10));
        t.set("c", "4", Duration::from_secs(10));

        assert!(t.get("a").is_none());
        assert_eq!(t.get("b").unwrap().payload, "2");
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn deleted_key_reinserted_goes_to_back() {
        let t = MemoryTier::new(2);
        t.set("a", "1", Duration::from_secs(10));
        t.set("b", "2", Duration::from_secs(10));
        assert!(t.delete("a"));
        t.set("a", "1", Duration::from_secs(10));
        t.set("c", "3", Duration::from_secs(10));

        assert!(t.get("b").is_none());
        assert!(t.get("a").is_some());
        assert!(t.get("c").is_some());
    }

    #[test]
    fn zero_capacity_stores_nothing() {
        let t = MemoryTier::new(0);
        t.set("a", "1", Duration::from_secs(10));
        assert!(t.get("a").is_none());
    }

    #[test]
    fn remaining_ttl_is_reported() {
        let t = MemoryTier::new(4);
        t.set("a", "1", Duration::from_secs(10));
        let ttl = t.get("a").unwrap().ttl.unwrap();
        assert!(ttl <= Duration::from_secs(10) && ttl > Duration::from_secs(9));
    }
}
