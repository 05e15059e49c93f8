//! Per-key rate limiting of outward updates
//!
//! At most one value is delivered per key per interval. Values arriving
//! inside the window are coalesced and the most recent one is delivered when
//! the window closes (trailing edge), so the final value is never lost.
//! Delivery happens under the slot lock, which keeps updates for a key in
//! the order they were produced.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

type Deliver<K, V> = Arc<dyn Fn(&K, V) + Send + Sync>;

struct Slot<V> {
    last_delivered: Option<Instant>,
    pending: Option<V>,
    /// Token of the armed trailing timer. A timer whose token no longer
    /// matches belongs to a forgotten slot and does nothing.
    timer: Option<u64>,
}

impl<V> Default for Slot<V> {
    fn default() -> Self {
        Self {
            last_delivered: None,
            pending: None,
            timer: None,
        }
    }
}

/// Leaky-bucket throttle parameterized by interval
pub struct Throttle<K, V> {
    interval: Duration,
    slots: Arc<Mutex<HashMap<K, Slot<V>>>>,
    next_timer: Arc<AtomicU64>,
    deliver: Deliver<K, V>,
}

impl<K, V> Clone for Throttle<K, V> {
    fn clone(&self) -> Self {
        Self {
            interval: self.interval,
            slots: Arc::clone(&self.slots),
            next_timer: Arc::clone(&self.next_timer),
            deliver: Arc::clone(&self.deliver),
        }
    }
}

impl<K, V> Throttle<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + 'static,
{
    pub fn new(interval: Duration, deliver: impl Fn(&K, V) + Send + Sync + 'static) -> Self {
        Self {
            interval,
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_timer: Arc::new(AtomicU64::new(0)),
            deliver: Arc::new(deliver),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Offer a value. Delivered now if the key's window is open, otherwise
    /// held until the window closes, replacing whatever was held before.
    pub fn emit(&self, key: K, value: V) {
        let mut slots = self.slots.lock();
        let slot = slots.entry(key.clone()).or_default();

        if slot.timer.is_some() {
            slot.pending = Some(value);
            return;
        }

        let now = Instant::now();
        match slot.last_delivered {
            Some(last) if now.duration_since(last) < self.interval => {
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    // No timer available outside a runtime.
                    slot.last_delivered = Some(now);
                    (self.deliver)(&key, value);
                    return;
                };
                let token = self.next_timer.fetch_add(1, Ordering::Relaxed);
                slot.pending = Some(value);
                slot.timer = Some(token);
                runtime.spawn(self.clone().flush_at(key, token, last + self.interval));
            }
            _ => {
                slot.last_delivered = Some(now);
                (self.deliver)(&key, value);
            }
        }
    }

    /// Deliver immediately, superseding any value waiting for its window
    pub fn emit_now(&self, key: K, value: V) {
        let mut slots = self.slots.lock();
        let slot = slots.entry(key.clone()).or_default();
        slot.pending = None;
        slot.last_delivered = Some(Instant::now());
        (self.deliver)(&key, value);
    }

    /// Drop all state for `key`, including a pending value
    pub fn forget(&self, key: &K) {
        self.slots.lock().remove(key);
    }

    pub fn has_pending(&self, key: &K) -> bool {
        self.slots
            .lock()
            .get(key)
            .map(|slot| slot.pending.is_some())
            .unwrap_or(false)
    }

    async fn flush_at(self, key: K, token: u64, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;

        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&key).filter(|slot| slot.timer == Some(token)) else {
            return;
        };
        slot.timer = None;
        if let Some(value) = slot.pending.take() {
            slot.last_delivered = Some(Instant::now());
            (self.deliver)(&key, value);
        }
    }
}
