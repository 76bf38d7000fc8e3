use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slots<K> = Arc<Mutex<HashMap<K, Arc<AsyncMutex<()>>>>>;

/// Per-key run serialization. Holders of the same key queue behind each
/// other; distinct keys never contend.
pub struct SingleFlight<K> {
    slots: Slots<K>,
}

impl<K> Clone for SingleFlight<K> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<K: Eq + Hash + Clone> Default for SingleFlight<K> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub struct FlightGuard<K: Eq + Hash> {
    key: K,
    slot: Arc<AsyncMutex<()>>,
    slots: Slots<K>,
    held: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash + Clone> SingleFlight<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: K) -> FlightGuard<K> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|poison| poison.into_inner());
            Arc::clone(slots.entry(key.clone()).or_default())
        };
        let held = Arc::clone(&slot).lock_owned().await;
        FlightGuard {
            key,
            slot,
            slots: Arc::clone(&self.slots),
            held: Some(held),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.slots
            .lock()
            .map(|slots| slots.len())
            .unwrap_or_default()
    }
}

impl<K: Eq + Hash> Drop for FlightGuard<K> {
    fn drop(&mut self) {
        // Release the lock first so its clone of the slot no longer counts.
        drop(self.held.take());
        let mut slots = self.slots.lock().unwrap_or_else(|poison| poison.into_inner());
        // The map and this guard hold one reference each; anything more is a waiter.
        if Arc::strong_count(&self.slot) <= 2 {
            slots.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_runs_one_at_a_time() {
        let flights = SingleFlight::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let (flights, active, peak) = (flights.clone(), active.clone(), peak.clone());
            handles.push(tokio::spawn(async move {
                let _guard = flights.acquire(7_i64).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(15)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_block() {
        let flights = SingleFlight::new();
        let _first = flights.acquire(1_i64).await;
        let second = tokio::time::timeout(Duration::from_millis(100), flights.acquire(2_i64)).await;
        assert!(second.is_ok());
        assert_eq!(flights.in_flight(), 2);
    }

    #[tokio::test]
    async fn released_slot_leaves_the_registry() {
        let flights = SingleFlight::new();
        let guard = flights.acquire(3_i64).await;
        assert_eq!(flights.in_flight(), 1);
        drop(guard);
        assert_eq!(flights.in_flight(), 0);

        let first = flights.acquire(3_i64).await;
        let waiter = tokio::spawn({
            let flights = flights.clone();
            async move { drop(flights.acquire(3_i64).await) }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);
        assert_eq!(flights.in_flight(), 1);
        waiter.await.unwrap();
        assert_eq!(flights.in_flight(), 0);
    }
}
