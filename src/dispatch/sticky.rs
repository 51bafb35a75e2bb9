//! Client-to-worker binding for ordered fan-out.
//!
//! The first message for a client picks the worker with the lightest
//! weighted load and memoizes the choice; every later message for that
//! client lands on the same worker. Bindings are evicted explicitly, on
//! session close and by idle sweep.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::core::message::ClientId;

#[derive(Debug)]
struct Binding {
    worker: usize,
    last_used_ms: AtomicU64,
}

#[derive(Debug)]
pub struct StickyRouter {
    bindings: DashMap<ClientId, Binding>,
    assigned: Vec<AtomicUsize>,
    started: Instant,
}

impl StickyRouter {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            bindings: DashMap::new(),
            assigned: (0..workers).map(|_| AtomicUsize::new(0)).collect(),
            started: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Worker index for `client`. `depths` is the current queue depth per
    /// worker; the binding weight is assigned-count x depth, decided once
    /// at first sight.
    pub fn select(&self, client: &ClientId, depths: &[usize]) -> usize {
        let now = self.now_ms();
        if let Some(binding) = self.bindings.get(client) {
            binding.last_used_ms.store(now, Ordering::Relaxed);
            return binding.worker;
        }

        let entry = self.bindings.entry(client.clone()).or_insert_with(|| {
            let worker = self.least_loaded(depths);
            self.assigned[worker].fetch_add(1, Ordering::Relaxed);
            Binding {
                worker,
                last_used_ms: AtomicU64::new(now),
            }
        });
        entry.last_used_ms.store(now, Ordering::Relaxed);
        entry.worker
    }

    fn least_loaded(&self, depths: &[usize]) -> usize {
        let mut best = 0;
        let mut best_weight = usize::MAX;
        for (index, slot) in self.assigned.iter().enumerate() {
            let depth = depths.get(index).copied().unwrap_or(0);
            let weight = slot.load(Ordering::Relaxed).saturating_mul(depth);
            if weight < best_weight {
                best = index;
                best_weight = weight;
            }
        }
        best
    }

    /// Drop the binding on session close.
    pub fn unbind(&self, client: &ClientId) {
        if let Some((_, binding)) = self.bindings.remove(client) {
            self.assigned[binding.worker].fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Drop every binding idle for longer than `max_idle`.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let cutoff = self.now_ms().saturating_sub(max_idle.as_millis() as u64);
        let mut evicted = 0;
        self.bindings.retain(|_, binding| {
            if binding.last_used_ms.load(Ordering::Relaxed) < cutoff {
                self.assigned[binding.worker].fetch_sub(1, Ordering::Relaxed);
                evicted += 1;
                false
            } else {
                true
            }
        });
        evicted
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn assigned_to(&self, worker: usize) -> usize {
        self.assigned[worker].load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_is_memoized() {
        let router = StickyRouter::new(4);
        let client = ClientId::from("analytics-1");

        let first = router.select(&client, &[0, 0, 0, 0]);
        // Later depth changes must not move an existing binding.
        let second = router.select(&client, &[100, 100, 100, 100]);
        assert_eq!(first, second);
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn first_sight_picks_the_lightest_worker() {
        let router = StickyRouter::new(3);

        // Occupy workers 0 and 1 so their assigned counts are non-zero.
        router.select(&ClientId::from("a"), &[5, 5, 5]);
        router.select(&ClientId::from("b"), &[5, 5, 5]);

        // Worker 2 has no bindings: weight 0 regardless of depth.
        let picked = router.select(&ClientId::from("c"), &[1, 1, 50]);
        assert_eq!(picked, 2);
    }

    #[test]
    fn unbind_releases_the_worker_slot() {
        let router = StickyRouter::new(2);
        let client = ClientId::from("a");
        let worker = router.select(&client, &[0, 0]);
        assert_eq!(router.assigned_to(worker), 1);

        router.unbind(&client);
        assert_eq!(router.assigned_to(worker), 0);
        assert!(router.is_empty());

        // Unbinding an unknown client is a no-op.
        router.unbind(&ClientId::from("ghost"));
    }

    #[test]
    fn idle_bindings_are_evicted() {
        let router = StickyRouter::new(2);
        router.select(&ClientId::from("a"), &[0, 0]);
        router.select(&ClientId::from("b"), &[0, 0]);

        std::thread::sleep(Duration::from_millis(30));
        router.select(&ClientId::from("b"), &[0, 0]);

        let evicted = router.evict_idle(Duration::from_millis(20));
        assert_eq!(evicted, 1);
        assert_eq!(router.len(), 1);
        assert!(router.bindings.contains_key(&ClientId::from("b")));
    }
}
