//! Bounded message free-list for the publish hot path.
//!
//! Each hub owns a pool: `Hub::create_message` acquires from it and the
//! replay cache releases evicted envelopes back once no session still
//! holds them. The global [`MESSAGE_POOL`] backs caches built without a
//! hub. Correctness never depends on pooling: `acquire` falls back to a
//! fresh allocation on miss and `release` drops instead of growing past
//! the cap.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;
use once_cell::sync::Lazy;

use crate::core::message::Message;

#[derive(Debug, Default)]
pub struct PoolStats {
    pub hits: AtomicUsize,
    pub misses: AtomicUsize,
}

impl PoolStats {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        if hits + misses == 0.0 {
            0.0
        } else {
            hits / (hits + misses)
        }
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

pub static POOL_STATS: Lazy<PoolStats> = Lazy::new(Default::default);

#[derive(Debug)]
pub struct MessagePool {
    pool: SegQueue<Message>,
    max_pool_size: usize,
}

impl MessagePool {
    pub fn new(max_pool_size: usize) -> Self {
        Self {
            pool: SegQueue::new(),
            max_pool_size,
        }
    }

    pub fn acquire(&self) -> Message {
        if let Some(msg) = self.pool.pop() {
            POOL_STATS.hits.fetch_add(1, Ordering::Relaxed);
            msg
        } else {
            POOL_STATS.misses.fetch_add(1, Ordering::Relaxed);
            Message::application(Vec::new(), bytes::Bytes::new())
        }
    }

    pub fn release(&self, mut msg: Message) {
        if self.pool.len() < self.max_pool_size {
            msg.clear();
            self.pool.push(msg);
        }
        // Past the cap, let it drop.
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Drop every pooled message.
    pub fn clear(&self) {
        while self.pool.pop().is_some() {}
    }
}

pub static MESSAGE_POOL: Lazy<MessagePool> = Lazy::new(|| MessagePool::new(1024));

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn release_clears_and_acquire_reuses() {
        let pool = MessagePool::new(4);
        let mut msg = pool.acquire();
        msg.subjects.push(("orders".into(), Some("42".into())));
        msg.payload = Bytes::from_static(b"x");
        msg.sent_at_ms = 99;

        pool.release(msg);
        assert_eq!(pool.len(), 1);

        let reused = pool.acquire();
        assert!(reused.subjects.is_empty());
        assert!(reused.payload.is_empty());
        assert_eq!(reused.sent_at_ms, 0);
        assert!(pool.is_empty());
    }

    #[test]
    fn pool_never_grows_past_the_cap() {
        let pool = MessagePool::new(2);
        for _ in 0..5 {
            pool.release(Message::application(Vec::new(), Bytes::new()));
        }
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn clear_drains_the_pool() {
        let pool = MessagePool::new(8);
        for _ in 0..3 {
            pool.release(Message::application(Vec::new(), Bytes::new()));
        }
        pool.clear();
        assert!(pool.is_empty());
    }
}
