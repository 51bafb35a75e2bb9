//! Time-bounded log of sent application messages, replayed on `StartReceive`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::message::{current_timestamp, Message};
use crate::core::pool::{MessagePool, MESSAGE_POOL};

/// Append-only send log with lazy, retention-window eviction.
///
/// The engine appends exactly once per publish, after every targeted write
/// has been attempted; with no connected candidates the message is appended
/// immediately without transmission.
#[derive(Debug)]
pub struct ReplayCache {
    retention_ms: u64,
    entries: Mutex<VecDeque<Arc<Message>>>,
    pool: Option<Arc<MessagePool>>,
}

impl ReplayCache {
    /// Cache recycling into the global message pool.
    pub fn new(retention: Duration) -> Self {
        Self {
            retention_ms: retention.as_millis() as u64,
            entries: Mutex::new(VecDeque::new()),
            pool: None,
        }
    }

    /// Cache recycling into a caller-owned pool.
    pub fn with_pool(retention: Duration, pool: Arc<MessagePool>) -> Self {
        Self {
            retention_ms: retention.as_millis() as u64,
            entries: Mutex::new(VecDeque::new()),
            pool: Some(pool),
        }
    }

    fn recycle(&self, msg: Message) {
        match &self.pool {
            Some(pool) => pool.release(msg),
            None => MESSAGE_POOL.release(msg),
        }
    }

    pub fn append(&self, msg: Arc<Message>) {
        let cutoff = current_timestamp().saturating_sub(self.retention_ms);
        let mut entries = self.entries.lock();
        entries.push_back(msg);
        while entries.front().is_some_and(|m| m.sent_at_ms < cutoff) {
            if let Some(evicted) = entries.pop_front() {
                // Recycle when the cache held the last reference.
                if let Ok(msg) = Arc::try_unwrap(evicted) {
                    self.recycle(msg);
                }
            }
        }
    }

    /// Every cached entry with `sent_at_ms >= from_ms`, in cache order.
    pub fn replay_from(&self, from_ms: u64) -> Vec<Arc<Message>> {
        self.entries
            .lock()
            .iter()
            .filter(|m| m.sent_at_ms >= from_ms)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
