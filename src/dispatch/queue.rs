//! Bounded blocking queue with strict FIFO handoff.
//!
//! Blocked getters are served in arrival order through an explicit ticket
//! line: each waiter takes a ticket and only the head ticket may consume,
//! so a late-arriving getter can never overtake one already waiting.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    tickets: VecDeque<u64>,
    next_ticket: u64,
    accepting: bool,
}

#[derive(Debug)]
pub struct JobQueue<T> {
    inner: Mutex<Inner<T>>,
    takers: Condvar,
    putters: Condvar,
    capacity: usize,
}

impl<T> JobQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                tickets: VecDeque::new(),
                next_ticket: 0,
                accepting: true,
            }),
            takers: Condvar::new(),
            putters: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Block until the item is enqueued. A released queue drops the item.
    pub fn push(&self, item: T) {
        let mut inner = self.inner.lock();
        loop {
            if !inner.accepting {
                return;
            }
            if inner.items.len() < self.capacity {
                inner.items.push_back(item);
                self.takers.notify_all();
                return;
            }
            self.putters.wait(&mut inner);
        }
    }

    /// Like `push`, but give up after `timeout`. Returns whether the item
    /// was enqueued.
    pub fn push_timeout(&self, item: T, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if !inner.accepting {
                return false;
            }
            if inner.items.len() < self.capacity {
                inner.items.push_back(item);
                self.takers.notify_all();
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.putters.wait_until(&mut inner, deadline);
        }
    }

    /// Take the next item, waiting up to `timeout`. Returns `None` on
    /// timeout, or immediately once the queue has been released.
    pub fn get(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        if !inner.accepting {
            return None;
        }

        // Nobody waiting ahead: take without joining the line.
        if inner.tickets.is_empty() {
            if let Some(item) = inner.items.pop_front() {
                self.putters.notify_one();
                return Some(item);
            }
        }

        let ticket = inner.next_ticket;
        inner.next_ticket = inner.next_ticket.wrapping_add(1);
        inner.tickets.push_back(ticket);

        loop {
            if !inner.accepting {
                Self::drop_ticket(&mut inner, ticket);
                return None;
            }
            if inner.tickets.front() == Some(&ticket) {
                if let Some(item) = inner.items.pop_front() {
                    inner.tickets.pop_front();
                    // Let the next ticket holder check for a remaining item.
                    self.takers.notify_all();
                    self.putters.notify_one();
                    return Some(item);
                }
            }
            if Instant::now() >= deadline {
                Self::drop_ticket(&mut inner, ticket);
                self.takers.notify_all();
                return None;
            }
            self.takers.wait_until(&mut inner, deadline);
        }
    }

    fn drop_ticket(inner: &mut Inner<T>, ticket: u64) {
        if let Some(pos) = inner.tickets.iter().position(|t| *t == ticket) {
            inner.tickets.remove(pos);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Re-open a released queue.
    pub fn accept(&self) {
        self.inner.lock().accepting = true;
    }

    /// Stop accepting: wakes every blocked getter and putter, and makes
    /// every subsequent blocking wait return immediately.
    pub fn release(&self) {
        self.inner.lock().accepting = false;
        self.takers.notify_all();
        self.putters.notify_all();
    }
}

impl<T: Clone> JobQueue<T> {
    /// Clone of the head item without consuming it.
    pub fn peek(&self) -> Option<T> {
        self.inner.lock().items.front().cloned()
    }
}
