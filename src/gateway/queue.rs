//! Bounded tick queues with explicit overflow policy.
//!
//! The gateway→router queue drops the oldest droppable (non-trade) tick on
//! overflow so trade prints survive bursts of book churn; per-strategy
//! router queues drop oldest unconditionally. Drops are counted, never
//! silent, and the queue is never unbounded.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use tokio::sync::Notify;

use crate::models::{Tick, TickEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop the oldest tick regardless of kind.
    DropOldest,
    /// Drop the oldest `book`/`price_change` tick; keep trades.
    DropOldestBook,
}

pub struct TickQueue {
    inner: Mutex<VecDeque<Tick>>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl TickQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: capacity.max(1),
            policy,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Enqueue a tick, applying the overflow policy. Returns false when the
    /// tick itself was dropped.
    pub fn push(&self, tick: Tick) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let accepted = {
            let mut q = self.inner.lock();
            if q.len() < self.capacity {
                q.push_back(tick);
                true
            } else {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        q.pop_front();
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        q.push_back(tick);
                        true
                    }
                    OverflowPolicy::DropOldestBook => {
                        let oldest_book = q.iter().position(|t| t.event != TickEvent::Trade);
                        match oldest_book {
                            Some(idx) => {
                                q.remove(idx);
                                self.dropped.fetch_add(1, Ordering::Relaxed);
                                q.push_back(tick);
                                true
                            }
                            None if tick.event != TickEvent::Trade => {
                                // Queue is all trades; the incoming book
                                // tick is the droppable one.
                                self.dropped.fetch_add(1, Ordering::Relaxed);
                                false
                            }
                            None => {
                                q.pop_front();
                                self.dropped.fetch_add(1, Ordering::Relaxed);
                                q.push_back(tick);
                                true
                            }
                        }
                    }
                }
            }
        };
        if accepted {
            self.notify.notify_one();
        }
        accepted
    }

    /// Receive the next tick; `None` once the queue is closed and drained.
    /// Single-consumer.
    pub async fn recv(&self) -> Option<Tick> {
        loop {
            let notified = self.notify.notified();
            if let Some(tick) = self.inner.lock().pop_front() {
                return Some(tick);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Drain without waiting. Used during shutdown.
    pub fn try_recv(&self) -> Option<Tick> {
        self.inner.lock().pop_front()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
