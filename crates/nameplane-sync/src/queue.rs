//! Bounded work deque feeding the pull workers.
//!
//! Enqueueing when full drops the oldest entry: staleness is traded for
//! liveness, and downstream pulls are idempotent so coalescing and loss
//! are both harmless.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1 << 20;

/// One divergent service to pull from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceKey {
    pub namespace_id: String,
    pub service_name: String,
    pub peer_addr: String,
    pub checksum: String,
}

/// Bounded FIFO with drop-oldest overflow. The push side runs under one
/// lock so the drop-then-push fallback is atomic.
pub struct UpdateQueue {
    deque: Mutex<VecDeque<ServiceKey>>,
    notify: Notify,
    capacity: usize,
}

impl UpdateQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            deque: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        }
    }

    pub fn push(&self, key: ServiceKey) {
        {
            let mut deque = self.deque.lock();
            if deque.len() >= self.capacity {
                let dropped = deque.pop_front();
                warn!(
                    service = %key.service_name,
                    dropped = ?dropped.map(|k| k.service_name),
                    "update queue full, dropping oldest entry"
                );
            }
            deque.push_back(key);
        }
        self.notify.notify_one();
    }

    /// Wait for and remove the oldest entry.
    pub async fn take(&self) -> ServiceKey {
        loop {
            if let Some(key) = self.deque.lock().pop_front() {
                return key;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.deque.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.deque.lock().is_empty()
    }
}

impl Default for UpdateQueue {
    fn default() -> Self {
        Self::new()
    }
}
