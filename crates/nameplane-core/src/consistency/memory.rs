//! In-memory consistency engine.
//!
//! Single-node implementation of the [`ConsistencyService`] contract:
//! standalone deployments run on it directly and tests use it as the
//! backend. Change and delete notifications are dispatched from a
//! dedicated notifier task, never from the writer's stack, so a listener
//! can safely call back into the store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::{ConsistencyService, Datum, Record, RecordListener};
use crate::error::{NamingError, NamingResult};

enum Event {
    Change(String),
    Delete(String),
}

struct ListenerEntry {
    /// Exact key, or a key prefix for wildcard subscriptions.
    key: String,
    /// Stable identity of the listener allocation, for unlisten.
    id: usize,
    listener: Weak<dyn RecordListener>,
}

struct Shared {
    data: DashMap<String, Datum>,
    listeners: Mutex<Vec<ListenerEntry>>,
    pending: AtomicU64,
}

impl Shared {
    /// Live listeners whose subscription covers `key` and that declare
    /// interest in it. Dead entries are pruned on the way.
    fn interested(&self, key: &str) -> Vec<Arc<dyn RecordListener>> {
        let mut entries = self.listeners.lock();
        entries.retain(|e| e.listener.strong_count() > 0);
        entries
            .iter()
            .filter(|e| key == e.key || key.starts_with(&e.key))
            .filter_map(|e| e.listener.upgrade())
            .filter(|l| l.interests(key))
            .collect()
    }
}

/// In-memory, single-node consistency store with asynchronous
/// notification.
pub struct MemoryConsistency {
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<Event>,
    notifier: JoinHandle<()>,
    stamp: AtomicU64,
}

impl MemoryConsistency {
    /// Create the store and start its notifier task. Must be called from
    /// within a tokio runtime.
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            data: DashMap::new(),
            listeners: Mutex::new(Vec::new()),
            pending: AtomicU64::new(0),
        });
        let (events, rx) = mpsc::unbounded_channel();
        let notifier = tokio::spawn(notify_loop(Arc::clone(&shared), rx));
        Self {
            shared,
            events,
            notifier,
            stamp: AtomicU64::new(0),
        }
    }

    fn emit(&self, event: Event) -> NamingResult<()> {
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        self.events.send(event).map_err(|_| {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
            NamingError::Consistency("notifier has shut down".to_string())
        })
    }

    /// Wait until every queued notification has been dispatched.
    pub async fn settle(&self) {
        while self.shared.pending.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
    }
}

impl Default for MemoryConsistency {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryConsistency {
    fn drop(&mut self) {
        self.notifier.abort();
    }
}

async fn notify_loop(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = rx.recv().await {
        match &event {
            Event::Change(key) => {
                let datum = shared.data.get(key).map(|d| d.value().clone());
                if let Some(datum) = datum {
                    for listener in shared.interested(key) {
                        if let Err(e) = listener.on_change(key, datum.value.clone()).await {
                            error!(%key, error = %e, "listener failed on change");
                        }
                    }
                }
            }
            Event::Delete(key) => {
                for listener in shared.interested(key) {
                    if let Err(e) = listener.on_delete(key).await {
                        error!(%key, error = %e, "listener failed on delete");
                    }
                }
            }
        }
        shared.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

fn listener_id(listener: &Arc<dyn RecordListener>) -> usize {
    Arc::as_ptr(listener) as *const () as usize
}

#[async_trait]
impl ConsistencyService for MemoryConsistency {
    async fn put(&self, key: &str, value: Record) -> NamingResult<()> {
        let timestamp = self.stamp.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.data.insert(
            key.to_string(),
            Datum {
                key: key.to_string(),
                value,
                timestamp,
            },
        );
        debug!(%key, timestamp, "datum stored");
        self.emit(Event::Change(key.to_string()))
    }

    async fn remove(&self, key: &str) -> NamingResult<()> {
        if self.shared.data.remove(key).is_some() {
            debug!(%key, "datum removed");
        }
        self.emit(Event::Delete(key.to_string()))
    }

    async fn get(&self, key: &str) -> NamingResult<Option<Datum>> {
        Ok(self.shared.data.get(key).map(|d| d.value().clone()))
    }

    async fn listen(&self, key: &str, listener: Arc<dyn RecordListener>) -> NamingResult<()> {
        let id = listener_id(&listener);
        let mut entries = self.shared.listeners.lock();
        if entries.iter().any(|e| e.key == key && e.id == id) {
            return Ok(());
        }
        entries.push(ListenerEntry {
            key: key.to_string(),
            id,
            listener: Arc::downgrade(&listener),
        });
        Ok(())
    }

    async fn unlisten(&self, key: &str, listener: &Arc<dyn RecordListener>) -> NamingResult<()> {
        let id = listener_id(listener);
        self.shared
            .listeners
            .lock()
            .retain(|e| !(e.key == key && e.id == id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consistency::Instances;
    use crate::instance::Instance;

    struct Recorder {
        changes: Mutex<Vec<String>>,
        deletes: Mutex<Vec<String>>,
        fail: bool,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                changes: Mutex::new(Vec::new()),
                deletes: Mutex::new(Vec::new()),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                changes: Mutex::new(Vec::new()),
                deletes: Mutex::new(Vec::new()),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl RecordListener for Recorder {
        fn interests(&self, _key: &str) -> bool {
            true
        }

        fn match_unlisten_key(&self, _key: &str) -> bool {
            true
        }

        async fn on_change(&self, key: &str, _value: Record) -> NamingResult<()> {
            self.changes.lock().push(key.to_string());
            if self.fail {
                return Err(NamingError::Fatal("boom".to_string()));
            }
            Ok(())
        }

        async fn on_delete(&self, key: &str) -> NamingResult<()> {
            self.deletes.lock().push(key.to_string());
            Ok(())
        }
    }

    fn record() -> Record {
        Record::Instances(Instances {
            instance_list: vec![Instance::new("10.0.0.1", 80)],
        })
    }

    #[tokio::test]
    async fn put_notifies_exact_listener() {
        let store = MemoryConsistency::new();
        let recorder = Recorder::new();
        store.listen("k1", recorder.clone()).await.unwrap();

        store.put("k1", record()).await.unwrap();
        store.put("k2", record()).await.unwrap();
        store.settle().await;

        assert_eq!(*recorder.changes.lock(), vec!["k1".to_string()]);
    }

    #[tokio::test]
    async fn prefix_listener_sees_all_keys_under_it() {
        let store = MemoryConsistency::new();
        let recorder = Recorder::new();
        store.listen("prefix.", recorder.clone()).await.unwrap();

        store.put("prefix.a", record()).await.unwrap();
        store.put("prefix.b", record()).await.unwrap();
        store.put("other", record()).await.unwrap();
        store.settle().await;

        assert_eq!(recorder.changes.lock().len(), 2);
    }

    #[tokio::test]
    async fn remove_notifies_delete() {
        let store = MemoryConsistency::new();
        let recorder = Recorder::new();
        store.listen("k1", recorder.clone()).await.unwrap();

        store.put("k1", record()).await.unwrap();
        store.remove("k1").await.unwrap();
        store.settle().await;

        assert_eq!(*recorder.deletes.lock(), vec!["k1".to_string()]);
        assert!(store.get("k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unlisten_stops_delivery() {
        let store = MemoryConsistency::new();
        let recorder = Recorder::new();
        store.listen("k1", recorder.clone()).await.unwrap();
        let as_dyn: Arc<dyn RecordListener> = recorder.clone();
        store.unlisten("k1", &as_dyn).await.unwrap();

        store.put("k1", record()).await.unwrap();
        store.settle().await;

        assert!(recorder.changes.lock().is_empty());
    }

    #[tokio::test]
    async fn listen_is_idempotent() {
        let store = MemoryConsistency::new();
        let recorder = Recorder::new();
        store.listen("k1", recorder.clone()).await.unwrap();
        store.listen("k1", recorder.clone()).await.unwrap();

        store.put("k1", record()).await.unwrap();
        store.settle().await;

        assert_eq!(recorder.changes.lock().len(), 1);
    }

    #[tokio::test]
    async fn failing_listener_does_not_silence_others() {
        let store = MemoryConsistency::new();
        let bad = Recorder::failing();
        let good = Recorder::new();
        store.listen("k1", bad.clone()).await.unwrap();
        store.listen("k1", good.clone()).await.unwrap();

        store.put("k1", record()).await.unwrap();
        store.put("k1", record()).await.unwrap();
        store.settle().await;

        assert_eq!(good.changes.lock().len(), 2);
        assert_eq!(bad.changes.lock().len(), 2);
    }

    #[tokio::test]
    async fn get_returns_latest_write() {
        let store = MemoryConsistency::new();
        store.put("k1", record()).await.unwrap();
        let first = store.get("k1").await.unwrap().unwrap().timestamp;

        store.put("k1", record()).await.unwrap();
        let second = store.get("k1").await.unwrap().unwrap().timestamp;
        assert!(second > first);
    }
}
