//! In-process store for tests and single-node development.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::endpoint::Endpoint;
use super::store::{Connector, KvPair, Store, StoreError};

/// Map-backed [`Store`] with failure injection.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    data: BTreeMap<String, String>,
    ttls: HashMap<String, Duration>,
    writes: HashMap<String, usize>,
    watchers: Vec<Watcher>,
    fail_writes: bool,
    fail_watches: bool,
}

struct Watcher {
    prefix: String,
    tx: watch::Sender<Vec<KvPair>>,
}

impl MemoryState {
    fn subtree(&self, prefix: &str) -> Vec<KvPair> {
        self.data
            .iter()
            .filter(|(k, _)| in_subtree(prefix, k))
            .map(|(k, v)| KvPair::new(k.clone(), v.clone()))
            .collect()
    }

    fn notify(&mut self, key: &str) {
        let mut watchers = std::mem::take(&mut self.watchers);
        watchers.retain(|w| {
            if in_subtree(&w.prefix, key) {
                w.tx.send_replace(self.subtree(&w.prefix));
            }
            !w.tx.is_closed()
        });
        self.watchers = watchers;
    }
}

fn in_subtree(prefix: &str, key: &str) -> bool {
    key == prefix
        || key
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current value at `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().data.get(key).cloned()
    }

    /// TTL of the last write at `key`, if it had one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.lock().ttls.get(key).copied()
    }

    /// Number of successful writes at `key`.
    pub fn writes(&self, key: &str) -> usize {
        self.lock().writes.get(key).copied().unwrap_or(0)
    }

    /// All stored keys.
    pub fn keys(&self) -> Vec<String> {
        self.lock().data.keys().cloned().collect()
    }

    /// Number of open watches.
    pub fn watcher_count(&self) -> usize {
        let mut state = self.lock();
        state.watchers.retain(|w| !w.tx.is_closed());
        state.watchers.len()
    }

    /// Write a key as another cluster member would.
    pub fn insert(&self, key: &str, value: &str) {
        let mut state = self.lock();
        state.data.insert(key.to_string(), value.to_string());
        state.notify(key);
    }

    /// Remove a key as another cluster member would.
    pub fn remove(&self, key: &str) {
        let mut state = self.lock();
        if state.data.remove(key).is_some() {
            state.notify(key);
        }
    }

    /// Close every open watch.
    pub fn drop_watchers(&self) {
        let dropped = std::mem::take(&mut self.lock().watchers);
        debug!(count = dropped.len(), "Dropping memory watchers");
    }

    /// Make `put` and `delete` fail.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Make `watch_tree` fail.
    pub fn fail_watches(&self, fail: bool) {
        self.lock().fail_watches = fail;
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn watch_tree(&self, prefix: &str) -> Result<mpsc::Receiver<Vec<KvPair>>, StoreError> {
        let mut state = self.lock();
        if state.fail_watches {
            return Err(StoreError::Unavailable("watches disabled".to_string()));
        }
        let subtree = state.subtree(prefix);
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(subtree.clone());
        let (latest_tx, latest_rx) = watch::channel(subtree);
        tokio::spawn(forward_latest(latest_rx, tx));
        state.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx: latest_tx,
        });
        Ok(rx)
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        state.data.insert(key.to_string(), value.to_string());
        match ttl {
            Some(ttl) => state.ttls.insert(key.to_string(), ttl),
            None => state.ttls.remove(key),
        };
        *state.writes.entry(key.to_string()).or_default() += 1;
        state.notify(key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        if state.data.remove(key).is_none() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        state.ttls.remove(key);
        state.notify(key);
        Ok(())
    }
}

/// Deliver the newest subtree whenever the receiver has room for it.
async fn forward_latest(mut latest: watch::Receiver<Vec<KvPair>>, tx: mpsc::Sender<Vec<KvPair>>) {
    loop {
        tokio::select! {
            changed = latest.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            () = tx.closed() => return,
        }
        let pairs = latest.borrow_and_update().clone();
        if tx.send(pairs).await.is_err() {
            return;
        }
    }
}

/// Connector handing out a shared [`MemoryStore`] for `memory://` URLs.
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
    failures: AtomicUsize,
    attempts: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(store: Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            failures: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        })
    }

    /// Fail the next `count` connection attempts.
    pub fn fail_connects(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Number of connection attempts so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn supports(&self, scheme: &str) -> bool {
        scheme == "memory"
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Store>, StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable(endpoint.addresses().join(",")));
        }
        Ok(self.store.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_watch_delivers_subtree_on_change() {
        let store = MemoryStore::new();
        store.insert("plinth/nodes/a", "1");
        store.insert("plinth/nodesx", "ignored");

        let mut rx = store.watch_tree("plinth/nodes").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![KvPair::new("plinth/nodes/a", "1")]);

        store.insert("plinth/other", "x");
        store.put("plinth/nodes/b", "2", None).await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            vec![
                KvPair::new("plinth/nodes/a", "1"),
                KvPair::new("plinth/nodes/b", "2"),
            ]
        );

        store.drop_watchers();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_slow_watcher_sees_latest_subtree() {
        let store = MemoryStore::new();
        let mut rx = store.watch_tree("plinth/nodes").await.unwrap();

        for i in 0..200 {
            store.insert(&format!("plinth/nodes/{i:03}"), "x");
        }

        let latest = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let pairs = rx.recv().await.unwrap();
                if pairs.len() == 200 {
                    return pairs;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(latest.last(), Some(&KvPair::new("plinth/nodes/199", "x")));
    }

    #[tokio::test]
    async fn test_delete_missing_key_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.delete("plinth/missing").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_put_records_ttl() {
        let store = MemoryStore::new();
        store
            .put("plinth/nodes/a", "{}", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(store.ttl("plinth/nodes/a"), Some(Duration::from_secs(10)));
        store.put("plinth/nodes/a", "{}", None).await.unwrap();
        assert_eq!(store.ttl("plinth/nodes/a"), None);
        assert_eq!(store.writes("plinth/nodes/a"), 2);
    }

    #[tokio::test]
    async fn test_connector_failures() {
        let connector = MemoryConnector::new(MemoryStore::new());
        let endpoint = Endpoint::parse("memory://local/plinth").unwrap();
        connector.fail_connects(2);

        assert!(connector.connect(&endpoint).await.is_err());
        assert!(connector.connect(&endpoint).await.is_err());
        assert!(connector.connect(&endpoint).await.is_ok());
        assert_eq!(connector.attempts(), 3);
        assert!(connector.supports("memory"));
        assert!(!connector.supports("consul"));
    }
}
