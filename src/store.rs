//! # Local Key-Value Store
//!
//! Time-stamped storage for values this node holds on behalf of the overlay.
//!
//! Every entry remembers when it was last touched; a background sweeper
//! deletes entries older than the staleness window every cleanup interval.
//! A successful FIND_VALUE with `update_timestamp` set touches the entry,
//! which is the overlay's refresh lever: values survive as long as readers
//! keep asking for them.
//!
//! `put` always copies the payload; the store never aliases caller buffers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::identity::NodeId;

/// How long an untouched entry survives (5 minutes).
pub const STALENESS_WINDOW: Duration = Duration::from_secs(5 * 60);

/// How often the sweeper scans for stale entries (10 seconds).
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

struct StoredValue {
    data: Vec<u8>,
    last_touched: Instant,
}

/// In-memory key-value store with staleness expiry.
///
/// One mutex guards the whole map; it is never held across an await point.
pub struct LocalStore {
    entries: Mutex<HashMap<NodeId, StoredValue>>,
    staleness_window: Duration,
    cleanup_interval: Duration,
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore {
    pub fn new() -> Self {
        Self::with_windows(STALENESS_WINDOW, CLEANUP_INTERVAL)
    }

    /// Construct with explicit expiry windows.
    pub fn with_windows(staleness_window: Duration, cleanup_interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            staleness_window,
            cleanup_interval,
        }
    }

    /// Insert or overwrite `key`, copying the payload and stamping now.
    pub fn put(&self, key: NodeId, value: &[u8]) {
        let mut entries = self.entries.lock().expect("store mutex poisoned");
        entries.insert(
            key,
            StoredValue {
                data: value.to_vec(),
                last_touched: Instant::now(),
            },
        );
    }

    /// Fetch the value under `key`, refreshing its timestamp iff `touch`.
    ///
    /// Entries past the staleness window are treated as already swept.
    pub fn get(&self, key: &NodeId, touch: bool) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock().expect("store mutex poisoned");
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last_touched) <= self.staleness_window => {
                if touch {
                    entry.last_touched = now;
                }
                Some(entry.data.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Remove `key`; returns whether it was present.
    pub fn delete(&self, key: &NodeId) -> bool {
        let mut entries = self.entries.lock().expect("store mutex poisoned");
        entries.remove(key).is_some()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("store mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep(&self) {
        let mut entries = self.entries.lock().expect("store mutex poisoned");
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.last_touched) <= self.staleness_window);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "swept stale entries");
        }
    }

    /// Spawn the background sweeper. Runs for the life of the process.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(store.cleanup_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                store.sweep();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn key(byte: u8) -> NodeId {
        let mut bytes = [0u8; 20];
        bytes[0] = byte;
        NodeId::from_bytes(bytes)
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let store = LocalStore::new();
        store.put(key(1), b"hello");
        assert_eq!(store.get(&key(1), false), Some(b"hello".to_vec()));
        assert_eq!(store.get(&key(2), false), None);
    }

    #[tokio::test]
    async fn put_copies_the_payload() {
        let store = LocalStore::new();
        let mut buf = b"original".to_vec();
        store.put(key(1), &buf);
        buf[0] = b'X';
        assert_eq!(store.get(&key(1), false), Some(b"original".to_vec()));
    }

    #[tokio::test]
    async fn put_overwrites() {
        let store = LocalStore::new();
        store.put(key(1), b"one");
        store.put(key(1), b"two");
        assert_eq!(store.get(&key(1), false), Some(b"two".to_vec()));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let store = LocalStore::new();
        store.put(key(1), b"v");
        assert!(store.delete(&key(1)));
        assert!(!store.delete(&key(1)));
        assert_eq!(store.get(&key(1), false), None);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_removes_stale_entries() {
        let store = Arc::new(LocalStore::new());
        store.spawn_sweeper();
        store.put(key(1), b"v");

        for _ in 0..36 {
            advance(Duration::from_secs(10)).await;
            tokio::task::yield_now().await;
        }

        assert_eq!(store.len(), 0);
        assert_eq!(store.get(&key(1), false), None);
    }

    #[tokio::test(start_paused = true)]
    async fn touch_extends_lifetime() {
        let store = Arc::new(LocalStore::new());
        store.spawn_sweeper();
        store.put(key(1), b"v");

        // Touch at T0+4min keeps the entry alive past T0+6min.
        advance(Duration::from_secs(4 * 60)).await;
        tokio::task::yield_now().await;
        assert_eq!(store.get(&key(1), true), Some(b"v".to_vec()));

        advance(Duration::from_secs(2 * 60)).await;
        tokio::task::yield_now().await;
        assert_eq!(store.get(&key(1), false), Some(b"v".to_vec()));

        // But it still dies once the window elapses with no further reads.
        advance(Duration::from_secs(6 * 60)).await;
        tokio::task::yield_now().await;
        assert_eq!(store.get(&key(1), false), None);
    }

    #[tokio::test(start_paused = true)]
    async fn get_does_not_resurrect_expired_entries() {
        // Even without the sweeper running, a read past the window misses.
        let store = LocalStore::new();
        store.put(key(1), b"v");
        advance(Duration::from_secs(6 * 60)).await;
        assert_eq!(store.get(&key(1), true), None);
        assert_eq!(store.len(), 0);
    }
}
