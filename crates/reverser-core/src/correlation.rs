//! Correlation Store: bounded TTL cache of admission-time metadata, keyed
//! by resource fingerprint.
//!
//! Write-only from the admission path, consume-once from the watch path.
//! Absence of an entry is never an error. Sharded by fingerprint hash using
//! `dashmap` rather than a single mutex, so inserts and takes from unrelated
//! fingerprints never contend.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use reverser_types::{ResourceFingerprint, UserInfo};
use tokio::sync::Mutex as AsyncMutex;

struct Entry {
    user: UserInfo,
    inserted_at: Instant,
    sequence: u64,
}

/// Callback invoked once per eviction (TTL expiry, LRU eviction, or
/// explicit take). Used to drive the `correlation_evictions` counter.
pub type EvictionCallback = Arc<dyn Fn() + Send + Sync>;

pub struct CorrelationStore {
    entries: DashMap<ResourceFingerprint, Entry>,
    capacity: usize,
    ttl: Duration,
    sequence: std::sync::atomic::AtomicU64,
    on_evict: Option<EvictionCallback>,
    insertion_order: AsyncMutex<std::collections::VecDeque<(ResourceFingerprint, u64)>>,
}

impl CorrelationStore {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
            ttl,
            sequence: std::sync::atomic::AtomicU64::new(0),
            on_evict: None,
            insertion_order: AsyncMutex::new(std::collections::VecDeque::new()),
        }
    }

    pub fn with_eviction_callback(mut self, callback: EvictionCallback) -> Self {
        self.on_evict = Some(callback);
        self
    }

    fn notify_evicted(&self) {
        if let Some(cb) = &self.on_evict {
            cb();
        }
    }

    /// Insert or overwrite an entry. If the store is at capacity, evict the
    /// oldest entry by insertion order first (approximate LRU).
    pub async fn put(&self, fingerprint: ResourceFingerprint, user: UserInfo) {
        self.sweep_expired();

        if self.entries.len() >= self.capacity && !self.entries.contains_key(&fingerprint) {
            self.evict_oldest().await;
        }

        let sequence = self.sequence.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.entries.insert(
            fingerprint.clone(),
            Entry {
                user,
                inserted_at: Instant::now(),
                sequence,
            },
        );
        self.insertion_order.lock().await.push_back((fingerprint, sequence));
    }

    /// Consume an entry if present and unexpired. The entry is removed
    /// either way (consume-once semantics) if present.
    pub fn take_and_delete(&self, fingerprint: &ResourceFingerprint) -> Option<UserInfo> {
        let (_, entry) = self.entries.remove(fingerprint)?;
        if entry.inserted_at.elapsed() > self.ttl {
            self.notify_evicted();
            return None;
        }
        Some(entry.user)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lazily drop expired entries. Called both on insert and by the
    /// background sweeper at `ttl/4` intervals.
    pub fn sweep_expired(&self) {
        let ttl = self.ttl;
        let expired: Vec<ResourceFingerprint> = self
            .entries
            .iter()
            .filter(|entry| entry.inserted_at.elapsed() > ttl)
            .map(|entry| entry.key().clone())
            .collect();

        for fingerprint in expired {
            if self.entries.remove(&fingerprint).is_some() {
                self.notify_evicted();
            }
        }
    }

    async fn evict_oldest(&self) {
        let mut order = self.insertion_order.lock().await;
        while let Some((fingerprint, sequence)) = order.pop_front() {
            if let Some(entry) = self.entries.get(&fingerprint) {
                if entry.sequence == sequence {
                    drop(entry);
                    self.entries.remove(&fingerprint);
                    self.notify_evicted();
                    return;
                }
            }
        }
    }

    /// Run the background sweeper until `cancel` fires, at `ttl/4` cadence.
    pub async fn run_sweeper(self: Arc<Self>, cancel: tokio_util::sync::CancellationToken) {
        let interval = (self.ttl / 4).max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("correlation store sweeper stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.sweep_expired();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reverser_types::{Operation, ResourceIdentifier};

    fn fingerprint(name: &str) -> ResourceFingerprint {
        ResourceFingerprint::new(
            ResourceIdentifier::new("apps", "v1", "deployments", "team-a", name),
            Operation::Create,
        )
    }

    #[tokio::test]
    async fn put_then_take_returns_user() {
        let store = CorrelationStore::new(10, Duration::from_secs(60));
        let fp = fingerprint("web");
        store
            .put(
                fp.clone(),
                UserInfo {
                    username: "alice".to_string(),
                    uid: "u-1".to_string(),
                },
            )
            .await;

        let user = store.take_and_delete(&fp).expect("entry present");
        assert_eq!(user.username, "alice");
        assert!(store.take_and_delete(&fp).is_none());
    }

    #[tokio::test]
    async fn expired_entry_is_not_returned() {
        let store = CorrelationStore::new(10, Duration::from_millis(10));
        let fp = fingerprint("web");
        store.put(fp.clone(), UserInfo::default()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.take_and_delete(&fp).is_none());
    }

    #[tokio::test]
    async fn eviction_callback_fires_on_capacity_overflow() {
        let evicted = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let evicted_clone = evicted.clone();
        let store = CorrelationStore::new(2, Duration::from_secs(60))
            .with_eviction_callback(Arc::new(move || {
                evicted_clone.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }));

        store.put(fingerprint("a"), UserInfo::default()).await;
        store.put(fingerprint("b"), UserInfo::default()).await;
        store.put(fingerprint("c"), UserInfo::default()).await;

        assert_eq!(evicted.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn missing_entry_is_not_an_error() {
        let store = CorrelationStore::new(10, Duration::from_secs(60));
        assert!(store.take_and_delete(&fingerprint("nonexistent")).is_none());
    }
}
