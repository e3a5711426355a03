//! Destination Stream: per-destination gate, dedup and forward step.
//!
//! One instance per live destination. Runs synchronously on the informer
//! task, so `handle` must never block.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use reverser_types::{Operation, ResourceIdentifier, WatchEvent};

use crate::router::DestinationKey;
use crate::worker::{BranchWorkerHandle, Envelope};

struct DedupEntry {
    operation: Operation,
    content_hash: u64,
}

/// Gate + dedup + forward for one `(repo, branch, baseFolder)` destination.
pub struct DestinationStream {
    key: DestinationKey,
    gate_open: AtomicBool,
    dedup_cache: DashMap<ResourceIdentifier, DedupEntry>,
    worker: Arc<BranchWorkerHandle>,
}

impl DestinationStream {
    pub fn new(key: DestinationKey, worker: Arc<BranchWorkerHandle>) -> Self {
        Self {
            key,
            gate_open: AtomicBool::new(false),
            dedup_cache: DashMap::new(),
            worker,
        }
    }

    pub fn key(&self) -> &DestinationKey {
        &self.key
    }

    /// Open the gate once initial reconciliation for this destination has
    /// completed (Reconciler Manager's `Seeding → Steady` transition).
    pub fn open_gate(&self) {
        self.gate_open.store(true, Ordering::Release);
    }

    pub fn close_gate(&self) {
        self.gate_open.store(false, Ordering::Release);
    }

    pub fn is_gate_open(&self) -> bool {
        self.gate_open.load(Ordering::Acquire)
    }

    /// Gate, dedup, and forward one event. Dedup is stream-scoped: suppress
    /// only if the last-forwarded event for this identifier had the same
    /// operation and canonical object content.
    pub fn handle(&self, event: WatchEvent, base_folder: &str) {
        if !self.is_gate_open() {
            return;
        }

        let content_hash = hash_object(&event.object);
        if let Some(previous) = self.dedup_cache.get(&event.identifier) {
            if previous.operation == event.operation && previous.content_hash == content_hash {
                return;
            }
        }
        self.dedup_cache.insert(
            event.identifier.clone(),
            DedupEntry {
                operation: event.operation,
                content_hash,
            },
        );

        self.worker.enqueue(Envelope {
            identifier: event.identifier,
            operation: event.operation,
            object: event.object,
            base_folder: base_folder.to_string(),
        });
    }
}

fn hash_object(object: &serde_json::Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    object.to_string().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reverser_types::UserInfo;
    use serde_json::json;

    fn event(name: &str, op: Operation, data: &str) -> WatchEvent {
        WatchEvent {
            object: json!({"metadata": {"name": name}, "data": data}),
            identifier: ResourceIdentifier::new("", "v1", "configmaps", "team-a", name),
            operation: op,
            user: UserInfo::default(),
            timestamp: chrono::Utc::now(),
        }
    }

    fn stream() -> (DestinationStream, tokio::sync::mpsc::Receiver<Envelope>) {
        let (handle, mailbox) = BranchWorkerHandle::new(16, 64);
        let key = ("repo-1".to_string(), "main".to_string(), "clusters/a".to_string());
        (DestinationStream::new(key, Arc::new(handle)), mailbox)
    }

    #[tokio::test]
    async fn closed_gate_drops_events() {
        let (stream, mut mailbox) = stream();
        stream.handle(event("cfg", Operation::Create, "v1"), "clusters/a");
        assert!(mailbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn open_gate_forwards_events() {
        let (stream, mut mailbox) = stream();
        stream.open_gate();
        stream.handle(event("cfg", Operation::Create, "v1"), "clusters/a");
        let envelope = mailbox.recv().await.expect("forwarded");
        assert_eq!(envelope.identifier.name, "cfg");
    }

    #[tokio::test]
    async fn identical_repeat_is_deduplicated() {
        let (stream, mut mailbox) = stream();
        stream.open_gate();
        stream.handle(event("cfg", Operation::Update, "v1"), "clusters/a");
        stream.handle(event("cfg", Operation::Update, "v1"), "clusters/a");

        assert!(mailbox.recv().await.is_some());
        assert!(mailbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn changed_content_is_forwarded_again() {
        let (stream, mut mailbox) = stream();
        stream.open_gate();
        stream.handle(event("cfg", Operation::Update, "v1"), "clusters/a");
        stream.handle(event("cfg", Operation::Update, "v2"), "clusters/a");

        assert!(mailbox.recv().await.is_some());
        assert!(mailbox.recv().await.is_some());
    }
}
