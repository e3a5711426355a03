//! Branch Worker: single-consumer commit loop for one `(repo, branch)`.
//!
//! Accumulates envelopes into a batch, collapses per identifier, and pushes
//! through the Git Repository Facade with bounded retries. Backpressure is
//! handled by a bounded mailbox plus a capped overflow buffer that never
//! drops a pending DELETE.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reverser_retry::{BackoffConfig, RetryDecision};
use reverser_types::{CommitBatch, CommitItem, Operation, ResourceIdentifier};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::GitError;
use crate::git::GitFacade;
use crate::metrics::Metrics;

/// A WatchEvent paired with the destination context needed to apply it.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub identifier: ResourceIdentifier,
    pub operation: Operation,
    pub object: serde_json::Value,
    pub base_folder: String,
}

/// Collapse `incoming` onto `existing` for the same identifier. Plain
/// last-write-wins: the most recently observed state is definitionally the
/// correct one to apply.
fn collapse_batch(existing: Option<Envelope>, incoming: Envelope) -> Envelope {
    let _ = existing;
    incoming
}

/// Collapse onto the overflow buffer. Unlike batch collapse, an existing
/// pending DELETE is never overwritten by a later CREATE/UPDATE: losing
/// track of a deletion while under backpressure would leave a stale file
/// in Git.
fn collapse_overflow(existing: Option<Envelope>, incoming: Envelope) -> Envelope {
    match existing {
        Some(existing) if existing.operation == Operation::Delete => existing,
        _ => incoming,
    }
}

/// Sender-side handle shared by every Destination Stream that forwards to
/// this worker. Holds the bounded mailbox plus the overflow buffer.
pub struct BranchWorkerHandle {
    sender: mpsc::Sender<Envelope>,
    overflow: Mutex<HashMap<ResourceIdentifier, Envelope>>,
    overflow_capacity: usize,
}

impl BranchWorkerHandle {
    /// `mailbox_capacity` is `M`; overflow is capped at `M*4` distinct
    /// identifiers per the default backpressure policy.
    pub fn new(mailbox_capacity: usize, overflow_capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (sender, receiver) = mpsc::channel(mailbox_capacity);
        (
            Self {
                sender,
                overflow: Mutex::new(HashMap::new()),
                overflow_capacity,
            },
            receiver,
        )
    }

    /// Non-blocking enqueue. On mailbox backpressure, spill into the
    /// overflow buffer instead of blocking the caller (the informer task).
    pub fn enqueue(&self, envelope: Envelope) {
        match self.sender.try_send(envelope) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                self.spill(envelope);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("branch worker mailbox closed, dropping envelope");
            }
        }
    }

    fn spill(&self, envelope: Envelope) {
        let Ok(mut overflow) = self.overflow.try_lock() else {
            tracing::warn!("overflow buffer contended, dropping envelope under backpressure");
            return;
        };
        let identifier = envelope.identifier.clone();
        let existing = overflow.remove(&identifier);
        let merged = collapse_overflow(existing, envelope);
        if overflow.len() >= self.overflow_capacity && !overflow.contains_key(&identifier) {
            tracing::warn!("overflow buffer at capacity, dropping oldest spilled envelope");
            if let Some(oldest_key) = overflow.keys().next().cloned() {
                overflow.remove(&oldest_key);
            }
        }
        overflow.insert(identifier, merged);
    }

    /// Drain anything sitting in the overflow buffer back into the
    /// mailbox, called by the worker loop once room frees up.
    async fn drain_overflow_into(&self, target: &mpsc::Sender<Envelope>) {
        let mut overflow = self.overflow.lock().await;
        let pending: Vec<Envelope> = overflow.drain().map(|(_, v)| v).collect();
        drop(overflow);
        for envelope in pending {
            if target.send(envelope).await.is_err() {
                return;
            }
        }
    }
}

/// Reported by the worker to the Reconciler Manager on fatal failure.
#[derive(Debug, Clone)]
pub struct WorkerFault {
    pub repo_ref: String,
    pub branch: String,
    pub reason: String,
}

pub type FaultSender = mpsc::Sender<WorkerFault>;

/// Owns the mailbox receiver and drives the accumulate/collapse/push loop.
pub struct BranchWorker {
    repo_ref: String,
    branch: String,
    mailbox: mpsc::Receiver<Envelope>,
    handle: Arc<BranchWorkerHandle>,
    git: Arc<GitFacade>,
    backoff: BackoffConfig,
    max_batch: usize,
    flush_interval: Duration,
    shutdown_timeout: Duration,
    metrics: Arc<Metrics>,
    faulted: Arc<AtomicBool>,
    fault_sender: FaultSender,
}

impl BranchWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo_ref: String,
        branch: String,
        mailbox: mpsc::Receiver<Envelope>,
        handle: Arc<BranchWorkerHandle>,
        git: Arc<GitFacade>,
        backoff: BackoffConfig,
        max_batch: usize,
        flush_interval: Duration,
        shutdown_timeout: Duration,
        metrics: Arc<Metrics>,
        fault_sender: FaultSender,
    ) -> Self {
        Self {
            repo_ref,
            branch,
            mailbox,
            handle,
            git,
            backoff,
            max_batch,
            flush_interval,
            shutdown_timeout,
            metrics,
            faulted: Arc::new(AtomicBool::new(false)),
            fault_sender,
        }
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Relaxed)
    }

    /// Drive the worker until `cancel` fires. On cancellation, drains the
    /// pending batch and attempts one final push within `shutdown_timeout`.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut pending: HashMap<ResourceIdentifier, Envelope> = HashMap::new();
        let mut flush_deadline: Option<tokio::time::Instant> = None;

        loop {
            let sleep = match flush_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline),
                None => tokio::time::sleep(Duration::from_secs(3600)),
            };
            tokio::pin!(sleep);

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.final_drain(pending).await;
                    return;
                }
                envelope = self.mailbox.recv() => {
                    match envelope {
                        Some(envelope) => {
                            if flush_deadline.is_none() {
                                flush_deadline = Some(tokio::time::Instant::now() + self.flush_interval);
                            }
                            let identifier = envelope.identifier.clone();
                            let existing = pending.remove(&identifier);
                            pending.insert(identifier, collapse_batch(existing, envelope));

                            if pending.len() >= self.max_batch {
                                self.push_cycle(std::mem::take(&mut pending)).await;
                                flush_deadline = None;
                            }
                        }
                        None => {
                            self.final_drain(pending).await;
                            return;
                        }
                    }
                }
                _ = &mut sleep, if flush_deadline.is_some() => {
                    if !pending.is_empty() {
                        self.push_cycle(std::mem::take(&mut pending)).await;
                    }
                    flush_deadline = None;
                }
            }

            self.handle.drain_overflow_into(&self.mailbox_sender()).await;
            self.metrics.set_commit_queue_size(&self.repo_ref, &self.branch, pending.len() as i64);
        }
    }

    fn mailbox_sender(&self) -> mpsc::Sender<Envelope> {
        self.handle.sender.clone()
    }

    async fn final_drain(&self, pending: HashMap<ResourceIdentifier, Envelope>) {
        if pending.is_empty() {
            return;
        }
        let outcome = tokio::time::timeout(self.shutdown_timeout, self.push_cycle_inner(pending)).await;
        if outcome.is_err() {
            tracing::warn!(repo = %self.repo_ref, branch = %self.branch, "shutdown push cycle timed out");
        }
    }

    async fn push_cycle(&mut self, pending: HashMap<ResourceIdentifier, Envelope>) {
        self.push_cycle_inner(pending).await;
    }

    async fn push_cycle_inner(&self, pending: HashMap<ResourceIdentifier, Envelope>) {
        if pending.is_empty() {
            return;
        }

        let batch = to_commit_batch(pending, &self.repo_ref);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let started = std::time::Instant::now();
            let result = self.git.apply_and_push(&self.branch, &batch).await;
            self.metrics.observe_git_push_duration(started.elapsed());

            match result {
                Ok(()) => {
                    self.metrics.inc_git_operations();
                    self.metrics.inc_events_processed(batch.len() as u64);
                    return;
                }
                Err(err) => {
                    self.metrics.inc_git_operations_failed();
                    let retryable = err.is_retryable();
                    match reverser_retry::decide(&self.backoff, attempt, retryable) {
                        RetryDecision::Retry => {
                            let delay = reverser_retry::calculate_delay(&self.backoff, attempt);
                            tracing::warn!(repo = %self.repo_ref, branch = %self.branch, attempt, error = %err, "push failed, retrying");
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::Fatal | RetryDecision::BudgetExhausted => {
                            self.faulted.store(true, Ordering::Relaxed);
                            tracing::error!(repo = %self.repo_ref, branch = %self.branch, error = %err, "branch worker faulted");
                            let _ = self
                                .fault_sender
                                .send(WorkerFault {
                                    repo_ref: self.repo_ref.clone(),
                                    branch: self.branch.clone(),
                                    reason: err.to_string(),
                                })
                                .await;
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Collapse a pending map into an ordered, deterministic batch. Commit
/// messages depend on this order being stable for identical inputs.
fn to_commit_batch(pending: HashMap<ResourceIdentifier, Envelope>, _repo_ref: &str) -> CommitBatch {
    let mut items: Vec<CommitItem> = pending
        .into_values()
        .map(|envelope| CommitItem {
            operation: envelope.operation,
            identifier: envelope.identifier,
            object: envelope.object,
            base_folder: envelope.base_folder,
        })
        .collect();
    items.sort_by(|a, b| a.identifier.canonical().cmp(&b.identifier.canonical()));
    CommitBatch { items }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(name: &str, op: Operation) -> Envelope {
        Envelope {
            identifier: ResourceIdentifier::new("apps", "v1", "deployments", "team-a", name),
            operation: op,
            object: serde_json::json!({"metadata": {"name": name}}),
            base_folder: "clusters/a".to_string(),
        }
    }

    #[test]
    fn batch_collapse_is_last_write_wins() {
        let first = envelope("web", Operation::Create);
        let second = envelope("web", Operation::Delete);
        let collapsed = collapse_batch(Some(first), second.clone());
        assert_eq!(collapsed.operation, second.operation);
    }

    #[test]
    fn overflow_collapse_never_drops_a_pending_delete() {
        let delete = envelope("web", Operation::Delete);
        let update = envelope("web", Operation::Update);
        let collapsed = collapse_overflow(Some(delete.clone()), update);
        assert_eq!(collapsed.operation, Operation::Delete);
    }

    #[test]
    fn overflow_collapse_is_last_write_wins_without_pending_delete() {
        let create = envelope("web", Operation::Create);
        let update = envelope("web", Operation::Update);
        let collapsed = collapse_overflow(Some(create), update.clone());
        assert_eq!(collapsed.operation, update.operation);
    }

    #[tokio::test]
    async fn enqueue_spills_to_overflow_when_mailbox_full() {
        let (handle, mut mailbox) = BranchWorkerHandle::new(1, 8);
        handle.enqueue(envelope("a", Operation::Create));
        handle.enqueue(envelope("b", Operation::Create));

        let first = mailbox.recv().await.expect("first item delivered");
        assert_eq!(first.identifier.name, "a");

        let overflow = handle.overflow.lock().await;
        assert_eq!(overflow.len(), 1);
    }

    #[test]
    fn commit_batch_is_sorted_by_canonical_identifier() {
        let mut pending = HashMap::new();
        pending.insert(
            ResourceIdentifier::new("apps", "v1", "deployments", "team-a", "zeta"),
            envelope("zeta", Operation::Create),
        );
        pending.insert(
            ResourceIdentifier::new("apps", "v1", "deployments", "team-a", "alpha"),
            envelope("alpha", Operation::Create),
        );

        let batch = to_commit_batch(pending, "repo-1");
        assert_eq!(batch.items[0].identifier.name, "alpha");
        assert_eq!(batch.items[1].identifier.name, "zeta");
    }

    proptest::proptest! {
        /// Collapsing a batch then collapsing the result again yields the
        /// same batch.
        #[test]
        fn collapsing_a_collapsed_batch_is_a_no_op(ops in proptest::collection::vec(0u8..3, 1..8)) {
            let mut pending: HashMap<ResourceIdentifier, Envelope> = HashMap::new();
            for op in &ops {
                let operation = match op {
                    0 => Operation::Create,
                    1 => Operation::Update,
                    _ => Operation::Delete,
                };
                let incoming = envelope("web", operation);
                let existing = pending.remove(&incoming.identifier);
                pending.insert(incoming.identifier.clone(), collapse_batch(existing, incoming));
            }

            let once = to_commit_batch(pending.clone(), "repo-1");
            let mut repeated: HashMap<ResourceIdentifier, Envelope> = HashMap::new();
            for item in &once.items {
                let incoming = Envelope {
                    identifier: item.identifier.clone(),
                    operation: item.operation,
                    object: item.object.clone(),
                    base_folder: item.base_folder.clone(),
                };
                let existing = repeated.remove(&incoming.identifier);
                repeated.insert(incoming.identifier.clone(), collapse_batch(existing, incoming));
            }
            let twice = to_commit_batch(repeated, "repo-1");

            proptest::prop_assert_eq!(once.items.len(), twice.items.len());
            proptest::prop_assert_eq!(once.items[0].operation, twice.items[0].operation);
        }
    }
}
