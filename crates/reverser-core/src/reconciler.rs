//! Reconciler Manager: per-destination lifecycle state machine.
//!
//! Drives each destination through `Pending → Seeding → Steady → Draining →
//! Faulted`. Seeding diffs the Watch Manager's live-identifier snapshot
//! against the Git facade's tracked-file snapshot under `baseFolder`;
//! anything present only in Git is an orphan and gets a synthetic DELETE
//! envelope pushed straight to the Branch Worker, bypassing the Destination
//! Stream's closed gate (the gate only opens once seeding completes).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reverser_types::{Operation, ResourceIdentifier};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::destination::DestinationStream;
use crate::git::GitFacade;
use crate::router::{DestinationKey, EventRouter};
use crate::watch::WatchManager;
use crate::worker::{BranchWorkerHandle, Envelope, WorkerFault};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationPhase {
    Pending,
    Seeding,
    Steady,
    Draining,
    Faulted,
}

struct DestinationRecord {
    stream: Arc<DestinationStream>,
    worker_handle: Arc<BranchWorkerHandle>,
    git: Arc<GitFacade>,
    base_folder: String,
}

pub struct ReconcilerManager {
    router: Arc<EventRouter>,
    watch: Arc<WatchManager>,
    reconcile_interval: Duration,
    phases: DashMap<DestinationKey, DestinationPhase>,
    records: DashMap<DestinationKey, DestinationRecord>,
}

impl ReconcilerManager {
    pub fn new(router: Arc<EventRouter>, watch: Arc<WatchManager>, reconcile_interval: Duration) -> Self {
        Self {
            router,
            watch,
            reconcile_interval,
            phases: DashMap::new(),
            records: DashMap::new(),
        }
    }

    pub fn phase(&self, key: &DestinationKey) -> Option<DestinationPhase> {
        self.phases.get(key).map(|entry| *entry.value())
    }

    /// Whether every attached destination has at least reached `Seeding`,
    /// i.e. none are sitting in a not-yet-attached state. Used by the HTTP
    /// readiness probe.
    pub fn all_attached_at_least_seeding(&self) -> bool {
        self.phases.iter().all(|entry| *entry.value() != DestinationPhase::Pending)
    }

    /// Attach a newly-known destination: register it with the router,
    /// transition to `Seeding`, and spawn the seed-diff task.
    #[instrument(skip(self, stream, worker_handle, git))]
    pub fn attach(
        self: &Arc<Self>,
        key: DestinationKey,
        stream: Arc<DestinationStream>,
        worker_handle: Arc<BranchWorkerHandle>,
        git: Arc<GitFacade>,
        base_folder: String,
    ) {
        self.router.register(key.clone(), stream.clone());
        self.records.insert(
            key.clone(),
            DestinationRecord { stream, worker_handle, git, base_folder },
        );
        self.phases.insert(key.clone(), DestinationPhase::Seeding);

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.seed(key).await;
        });
    }

    /// Destination removed from configuration: stop accepting events but
    /// leave the Git files in place.
    pub fn detach(&self, key: &DestinationKey) {
        if let Some(record) = self.records.get(key) {
            record.stream.close_gate();
        }
        self.router.unregister(key);
        self.phases.insert(key.clone(), DestinationPhase::Draining);
    }

    /// Mark every destination on the faulted `(repo, branch)` as `Faulted`
    /// and stop forwarding events to it. A worker is keyed by `(repo,
    /// branch)` but destinations are keyed by `(repo, branch, baseFolder)`,
    /// so one fault can affect several destinations.
    pub fn handle_fault(&self, fault: &WorkerFault) {
        let affected: Vec<DestinationKey> = self
            .records
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| key.0 == fault.repo_ref && key.1 == fault.branch)
            .collect();

        for key in affected {
            if let Some(record) = self.records.get(&key) {
                record.stream.close_gate();
            }
            self.phases.insert(key, DestinationPhase::Faulted);
        }
        warn!(repo = %fault.repo_ref, branch = %fault.branch, reason = %fault.reason, "branch worker faulted");
    }

    /// Re-attempt seeding for a previously faulted destination, e.g. after a
    /// rule change or explicit retry.
    pub fn retry(self: &Arc<Self>, key: DestinationKey) {
        self.phases.insert(key.clone(), DestinationPhase::Pending);
        if let Some(record) = self.records.get(&key) {
            self.router.register(key.clone(), record.stream.clone());
        }
        self.phases.insert(key.clone(), DestinationPhase::Seeding);
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.seed(key).await;
        });
    }

    async fn seed(self: &Arc<Self>, key: DestinationKey) {
        let Some(record) = self.records.get(&key).map(|entry| clone_record(&entry)) else {
            return;
        };

        let live = self.watch.live_identifiers_for(&key);
        let tracked = match record.git.list_under(&record.base_folder).await {
            Ok(paths) => paths,
            Err(err) => {
                warn!(repo = %key.0, branch = %key.1, error = %err, "seed snapshot failed, will retry on next reconcile");
                return;
            }
        };

        let orphans = compute_orphans(&record.base_folder, &live, &tracked);
        if !orphans.is_empty() {
            info!(repo = %key.0, branch = %key.1, count = orphans.len(), "seeding orphan deletes");
        }
        for identifier in orphans {
            record.worker_handle.enqueue(Envelope {
                identifier,
                operation: Operation::Delete,
                object: serde_json::Value::Null,
                base_folder: record.base_folder.clone(),
            });
        }

        record.stream.open_gate();
        self.phases.insert(key, DestinationPhase::Steady);
    }

    /// Run the periodic re-reconciliation loop until `cancel` fires,
    /// self-healing drift every `reconcileInterval`.
    pub async fn run_periodic(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.reconcile_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let steady: Vec<DestinationKey> = self
                        .phases
                        .iter()
                        .filter(|entry| *entry.value() == DestinationPhase::Steady)
                        .map(|entry| entry.key().clone())
                        .collect();
                    for key in steady {
                        self.seed(key).await;
                    }
                }
            }
        }
    }
}

fn clone_record(record: &DestinationRecord) -> DestinationRecord {
    DestinationRecord {
        stream: record.stream.clone(),
        worker_handle: record.worker_handle.clone(),
        git: record.git.clone(),
        base_folder: record.base_folder.clone(),
    }
}

/// Identifiers whose expected Git path is not covered by any live cluster
/// identifier are orphans. Expected paths are derived with the same
/// `object_path` the Git facade uses to write, so the comparison stays in
/// sync with the file layout automatically.
fn compute_orphans(base_folder: &str, live: &[ResourceIdentifier], tracked_paths: &[String]) -> Vec<ResourceIdentifier> {
    let live_paths: HashSet<String> = live
        .iter()
        .map(|identifier| crate::sanitize::object_path(base_folder, identifier))
        .collect();

    tracked_paths
        .iter()
        .filter(|path| !live_paths.contains(path.as_str()))
        .filter_map(|path| parse_object_path(base_folder, path))
        .collect()
}

/// Reverse `object_path`: `<baseFolder>/<ns-or-_cluster>/<resource>.<group>/<name>.yaml`.
/// `apiVersion` is not recoverable from the path (it is not part of the file
/// layout) and is left empty; it plays no role in deleting the file.
fn parse_object_path(base_folder: &str, path: &str) -> Option<ResourceIdentifier> {
    let rest = path.strip_prefix(base_folder)?.strip_prefix('/')?;
    let mut segments = rest.splitn(3, '/');
    let scope_segment = segments.next()?;
    let resource_group = segments.next()?;
    let file_name = segments.next()?;

    let namespace = if scope_segment == "_cluster" { "" } else { scope_segment };
    let (resource, group) = resource_group.split_once('.')?;
    let name = file_name.strip_suffix(".yaml")?;

    Some(ResourceIdentifier::new(group, "", resource, namespace, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_orphans_finds_paths_with_no_live_match() {
        let live = vec![ResourceIdentifier::new("apps", "v1", "deployments", "team-a", "web")];
        let tracked = vec![
            "clusters/a/team-a/deployments.apps/web.yaml".to_string(),
            "clusters/a/team-a/configmaps./stale-cfg.yaml".to_string(),
        ];

        let orphans = compute_orphans("clusters/a", &live, &tracked);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].name, "stale-cfg");
        assert_eq!(orphans[0].resource, "configmaps");
    }

    #[test]
    fn compute_orphans_is_empty_when_everything_is_live() {
        let live = vec![ResourceIdentifier::new("apps", "v1", "deployments", "team-a", "web")];
        let tracked = vec!["clusters/a/team-a/deployments.apps/web.yaml".to_string()];
        assert!(compute_orphans("clusters/a", &live, &tracked).is_empty());
    }

    #[test]
    fn parse_object_path_round_trips_through_object_path() {
        let identifier = ResourceIdentifier::new("", "v1", "pods", "team-a", "my-pod");
        let path = crate::sanitize::object_path("clusters/a", &identifier);
        let parsed = parse_object_path("clusters/a", &path).expect("parses");
        assert_eq!(parsed.resource, "pods");
        assert_eq!(parsed.name, "my-pod");
        assert_eq!(parsed.namespace, "team-a");
    }

    #[test]
    fn parse_object_path_maps_cluster_segment_to_empty_namespace() {
        let identifier = ResourceIdentifier::new("", "v1", "namespaces", "", "team-a");
        let path = crate::sanitize::object_path("clusters/a", &identifier);
        let parsed = parse_object_path("clusters/a", &path).expect("parses");
        assert!(parsed.namespace.is_empty());
    }
}
