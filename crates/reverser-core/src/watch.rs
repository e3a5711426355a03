//! Watch Manager: dynamic informer lifecycle over whatever GVRs the Rule
//! Store currently cares about.
//!
//! One `kube::runtime::watcher` task per concrete `(group, version,
//! resource, scope)` triple referenced by at least one compiled rule.
//! Wildcard resource entries (`*`) do not expand into a watched GVR set —
//! see the open design note in DESIGN.md. The initial list pass for a new
//! informer is re-emitted as synthetic `UPDATE` events, exactly like every subsequent live change, so downstream
//! dedup and reconciliation treat seeding and steady-state identically.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::core::{ApiResource, GroupVersion};
use kube::discovery;
use kube::runtime::watcher::{self, Event};
use kube::{Client, ResourceExt};
use reverser_types::{Operation, ResourceIdentifier, Scope, UserInfo, WatchEvent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::correlation::CorrelationStore;
use crate::metrics::Metrics;
use crate::router::{DestinationKey, EventRouter};
use crate::rules::RuleStore;
use crate::sanitize::sanitize;

/// A concrete, non-wildcard group/version/resource/scope the Rule Store
/// currently references.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GvrKey {
    pub group: String,
    pub version: String,
    pub resource: String,
    pub scope: Scope,
}

struct RunningInformer {
    cancel: CancellationToken,
}

pub struct WatchManager {
    client: Client,
    rule_store: Arc<RuleStore>,
    correlation: Arc<CorrelationStore>,
    router: Arc<EventRouter>,
    metrics: Arc<Metrics>,
    informers: DashMap<GvrKey, RunningInformer>,
    /// Per-destination set of identifiers currently believed live, used by
    /// the Reconciler Manager's orphan detection pass.
    live_identifiers: DashMap<DestinationKey, DashMap<ResourceIdentifier, ()>>,
}

impl WatchManager {
    pub fn new(
        client: Client,
        rule_store: Arc<RuleStore>,
        correlation: Arc<CorrelationStore>,
        router: Arc<EventRouter>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            client,
            rule_store,
            correlation,
            router,
            metrics,
            informers: DashMap::new(),
            live_identifiers: DashMap::new(),
        }
    }

    pub fn live_identifiers_for(&self, key: &DestinationKey) -> Vec<ResourceIdentifier> {
        self.live_identifiers
            .get(key)
            .map(|set| set.iter().map(|entry| entry.key().clone()).collect())
            .unwrap_or_default()
    }

    /// Union of concrete GVRs across every compiled rule's sub-rules.
    /// Skips any sub-rule containing a wildcard group/version/resource
    /// entry: those are resolved at match time against whatever is
    /// observed, not pre-expanded into a watch set.
    pub fn desired_gvrs(&self) -> HashSet<GvrKey> {
        compute_desired_gvrs(&self.rule_store)
    }

    /// Reconcile running informer tasks against `desired_gvrs()`: start any
    /// missing, stop any no longer referenced by a rule.
    #[instrument(skip(self))]
    pub async fn reconcile_informers(self: &Arc<Self>) {
        let desired = self.desired_gvrs();

        let running: HashSet<GvrKey> = self.informers.iter().map(|entry| entry.key().clone()).collect();

        for gvr in running.difference(&desired) {
            if let Some((_, informer)) = self.informers.remove(gvr) {
                informer.cancel.cancel();
                debug!(?gvr, "stopped informer no longer referenced by any rule");
            }
        }

        for gvr in desired.difference(&running) {
            let cancel = CancellationToken::new();
            self.informers.insert(gvr.clone(), RunningInformer { cancel: cancel.clone() });
            let manager = Arc::clone(self);
            let gvr = gvr.clone();
            tokio::spawn(async move {
                manager.run_informer(gvr, cancel).await;
            });
        }
    }

    #[instrument(skip(self, cancel), fields(group = %gvr.group, version = %gvr.version, resource = %gvr.resource))]
    async fn run_informer(&self, gvr: GvrKey, cancel: CancellationToken) {
        let api = match self.discover_api(&gvr).await {
            Ok(api) => api,
            Err(err) => {
                warn!(error = %err, "failed to discover api resource, informer will not start");
                return;
            }
        };

        let mut stream = Box::pin(watcher::watcher(api, watcher::Config::default()).boxed());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("informer cancelled");
                    return;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(event)) => self.handle_watcher_event(&gvr, event),
                        Some(Err(err)) => warn!(error = %err, "watcher stream error"),
                        None => {
                            debug!("watcher stream ended");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn discover_api(&self, gvr: &GvrKey) -> anyhow::Result<Api<DynamicObject>> {
        let gv_str = if gvr.group.is_empty() {
            gvr.version.clone()
        } else {
            format!("{}/{}", gvr.group, gvr.version)
        };
        let gv: GroupVersion = gv_str
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid group/version: {gv_str}"))?;
        let apigroup = discovery::pinned_group(&self.client, &gv).await?;
        let ar = apigroup
            .resources_by_stability()
            .into_iter()
            .map(|(resource, _)| resource)
            .find(|resource| resource.plural == gvr.resource)
            .unwrap_or_else(|| ApiResource {
                group: gvr.group.clone(),
                version: gvr.version.clone(),
                api_version: gv_str.clone(),
                kind: gvr.resource.clone(),
                plural: gvr.resource.clone(),
            });

        Ok(Api::all_with(self.client.clone(), &ar))
    }

    fn handle_watcher_event(&self, gvr: &GvrKey, event: Event<DynamicObject>) {
        match event {
            Event::InitApply(object) => self.dispatch(gvr, object, Operation::Update),
            Event::Apply(object) => self.dispatch(gvr, object, Operation::Update),
            Event::Delete(object) => self.dispatch(gvr, object, Operation::Delete),
            Event::Init | Event::InitDone => {}
        }
    }

    fn dispatch(&self, gvr: &GvrKey, object: DynamicObject, operation: Operation) {
        self.metrics.inc_events_received(1);

        let namespace = object.namespace().unwrap_or_default();
        let name = object.name_any();
        let identifier = ResourceIdentifier::new(
            gvr.group.clone(),
            gvr.version.clone(),
            gvr.resource.clone(),
            namespace.clone(),
            name,
        );

        let raw = match serde_json::to_value(&object) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, identifier = %identifier, "failed to serialize watched object");
                return;
            }
        };

        let sanitized = match sanitize(raw) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, identifier = %identifier, "failed to sanitize watched object");
                return;
            }
        };

        let fingerprint = reverser_types::ResourceFingerprint::new(identifier.clone(), operation);
        let user = self.correlation.take_and_delete(&fingerprint).unwrap_or_else(UserInfo::default);

        let watch_event = WatchEvent {
            object: sanitized,
            identifier: identifier.clone(),
            operation,
            user,
            timestamp: chrono::Utc::now(),
        };

        let namespace_labels = BTreeMap::new();
        let forwarded = self.router.route(
            &watch_event,
            gvr.scope,
            &gvr.group,
            &gvr.version,
            &gvr.resource,
            &namespace_labels,
        );

        for key in forwarded {
            let set = self.live_identifiers.entry(key).or_default();
            if operation == Operation::Delete {
                set.remove(&identifier);
            } else {
                set.insert(identifier.clone(), ());
            }
        }

        self.metrics.inc_events_processed(1);
    }
}

fn compute_desired_gvrs(rule_store: &RuleStore) -> HashSet<GvrKey> {
    let mut desired = HashSet::new();
    for rule in rule_store.snapshot_all() {
        for sub_rule in &rule.sub_rules {
            if sub_rule.resources.iter().any(|r| r == "*")
                || sub_rule.api_groups.iter().any(|g| g == "*")
                || sub_rule.api_versions.iter().any(|v| v == "*")
            {
                continue;
            }
            let scope = sub_rule.scope.unwrap_or(rule.scope);
            for group in if sub_rule.api_groups.is_empty() {
                vec![String::new()]
            } else {
                sub_rule.api_groups.clone()
            } {
                for version in if sub_rule.api_versions.is_empty() {
                    vec!["v1".to_string()]
                } else {
                    sub_rule.api_versions.clone()
                } {
                    for resource in &sub_rule.resources {
                        let resource = resource.split('/').next().unwrap_or(resource);
                        desired.insert(GvrKey {
                            group: group.clone(),
                            version: version.clone(),
                            resource: resource.to_string(),
                            scope,
                        });
                    }
                }
            }
        }
    }
    desired
}
