//! Event Router: resolves a WatchEvent into the destinations that must
//! receive it.
//!
//! The router never holds a strong reference to its producers:
//! Destination Streams register themselves on creation and unregister on
//! removal. Matching against the same underlying change fans out to
//! multiple destinations intentionally; the router does not deduplicate
//! across destinations, only within one destination per call.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use reverser_types::{Scope, WatchEvent};

use crate::destination::DestinationStream;
use crate::rules::{MatchCandidate, RuleStore};

/// `(repo_ref, branch, base_folder)`, the destination uniqueness key.
pub type DestinationKey = (String, String, String);

pub struct EventRouter {
    rule_store: Arc<RuleStore>,
    destinations: DashMap<DestinationKey, Arc<DestinationStream>>,
}

impl EventRouter {
    pub fn new(rule_store: Arc<RuleStore>) -> Self {
        Self {
            rule_store,
            destinations: DashMap::new(),
        }
    }

    pub fn register(&self, key: DestinationKey, stream: Arc<DestinationStream>) {
        self.destinations.insert(key, stream);
    }

    pub fn unregister(&self, key: &DestinationKey) {
        self.destinations.remove(key);
    }

    pub fn is_registered(&self, key: &DestinationKey) -> bool {
        self.destinations.contains_key(key)
    }

    /// Route one event to every destination with a matching rule. Returns
    /// the keys actually forwarded to, so the caller (Watch Manager) can
    /// maintain its per-destination live-identifier set for orphan
    /// detection.
    pub fn route(
        &self,
        event: &WatchEvent,
        scope: Scope,
        group: &str,
        version: &str,
        resource: &str,
        namespace_labels: &BTreeMap<String, String>,
    ) -> Vec<DestinationKey> {
        let object_labels = extract_labels(event);
        let candidate = MatchCandidate {
            scope,
            namespace: &event.identifier.namespace,
            group,
            version,
            resource,
            operation: event.operation,
            object_labels: &object_labels,
            namespace_labels,
        };

        let rules = self.rule_store.matches_for(&candidate);
        let mut forwarded = Vec::new();
        let mut seen: HashSet<DestinationKey> = HashSet::new();

        for rule in rules {
            let key: DestinationKey = (rule.git_repo_ref.clone(), rule.branch.clone(), rule.base_folder.clone());
            if !seen.insert(key.clone()) {
                continue;
            }
            if let Some(stream) = self.destinations.get(&key) {
                stream.handle(event.clone(), &rule.base_folder);
                forwarded.push(key);
            }
        }

        forwarded
    }
}

fn extract_labels(event: &WatchEvent) -> BTreeMap<String, String> {
    event
        .object
        .get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(|l| l.as_object())
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::DestinationStream;
    use crate::worker::BranchWorkerHandle;
    use reverser_types::{CompiledRule, Operation, ResourceIdentifier, SubRule, UserInfo};
    use serde_json::json;

    fn event(namespace: &str, name: &str, op: Operation) -> WatchEvent {
        WatchEvent {
            object: json!({"metadata": {"name": name, "namespace": namespace}}),
            identifier: ResourceIdentifier::new("apps", "v1", "deployments", namespace, name),
            operation: op,
            user: UserInfo::default(),
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn routes_to_registered_destination_with_matching_rule() {
        let rule_store = Arc::new(RuleStore::new());
        rule_store.upsert_namespaced(
            "team-a",
            "rule-1",
            CompiledRule {
                source_ref: "team-a/rule-1".to_string(),
                source_uid: None,
                git_repo_ref: "repo-1".to_string(),
                branch: "main".to_string(),
                base_folder: "clusters/a".to_string(),
                scope: Scope::Namespaced,
                sub_rules: vec![SubRule {
                    resources: vec!["deployments".to_string()],
                    api_groups: vec!["apps".to_string()],
                    ..Default::default()
                }],
            },
        );

        let router = EventRouter::new(rule_store);
        let key: DestinationKey = ("repo-1".to_string(), "main".to_string(), "clusters/a".to_string());
        let (handle, _mailbox) = BranchWorkerHandle::new(16, 64);
        let stream = Arc::new(DestinationStream::new(key.clone(), Arc::new(handle)));
        stream.open_gate();
        router.register(key.clone(), stream);

        let forwarded = router.route(
            &event("team-a", "web", Operation::Create),
            Scope::Namespaced,
            "apps",
            "v1",
            "deployments",
            &BTreeMap::new(),
        );

        assert_eq!(forwarded, vec![key]);
    }

    #[tokio::test]
    async fn unregistered_destination_receives_nothing() {
        let rule_store = Arc::new(RuleStore::new());
        rule_store.upsert_namespaced(
            "team-a",
            "rule-1",
            CompiledRule {
                source_ref: "team-a/rule-1".to_string(),
                source_uid: None,
                git_repo_ref: "repo-1".to_string(),
                branch: "main".to_string(),
                base_folder: "clusters/a".to_string(),
                scope: Scope::Namespaced,
                sub_rules: vec![SubRule {
                    resources: vec!["deployments".to_string()],
                    api_groups: vec!["apps".to_string()],
                    ..Default::default()
                }],
            },
        );
        let router = EventRouter::new(rule_store);

        let forwarded = router.route(
            &event("team-a", "web", Operation::Create),
            Scope::Namespaced,
            "apps",
            "v1",
            "deployments",
            &BTreeMap::new(),
        );

        assert!(forwarded.is_empty());
    }
}
