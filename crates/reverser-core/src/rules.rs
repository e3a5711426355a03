//! Rule Store: in-memory compiled index of watch rules.
//!
//! Namespaced and cluster rules live in separate maps, guarded by a single
//! reader-writer lock. Snapshots are deep copies so consumers iterate
//! outside the lock instead of holding it for the duration of a scan.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use reverser_types::{CompiledRule, Operation, Scope};

/// Key for a namespaced rule: `(namespace, name)` of the source object.
pub type NamespacedKey = (String, String);

#[derive(Default)]
struct Inner {
    namespaced: HashMap<NamespacedKey, CompiledRule>,
    cluster: HashMap<String, CompiledRule>,
}

/// Compiled rule index, safe for concurrent reads and writes.
pub struct RuleStore {
    inner: RwLock<Inner>,
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn upsert_namespaced(&self, namespace: &str, name: &str, rule: CompiledRule) {
        let mut inner = self.inner.write().expect("rule store lock poisoned");
        inner
            .namespaced
            .insert((namespace.to_string(), name.to_string()), rule);
    }

    pub fn upsert_cluster(&self, name: &str, rule: CompiledRule) {
        let mut inner = self.inner.write().expect("rule store lock poisoned");
        inner.cluster.insert(name.to_string(), rule);
    }

    pub fn delete_namespaced(&self, namespace: &str, name: &str) {
        let mut inner = self.inner.write().expect("rule store lock poisoned");
        inner.namespaced.remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn delete_cluster(&self, name: &str) {
        let mut inner = self.inner.write().expect("rule store lock poisoned");
        inner.cluster.remove(name);
    }

    /// Deep copy of all namespaced rules, for iteration outside the lock.
    pub fn snapshot_namespaced(&self) -> Vec<CompiledRule> {
        let inner = self.inner.read().expect("rule store lock poisoned");
        inner.namespaced.values().cloned().collect()
    }

    /// Deep copy of all cluster rules, for iteration outside the lock.
    pub fn snapshot_cluster(&self) -> Vec<CompiledRule> {
        let inner = self.inner.read().expect("rule store lock poisoned");
        inner.cluster.values().cloned().collect()
    }

    /// All rules currently installed, namespaced and cluster combined.
    pub fn snapshot_all(&self) -> Vec<CompiledRule> {
        let inner = self.inner.read().expect("rule store lock poisoned");
        inner
            .namespaced
            .values()
            .chain(inner.cluster.values())
            .cloned()
            .collect()
    }

    /// Rules matching `(identifier, operation, scope, objLabels, nsLabels)`.
    /// Namespaced rules only match namespaced events in their own namespace;
    /// cluster rules may match either scope, as declared per sub-rule.
    pub fn matches_for(
        &self,
        candidate: &MatchCandidate<'_>,
    ) -> Vec<CompiledRule> {
        let inner = self.inner.read().expect("rule store lock poisoned");
        let mut matched = Vec::new();

        if candidate.scope == Scope::Namespaced {
            for ((ns, _name), rule) in &inner.namespaced {
                if ns == candidate.namespace && rule_matches(rule, candidate) {
                    matched.push(rule.clone());
                }
            }
        }

        for rule in inner.cluster.values() {
            if rule_matches(rule, candidate) {
                matched.push(rule.clone());
            }
        }

        matched
    }
}

/// Everything the matcher needs about one event, borrowed for the duration
/// of a single `matches_for` call.
pub struct MatchCandidate<'a> {
    pub scope: Scope,
    pub namespace: &'a str,
    pub group: &'a str,
    pub version: &'a str,
    pub resource: &'a str,
    pub operation: Operation,
    pub object_labels: &'a BTreeMap<String, String>,
    pub namespace_labels: &'a BTreeMap<String, String>,
}

fn rule_matches(rule: &CompiledRule, candidate: &MatchCandidate<'_>) -> bool {
    rule.sub_rules.iter().any(|sub| sub_rule_matches(sub, candidate))
}

fn sub_rule_matches(sub: &reverser_types::SubRule, candidate: &MatchCandidate<'_>) -> bool {
    if let Some(scope) = sub.scope {
        if scope != candidate.scope {
            return false;
        }
    }

    if !operation_matches(&sub.operations, candidate.operation) {
        return false;
    }
    if !group_matches(&sub.api_groups, candidate.group) {
        return false;
    }
    if !version_matches(&sub.api_versions, candidate.version) {
        return false;
    }
    if !resource_matches(&sub.resources, candidate.resource) {
        return false;
    }
    if let Some(selector) = &sub.namespace_selector {
        if !labels_match(selector, candidate.namespace_labels) {
            return false;
        }
    }
    if let Some(exclude) = &sub.exclude_labels {
        if labels_match(exclude, candidate.object_labels) {
            return false;
        }
    }

    true
}

fn operation_matches(operations: &[Operation], candidate: Operation) -> bool {
    operations.is_empty() || operations.contains(&candidate)
}

fn group_matches(groups: &[String], candidate: &str) -> bool {
    if groups.is_empty() || groups.iter().any(|g| g == "*") {
        return true;
    }
    groups.iter().any(|g| g == candidate)
}

fn version_matches(versions: &[String], candidate: &str) -> bool {
    if versions.is_empty() || versions.iter().any(|v| v == "*") {
        return true;
    }
    versions.iter().any(|v| v == candidate)
}

/// `*` matches all; exact case-insensitive match; `plural/*` matches any
/// subresource of `plural`; `plural/sub` matches exactly.
fn resource_matches(resources: &[String], candidate: &str) -> bool {
    resources.iter().any(|pattern| {
        if pattern == "*" {
            return true;
        }
        if let Some(plural) = pattern.strip_suffix("/*") {
            return match candidate.split_once('/') {
                Some((cand_plural, _sub)) => cand_plural.eq_ignore_ascii_case(plural),
                None => false,
            };
        }
        pattern.eq_ignore_ascii_case(candidate)
    })
}

fn labels_match(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).map(|actual| actual == v).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reverser_types::SubRule;

    fn rule(sub_rules: Vec<SubRule>) -> CompiledRule {
        CompiledRule {
            source_ref: "team-a/rule-1".to_string(),
            source_uid: None,
            git_repo_ref: "repo-1".to_string(),
            branch: "main".to_string(),
            base_folder: "clusters/a".to_string(),
            scope: Scope::Namespaced,
            sub_rules,
        }
    }

    fn candidate<'a>(namespace: &'a str, resource: &'a str, op: Operation) -> MatchCandidate<'a> {
        MatchCandidate {
            scope: Scope::Namespaced,
            namespace,
            group: "apps",
            version: "v1",
            resource,
            operation: op,
            object_labels: &BTreeMap::new(),
            namespace_labels: &BTreeMap::new(),
        }
    }

    #[test]
    fn empty_operations_matches_every_operation() {
        let store = RuleStore::new();
        store.upsert_namespaced(
            "team-a",
            "rule-1",
            rule(vec![SubRule {
                resources: vec!["deployments".to_string()],
                api_groups: vec!["apps".to_string()],
                ..Default::default()
            }]),
        );

        for op in [Operation::Create, Operation::Update, Operation::Delete] {
            let matched = store.matches_for(&candidate("team-a", "deployments", op));
            assert_eq!(matched.len(), 1);
        }
    }

    #[test]
    fn namespaced_rule_never_matches_other_namespace() {
        let store = RuleStore::new();
        store.upsert_namespaced(
            "team-a",
            "rule-1",
            rule(vec![SubRule {
                resources: vec!["deployments".to_string()],
                api_groups: vec!["apps".to_string()],
                ..Default::default()
            }]),
        );

        let matched = store.matches_for(&candidate("team-b", "deployments", Operation::Create));
        assert!(matched.is_empty());
    }

    #[test]
    fn resource_subresource_wildcard() {
        assert!(resource_matches(&["pods/*".to_string()], "pods/log"));
        assert!(!resource_matches(&["pods/*".to_string()], "deployments/log"));
        assert!(resource_matches(&["pods/log".to_string()], "pods/log"));
        assert!(!resource_matches(&["pods/log".to_string()], "pods/exec"));
    }

    #[test]
    fn resource_match_is_case_insensitive() {
        assert!(resource_matches(&["Deployments".to_string()], "deployments"));
    }

    #[test]
    fn exclude_labels_reject_matching_object() {
        let mut exclude = BTreeMap::new();
        exclude.insert("skip".to_string(), "true".to_string());

        let store = RuleStore::new();
        store.upsert_namespaced(
            "team-a",
            "rule-1",
            rule(vec![SubRule {
                resources: vec!["deployments".to_string()],
                api_groups: vec!["apps".to_string()],
                exclude_labels: Some(exclude),
                ..Default::default()
            }]),
        );

        let mut object_labels = BTreeMap::new();
        object_labels.insert("skip".to_string(), "true".to_string());
        let candidate = MatchCandidate {
            object_labels: &object_labels,
            ..candidate("team-a", "deployments", Operation::Create)
        };

        assert!(store.matches_for(&candidate).is_empty());
    }

    #[test]
    fn snapshot_is_deep_copy() {
        let store = RuleStore::new();
        store.upsert_namespaced("team-a", "rule-1", rule(vec![]));
        let snapshot = store.snapshot_namespaced();
        store.delete_namespaced("team-a", "rule-1");
        assert_eq!(snapshot.len(), 1);
        assert!(store.snapshot_namespaced().is_empty());
    }
}
