//! Domain types shared across the cluster-to-git mirroring pipeline.
//!
//! These types carry no behavior beyond small helpers; the components that
//! act on them (rule matching, routing, batching, sanitization) live in
//! `reverser-core`.

use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// `(group, version, resource, namespace, name)`. `namespace` is empty for
/// cluster-scoped resources. The canonical string form `g/v/r/ns/name` is
/// the deduplication key used throughout the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceIdentifier {
    pub group: String,
    pub version: String,
    pub resource: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceIdentifier {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }

    /// Canonical `g/v/r/ns/name` string form. The group segment is empty
    /// (not `.`) for the core group here; `.` is reserved for the Git file
    /// layout, not this dedup key.
    pub fn canonical(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.group, self.version, self.resource, self.namespace, self.name
        )
    }
}

impl fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// The operation a `WatchEvent` or `CompiledRule` sub-rule cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier plus operation type. Used as the Correlation Store key.
/// Fingerprints never leave the pipeline (no `Display`, not logged whole).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceFingerprint {
    pub identifier: ResourceIdentifier,
    pub operation: Operation,
}

impl ResourceFingerprint {
    pub fn new(identifier: ResourceIdentifier, operation: Operation) -> Self {
        Self {
            identifier,
            operation,
        }
    }
}

/// `{username, uid}`, immutable once captured. Zero-valued (`UserInfo::default()`)
/// when no admission correlation existed for an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub username: String,
    pub uid: String,
}

impl UserInfo {
    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.uid.is_empty()
    }
}

/// Scope of a resource or a sub-rule: namespaced or cluster-scoped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum Scope {
    Namespaced,
    Cluster,
}

/// A live cluster change, already sanitized, ready for routing.
/// `user` is zero-valued if no admission correlation was found.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    pub object: serde_json::Value,
    pub identifier: ResourceIdentifier,
    pub operation: Operation,
    pub user: UserInfo,
    pub timestamp: DateTime<Utc>,
}

/// A single predicate within a `CompiledRule`. A rule matches an event if
/// *any* of its sub-rules match (logical OR); within a sub-rule every
/// predicate must match (logical AND).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubRule {
    pub scope: Option<Scope>,
    pub operations: Vec<Operation>,
    pub api_groups: Vec<String>,
    pub api_versions: Vec<String>,
    pub resources: Vec<String>,
    pub namespace_selector: Option<std::collections::BTreeMap<String, String>>,
    pub exclude_labels: Option<std::collections::BTreeMap<String, String>>,
}

/// A rule compiled from a `NamespacedRule` or `ClusterRule` source object,
/// bound to one destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledRule {
    pub source_ref: String,
    pub source_uid: Option<String>,
    pub git_repo_ref: String,
    pub branch: String,
    pub base_folder: String,
    pub scope: Scope,
    pub sub_rules: Vec<SubRule>,
}

/// A `(repo, branch, baseFolder)` triple naming a Git subtree owned by one
/// logical audit stream. Two destinations sharing this triple are a
/// configuration conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub repo_ref: String,
    pub branch: String,
    pub base_folder: String,
}

impl Destination {
    pub fn key(&self) -> (String, String, String) {
        (
            self.repo_ref.clone(),
            self.branch.clone(),
            self.base_folder.clone(),
        )
    }
}

/// One item in a commit batch: the last-observed state for one identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitItem {
    pub operation: Operation,
    pub identifier: ResourceIdentifier,
    pub object: serde_json::Value,
    pub base_folder: String,
}

/// An ordered, per-identifier-collapsed sequence of changes destined for a
/// single `(repo, branch)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitBatch {
    pub items: Vec<CommitItem>,
}

impl CommitBatch {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// Credentials resolved from an external secret reference.
/// `Debug` is implemented by hand so secret material never reaches logs.
#[derive(Clone, Serialize, Deserialize)]
pub enum GitCredentials {
    TokenAuth {
        username: String,
        token: String,
    },
    SshAuth {
        private_key_pem: String,
        known_hosts: String,
    },
}

impl fmt::Debug for GitCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GitCredentials::TokenAuth { username, .. } => f
                .debug_struct("TokenAuth")
                .field("username", username)
                .field("token", &"***")
                .finish(),
            GitCredentials::SshAuth { .. } => f
                .debug_struct("SshAuth")
                .field("private_key_pem", &"***")
                .field("known_hosts", &"***")
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_joins_all_fields() {
        let id = ResourceIdentifier::new("apps", "v1", "deployments", "team-a", "web");
        assert_eq!(id.canonical(), "apps/v1/deployments/team-a/web");
    }

    #[test]
    fn cluster_scoped_has_empty_namespace() {
        let id = ResourceIdentifier::new("", "v1", "namespaces", "", "team-a");
        assert!(id.is_cluster_scoped());
    }

    #[test]
    fn user_info_default_is_empty() {
        assert!(UserInfo::default().is_empty());
        assert!(!UserInfo {
            username: "alice".into(),
            uid: "u-1".into(),
        }
        .is_empty());
    }

    #[test]
    fn git_credentials_debug_redacts_secrets() {
        let creds = GitCredentials::TokenAuth {
            username: "bot".into(),
            token: "super-secret".into(),
        };
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("bot"));
    }

    #[test]
    fn commit_batch_empty_by_default() {
        assert!(CommitBatch::default().is_empty());
    }
}
