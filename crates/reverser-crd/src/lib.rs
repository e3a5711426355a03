//! Custom resource types for the cluster-to-git mirroring pipeline.
//!
//! Four kinds are defined: `NamespacedRule` and `ClusterRule` describe what
//! gets mirrored, `Destination` names where a rule's matches land in Git,
//! and `RepositoryConfig` describes a Git remote and who may use it. All four
//! carry a status subresource; the Rule Reconciler is the only writer of
//! status.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use reverser_types::{Operation, Scope};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reference to a `RepositoryConfig` in the same namespace, by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LocalRepoRef {
    pub name: String,
}

/// Reference to a `RepositoryConfig` by name and namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RepoConfigRef {
    pub name: String,
    pub namespace: String,
}

/// One sub-rule within a `NamespacedRule`. Scope is implicitly `Namespaced`
/// and pinned to the object's own namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NamespacedSubRuleSpec {
    #[serde(default)]
    pub operations: Vec<Operation>,
    #[serde(default, rename = "apiGroups")]
    pub api_groups: Vec<String>,
    #[serde(default, rename = "apiVersions")]
    pub api_versions: Vec<String>,
    /// Required, minimum one entry; enforced by the Rule Reconciler rather
    /// than the schema (CRD validation rules don't express "min 1" cleanly
    /// across all supported Kubernetes versions).
    pub resources: Vec<String>,
}

/// Spec of a `NamespacedRule`: mirror this namespace's matching resources to
/// one destination. The `CustomResource` derive generates the `NamespacedRule`
/// type itself, with `.spec: NamespacedRuleSpec` and `.status: Option<RuleStatus>`.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "reverser.gitops.io",
    version = "v1alpha1",
    kind = "NamespacedRule",
    namespaced,
    status = "RuleStatus"
)]
pub struct NamespacedRuleSpec {
    #[serde(rename = "targetRef")]
    pub target_ref: LocalRepoRef,
    pub rules: Vec<NamespacedSubRuleSpec>,
}

/// One sub-rule within a `ClusterRule`. Unlike the namespaced form, scope
/// and namespace selector are explicit since the rule is not pinned to a
/// single namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ClusterSubRuleSpec {
    pub scope: Scope,
    #[serde(default)]
    pub operations: Vec<Operation>,
    #[serde(default, rename = "apiGroups")]
    pub api_groups: Vec<String>,
    #[serde(default, rename = "apiVersions")]
    pub api_versions: Vec<String>,
    pub resources: Vec<String>,
    #[serde(default, rename = "namespaceSelector")]
    pub namespace_selector: Option<BTreeMap<String, String>>,
}

/// Spec of a `ClusterRule`: mirror matching resources across the cluster
/// (or a namespace subset) to one destination, bound through a repository.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "reverser.gitops.io",
    version = "v1alpha1",
    kind = "ClusterRule",
    status = "RuleStatus"
)]
pub struct ClusterRuleSpec {
    #[serde(rename = "gitRepoConfigRef")]
    pub git_repo_config_ref: RepoConfigRef,
    pub rules: Vec<ClusterSubRuleSpec>,
}

/// Lifecycle phase reported on rule and destination status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum RulePhase {
    Pending,
    Installed,
    Invalid,
    Conflicted,
}

/// Shared status shape for `NamespacedRule` and `ClusterRule`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RuleStatus {
    pub phase: Option<RulePhase>,
    #[serde(default, rename = "observedGeneration")]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Spec of a `Destination`: one `(repo, branch, baseFolder)` triple that a
/// rule points its matches at.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "reverser.gitops.io",
    version = "v1alpha1",
    kind = "Destination",
    namespaced,
    status = "DestinationStatus"
)]
pub struct DestinationSpec {
    #[serde(rename = "repoRef")]
    pub repo_ref: LocalRepoRef,
    pub branch: String,
    #[serde(rename = "baseFolder")]
    pub base_folder: String,
}

/// Status reported on a `Destination`: whether it is active, or disabled due
/// to a `ConfigConflict` with another destination sharing its triple.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct DestinationStatus {
    pub phase: Option<RulePhase>,
    #[serde(default, rename = "conflictsWith")]
    pub conflicts_with: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Reference to a secret containing Git credentials, shaped `{username,
/// token}` or `{privateKey, knownHosts}`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CredentialsRef {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Whether namespaced rules anywhere in the cluster may target this
/// repository, and if restricted, by what selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum NamespacedRulesMode {
    All,
    FromSelector,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NamespacedRulesPolicy {
    pub mode: NamespacedRulesMode,
    #[serde(default, rename = "namespaceSelector")]
    pub namespace_selector: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AccessPolicy {
    #[serde(rename = "allowClusterRules")]
    pub allow_cluster_rules: bool,
    #[serde(rename = "namespacedRules")]
    pub namespaced_rules: NamespacedRulesPolicy,
}

impl AccessPolicy {
    /// `namespaceSelector` must be set if and only if `mode=FromSelector`.
    pub fn is_valid(&self) -> bool {
        match self.namespaced_rules.mode {
            NamespacedRulesMode::FromSelector => self.namespaced_rules.namespace_selector.is_some(),
            NamespacedRulesMode::All | NamespacedRulesMode::None => {
                self.namespaced_rules.namespace_selector.is_none()
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RepositoryConfigStatus {
    pub phase: Option<RulePhase>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Spec of a `RepositoryConfig`: a Git remote, its credentials, and who may
/// write to it.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "reverser.gitops.io",
    version = "v1alpha1",
    kind = "RepositoryConfig",
    namespaced,
    status = "RepositoryConfigStatus"
)]
pub struct RepositoryConfigSpec {
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    #[serde(rename = "credentialsRef")]
    pub credentials_ref: CredentialsRef,
    #[serde(default, rename = "allowedBranches")]
    pub allowed_branches: Option<Vec<String>>,
    #[serde(rename = "accessPolicy")]
    pub access_policy: AccessPolicy,
}

/// Whether a destination's branch is permitted by its repository's
/// `allowedBranches` allowlist. An absent or empty list allows everything.
pub fn branch_allowed(allowed_branches: &Option<Vec<String>>, branch: &str) -> bool {
    match allowed_branches {
        None => true,
        Some(list) if list.is_empty() => true,
        Some(list) => list.iter().any(|b| b == branch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_policy_requires_selector_only_for_from_selector() {
        let mut selector = BTreeMap::new();
        selector.insert("team".to_string(), "a".to_string());

        let valid = AccessPolicy {
            allow_cluster_rules: true,
            namespaced_rules: NamespacedRulesPolicy {
                mode: NamespacedRulesMode::FromSelector,
                namespace_selector: Some(selector),
            },
        };
        assert!(valid.is_valid());

        let invalid = AccessPolicy {
            allow_cluster_rules: true,
            namespaced_rules: NamespacedRulesPolicy {
                mode: NamespacedRulesMode::All,
                namespace_selector: Some(BTreeMap::new()),
            },
        };
        assert!(!invalid.is_valid());
    }

    #[test]
    fn branch_allowlist_empty_or_absent_allows_everything() {
        assert!(branch_allowed(&None, "main"));
        assert!(branch_allowed(&Some(vec![]), "main"));
        assert!(!branch_allowed(&Some(vec!["release".to_string()]), "main"));
        assert!(branch_allowed(&Some(vec!["main".to_string()]), "main"));
    }

    #[test]
    fn namespaced_rule_spec_round_trips_through_json() {
        let spec = NamespacedRuleSpec {
            target_ref: LocalRepoRef {
                name: "team-a".to_string(),
            },
            rules: vec![NamespacedSubRuleSpec {
                operations: vec![Operation::Create, Operation::Update],
                api_groups: vec!["apps".to_string()],
                api_versions: vec!["v1".to_string()],
                resources: vec!["deployments".to_string()],
            }],
        };

        let json = serde_json::to_string(&spec).expect("serialize");
        let back: NamespacedRuleSpec = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.target_ref.name, "team-a");
        assert_eq!(back.rules[0].resources, vec!["deployments".to_string()]);
    }
}
