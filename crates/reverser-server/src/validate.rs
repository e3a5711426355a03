//! Compiles CRD specs into `CompiledRule`s and enforces their validation
//! rules. Every rejection here maps to a `RulePhase::Invalid` or
//! `RulePhase::Conflicted` status condition, never a panic.

use std::collections::BTreeMap;

use reverser_core::ValidationError;
use reverser_crd::{
    AccessPolicy, ClusterRuleSpec, DestinationSpec, NamespacedRuleSpec, NamespacedRulesMode,
    RepositoryConfigSpec,
};
use reverser_types::{CompiledRule, Scope, SubRule};

/// `baseFolder` must match `^([A-Za-z0-9._-]+/)*[A-Za-z0-9._-]+$` and must
/// not contain a `..` segment: a relative path, no leading/trailing/doubled
/// slashes, no empty segments, only `[A-Za-z0-9._-]` within each segment.
pub fn validate_base_folder(base_folder: &str) -> Result<(), ValidationError> {
    let is_segment_char = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-');
    let valid = !base_folder.is_empty()
        && !base_folder.starts_with('/')
        && !base_folder.ends_with('/')
        && base_folder.split('/').all(|segment| {
            !segment.is_empty() && segment != ".." && segment.chars().all(is_segment_char)
        });

    if !valid {
        return Err(ValidationError::InvalidBaseFolder(base_folder.to_string()));
    }
    Ok(())
}

/// Whether namespaced rules originating in `rule_namespace` (with the given
/// namespace labels) are allowed to target a repository governed by
/// `policy`.
pub fn namespaced_rule_allowed(
    policy: &AccessPolicy,
    namespace_labels: &BTreeMap<String, String>,
) -> bool {
    match policy.namespaced_rules.mode {
        NamespacedRulesMode::All => true,
        NamespacedRulesMode::None => false,
        NamespacedRulesMode::FromSelector => policy
            .namespaced_rules
            .namespace_selector
            .as_ref()
            .is_some_and(|selector| selector.iter().all(|(k, v)| namespace_labels.get(k) == Some(v))),
    }
}

fn compile_namespaced_sub_rule(sub: &reverser_crd::NamespacedSubRuleSpec) -> Result<SubRule, ValidationError> {
    if sub.resources.is_empty() {
        return Err(ValidationError::EmptyResources);
    }
    Ok(SubRule {
        scope: Some(Scope::Namespaced),
        operations: sub.operations.clone(),
        api_groups: sub.api_groups.clone(),
        api_versions: sub.api_versions.clone(),
        resources: sub.resources.clone(),
        namespace_selector: None,
        exclude_labels: None,
    })
}

fn compile_cluster_sub_rule(sub: &reverser_crd::ClusterSubRuleSpec) -> Result<SubRule, ValidationError> {
    if sub.resources.is_empty() {
        return Err(ValidationError::EmptyResources);
    }
    Ok(SubRule {
        scope: Some(sub.scope),
        operations: sub.operations.clone(),
        api_groups: sub.api_groups.clone(),
        api_versions: sub.api_versions.clone(),
        resources: sub.resources.clone(),
        namespace_selector: sub.namespace_selector.clone(),
        exclude_labels: None,
    })
}

/// Compile a `NamespacedRule` bound to `destination`, which must already be
/// validated against its own `RepositoryConfig` (branch allowlist, access
/// policy) by the caller.
pub fn compile_namespaced_rule(
    namespace: &str,
    name: &str,
    source_uid: Option<String>,
    spec: &NamespacedRuleSpec,
    repo_config_key: &str,
    destination: &DestinationSpec,
) -> Result<CompiledRule, ValidationError> {
    if spec.rules.is_empty() {
        return Err(ValidationError::EmptyResources);
    }
    validate_base_folder(&destination.base_folder)?;

    let sub_rules = spec
        .rules
        .iter()
        .map(compile_namespaced_sub_rule)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CompiledRule {
        source_ref: format!("{namespace}/{name}"),
        source_uid,
        git_repo_ref: repo_config_key.to_string(),
        branch: destination.branch.clone(),
        base_folder: destination.base_folder.clone(),
        scope: Scope::Namespaced,
        sub_rules,
    })
}

/// Compile a `ClusterRule` bound to `destination`. Sub-rule scope is
/// explicit per entry rather than inherited, matching `ClusterSubRuleSpec`.
pub fn compile_cluster_rule(
    name: &str,
    source_uid: Option<String>,
    spec: &ClusterRuleSpec,
    repo_config_key: &str,
    destination: &DestinationSpec,
) -> Result<CompiledRule, ValidationError> {
    if spec.rules.is_empty() {
        return Err(ValidationError::EmptyResources);
    }
    validate_base_folder(&destination.base_folder)?;

    let sub_rules = spec
        .rules
        .iter()
        .map(compile_cluster_sub_rule)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CompiledRule {
        source_ref: name.to_string(),
        source_uid,
        git_repo_ref: repo_config_key.to_string(),
        branch: destination.branch.clone(),
        base_folder: destination.base_folder.clone(),
        scope: Scope::Cluster,
        sub_rules,
    })
}

/// Validate a destination against its resolved repository: branch must be
/// allowlisted and baseFolder must be well-formed.
pub fn validate_destination(
    destination: &DestinationSpec,
    repo: &RepositoryConfigSpec,
) -> Result<(), ValidationError> {
    validate_base_folder(&destination.base_folder)?;
    if !reverser_crd::branch_allowed(&repo.allowed_branches, &destination.branch) {
        return Err(ValidationError::BranchNotAllowed { branch: destination.branch.clone() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reverser_crd::{NamespacedRulesPolicy, NamespacedSubRuleSpec};

    #[test]
    fn base_folder_rejects_absolute_and_traversal() {
        assert!(validate_base_folder("clusters/a").is_ok());
        assert!(validate_base_folder("/clusters/a").is_err());
        assert!(validate_base_folder("clusters/../a").is_err());
    }

    #[test]
    fn base_folder_rejects_empty_and_trailing_slash() {
        assert!(validate_base_folder("").is_err());
        assert!(validate_base_folder("clusters/a/").is_err());
        assert!(validate_base_folder("clusters//a").is_err());
        assert!(validate_base_folder("clusters/ a").is_err());
    }

    #[test]
    fn namespaced_rule_allowed_respects_mode() {
        let mut selector = BTreeMap::new();
        selector.insert("team".to_string(), "a".to_string());
        let policy = AccessPolicy {
            allow_cluster_rules: false,
            namespaced_rules: NamespacedRulesPolicy {
                mode: NamespacedRulesMode::FromSelector,
                namespace_selector: Some(selector),
            },
        };

        let mut matching = BTreeMap::new();
        matching.insert("team".to_string(), "a".to_string());
        assert!(namespaced_rule_allowed(&policy, &matching));

        let mismatched = BTreeMap::new();
        assert!(!namespaced_rule_allowed(&policy, &mismatched));
    }

    #[test]
    fn compile_namespaced_rule_rejects_empty_resources() {
        let spec = NamespacedRuleSpec {
            target_ref: reverser_crd::LocalRepoRef { name: "dest-1".to_string() },
            rules: vec![NamespacedSubRuleSpec {
                operations: vec![],
                api_groups: vec![],
                api_versions: vec![],
                resources: vec![],
            }],
        };
        let destination = DestinationSpec {
            repo_ref: reverser_crd::LocalRepoRef { name: "repo-1".to_string() },
            branch: "main".to_string(),
            base_folder: "clusters/a".to_string(),
        };

        let result = compile_namespaced_rule("team-a", "rule-1", None, &spec, "team-a/repo-1", &destination);
        assert!(matches!(result, Err(ValidationError::EmptyResources)));
    }

    #[test]
    fn validate_destination_rejects_disallowed_branch() {
        let destination = DestinationSpec {
            repo_ref: reverser_crd::LocalRepoRef { name: "repo-1".to_string() },
            branch: "release".to_string(),
            base_folder: "clusters/a".to_string(),
        };
        let repo = RepositoryConfigSpec {
            repo_url: "https://example.invalid/repo.git".to_string(),
            credentials_ref: reverser_crd::CredentialsRef { name: "creds".to_string(), namespace: None },
            allowed_branches: Some(vec!["main".to_string()]),
            access_policy: AccessPolicy {
                allow_cluster_rules: true,
                namespaced_rules: NamespacedRulesPolicy { mode: NamespacedRulesMode::All, namespace_selector: None },
            },
        };

        let result = validate_destination(&destination, &repo);
        assert!(matches!(result, Err(ValidationError::BranchNotAllowed { .. })));
    }
}
