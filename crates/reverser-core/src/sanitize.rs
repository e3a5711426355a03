//! Sanitization and canonical YAML rendering.
//!
//! Sanitization strips fields that are either server-managed noise
//! (`managedFields`, `resourceVersion`, `uid`, `generation`,
//! `creationTimestamp`) or never worth mirroring at all (`status`, stripped
//! unconditionally: a mirrored status is stale the instant it's written).
//! Canonical YAML serialization is load-bearing for dedup stability: sorted
//! keys, no anchors, LF line endings, trailing newline.

use serde_json::Value;

use crate::error::SanitizeError;

/// Strip fields from a live object's JSON representation before it is
/// routed or written to Git. Idempotent: `sanitize(sanitize(x)) == sanitize(x)`.
pub fn sanitize(mut object: Value) -> Result<Value, SanitizeError> {
    let root = object.as_object_mut().ok_or(SanitizeError::NotAnObject)?;

    root.remove("status");

    if let Some(metadata) = root.get_mut("metadata").and_then(Value::as_object_mut) {
        for field in [
            "managedFields",
            "resourceVersion",
            "uid",
            "generation",
            "creationTimestamp",
        ] {
            metadata.remove(field);
        }
    }

    Ok(object)
}

/// Render sanitized JSON as canonical YAML: sorted keys at every map level,
/// no anchors/aliases, LF endings, trailing newline. `serde_yaml` already
/// emits LF and no anchors for owned values; sorting is achieved by
/// converting maps to `BTreeMap` before handing off to the serializer.
pub fn canonical_yaml(value: &Value) -> Result<String, SanitizeError> {
    let sorted = sort_keys(value);
    let mut rendered = serde_yaml::to_string(&sorted)?;
    if !rendered.ends_with('\n') {
        rendered.push('\n');
    }
    Ok(rendered)
}

fn sort_keys(value: &Value) -> serde_yaml::Value {
    match value {
        Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, serde_yaml::Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), sort_keys(v)))
                .collect();
            serde_yaml::to_value(sorted).expect("BTreeMap<String, Value> always serializes")
        }
        Value::Array(items) => {
            serde_yaml::Value::Sequence(items.iter().map(sort_keys).collect())
        }
        Value::Null => serde_yaml::Value::Null,
        Value::Bool(b) => serde_yaml::Value::Bool(*b),
        Value::Number(n) => serde_yaml::to_value(n).expect("JSON numbers always serialize"),
        Value::String(s) => serde_yaml::Value::String(s.clone()),
    }
}

/// Git file layout: `<baseFolder>/<namespace-or-_cluster>/<plural>.<group>/<name>.yaml`.
/// Core-group objects use `.` as the group segment.
pub fn object_path(base_folder: &str, identifier: &reverser_types::ResourceIdentifier) -> String {
    let scope_segment = if identifier.is_cluster_scoped() {
        "_cluster"
    } else {
        identifier.namespace.as_str()
    };
    let group_segment = identifier.group.as_str();
    format!(
        "{base_folder}/{scope_segment}/{resource}.{group}/{name}.yaml",
        base_folder = base_folder,
        scope_segment = scope_segment,
        resource = identifier.resource,
        group = group_segment,
        name = identifier.name,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use reverser_types::ResourceIdentifier;
    use serde_json::json;

    #[test]
    fn sanitize_strips_managed_fields_and_status() {
        let object = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "cfg",
                "managedFields": [{"manager": "kubectl"}],
                "resourceVersion": "123",
                "uid": "abc",
                "generation": 3,
                "creationTimestamp": "2024-01-01T00:00:00Z",
            },
            "status": {"phase": "Active"},
            "data": {"k": "v"},
        });

        let sanitized = sanitize(object).expect("sanitize");
        assert!(sanitized.get("status").is_none());
        let metadata = sanitized.get("metadata").unwrap();
        assert!(metadata.get("managedFields").is_none());
        assert!(metadata.get("resourceVersion").is_none());
        assert!(metadata.get("uid").is_none());
        assert!(metadata.get("generation").is_none());
        assert!(metadata.get("creationTimestamp").is_none());
        assert_eq!(metadata.get("name").unwrap(), "cfg");
        assert_eq!(sanitized.get("data").unwrap().get("k").unwrap(), "v");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let object = json!({"metadata": {"name": "cfg", "uid": "abc"}, "status": {}});
        let once = sanitize(object).expect("sanitize");
        let twice = sanitize(once.clone()).expect("sanitize again");
        assert_eq!(once, twice);
    }

    #[test]
    fn canonical_yaml_sorts_keys() {
        let value = json!({"b": 1, "a": 2, "c": {"z": 1, "y": 2}});
        let rendered = canonical_yaml(&value).expect("render");
        let a_pos = rendered.find("a:").unwrap();
        let b_pos = rendered.find("b:").unwrap();
        let c_pos = rendered.find("c:").unwrap();
        assert!(a_pos < b_pos);
        assert!(b_pos < c_pos);
        let y_pos = rendered.find("y:").unwrap();
        let z_pos = rendered.find("z:").unwrap();
        assert!(y_pos < z_pos);
        assert!(rendered.ends_with('\n'));
    }

    #[test]
    fn object_path_uses_dot_for_core_group() {
        let id = ResourceIdentifier::new("", "v1", "pods", "team-a", "my-pod");
        assert_eq!(object_path("clusters/a", &id), "clusters/a/team-a/pods./my-pod.yaml");
    }

    #[test]
    fn object_path_uses_cluster_segment_for_cluster_scoped() {
        let id = ResourceIdentifier::new("", "v1", "namespaces", "", "team-a");
        assert_eq!(object_path("clusters/a", &id), "clusters/a/_cluster/namespaces./team-a.yaml");
    }

    /// Canonical YAML rendering is load-bearing for dedup stability: the
    /// exact same input must always render to the exact same bytes,
    /// independent of the source map's original key order.
    #[test]
    fn canonical_yaml_is_stable_regardless_of_source_key_order() {
        let forward = json!({"apiVersion": "v1", "kind": "ConfigMap", "data": {"k": "v", "a": "b"}});
        let reordered = json!({"kind": "ConfigMap", "data": {"a": "b", "k": "v"}, "apiVersion": "v1"});
        assert_eq!(
            canonical_yaml(&forward).expect("render"),
            canonical_yaml(&reordered).expect("render")
        );
    }
}
