//! Composable resource predicates used by config rules and bindings.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::path::{Path, PathPart};
use crate::resource::Resource;

/// API groups served by the cluster itself. Anything else is a custom resource.
pub const BUILTIN_API_GROUPS: &[&str] = &[
    "",
    "admissionregistration.k8s.io",
    "apiextensions.k8s.io",
    "apiregistration.k8s.io",
    "apps",
    "authentication.k8s.io",
    "authorization.k8s.io",
    "autoscaling",
    "batch",
    "certificates.k8s.io",
    "coordination.k8s.io",
    "discovery.k8s.io",
    "events.k8s.io",
    "extensions",
    "flowcontrol.apiserver.k8s.io",
    "internal.apiserver.k8s.io",
    "networking.k8s.io",
    "node.k8s.io",
    "policy",
    "rbac.authorization.k8s.io",
    "resource.k8s.io",
    "scheduling.k8s.io",
    "storage.k8s.io",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceMatcher {
    AllMatcher {},
    AnyMatcher {
        matchers: Vec<ResourceMatcher>,
    },
    AndMatcher {
        matchers: Vec<ResourceMatcher>,
    },
    NotMatcher {
        matcher: Box<ResourceMatcher>,
    },
    #[serde(rename_all = "camelCase")]
    ApiGroupKindMatcher {
        #[serde(default)]
        api_group: String,
        kind: String,
    },
    #[serde(rename_all = "camelCase")]
    ApiVersionKindMatcher {
        api_version: String,
        kind: String,
    },
    KindNamespaceNameMatcher {
        kind: String,
        #[serde(default)]
        namespace: String,
        name: String,
    },
    HasAnnotationMatcher {
        keys: Vec<String>,
    },
    /// Empty `names` matches any namespaced resource.
    HasNamespaceMatcher {
        #[serde(default)]
        names: Vec<String>,
    },
    CustomResourceMatcher {},
    EmptyFieldMatcher {
        path: Path,
    },
}

impl ResourceMatcher {
    pub fn all() -> Self { ResourceMatcher::AllMatcher {} }

    pub fn api_group_kind(group: &str, kind: &str) -> Self {
        ResourceMatcher::ApiGroupKindMatcher { api_group: group.to_string(), kind: kind.to_string() }
    }

    pub fn api_version_kind(api_version: &str, kind: &str) -> Self {
        ResourceMatcher::ApiVersionKindMatcher { api_version: api_version.to_string(), kind: kind.to_string() }
    }

    pub fn kind_namespace_name(kind: &str, namespace: &str, name: &str) -> Self {
        ResourceMatcher::KindNamespaceNameMatcher { kind: kind.to_string(), namespace: namespace.to_string(), name: name.to_string() }
    }

    pub fn matches(&self, res: &Resource) -> bool {
        match self {
            ResourceMatcher::AllMatcher {} => true,
            ResourceMatcher::AnyMatcher { matchers } => matchers.iter().any(|m| m.matches(res)),
            ResourceMatcher::AndMatcher { matchers } => matchers.iter().all(|m| m.matches(res)),
            ResourceMatcher::NotMatcher { matcher } => !matcher.matches(res),
            ResourceMatcher::ApiGroupKindMatcher { api_group, kind } => res.api_group() == api_group && res.kind() == kind,
            ResourceMatcher::ApiVersionKindMatcher { api_version, kind } => {
                res.api_version() == api_version && res.kind() == kind
            }
            ResourceMatcher::KindNamespaceNameMatcher { kind, namespace, name } => {
                res.kind() == kind && res.namespace() == namespace && res.name() == name
            }
            ResourceMatcher::HasAnnotationMatcher { keys } => keys.iter().all(|k| res.has_annotation(k)),
            ResourceMatcher::HasNamespaceMatcher { names } => {
                let ns = res.namespace();
                if ns.is_empty() {
                    return false;
                }
                names.is_empty() || names.iter().any(|n| n == ns)
            }
            ResourceMatcher::CustomResourceMatcher {} => !BUILTIN_API_GROUPS.contains(&res.api_group()),
            ResourceMatcher::EmptyFieldMatcher { path } => field_is_empty(res, path),
        }
    }
}

/// Matches when any matcher in the list does; an empty list never matches.
pub fn any_matches(matchers: &[ResourceMatcher], res: &Resource) -> bool { matchers.iter().any(|m| m.matches(res)) }

fn field_is_empty(res: &Resource, path: &Path) -> bool {
    let mut cur = match res.as_map().get(first_key(path).unwrap_or_default()) {
        Some(v) => v,
        None => return true,
    };
    for part in path.parts().iter().skip(1) {
        let next = match (part, cur) {
            (PathPart::MapKey(k), Json::Object(m)) => m.get(k),
            (PathPart::Index(i), Json::Array(a)) => a.get(*i),
            _ => None,
        };
        match next {
            Some(v) => cur = v,
            None => return true,
        }
    }
    match cur {
        Json::Null => true,
        Json::String(s) => s.is_empty(),
        Json::Array(a) => a.is_empty(),
        Json::Object(m) => m.is_empty(),
        _ => false,
    }
}

fn first_key(path: &Path) -> Option<&str> {
    match path.parts().first() {
        Some(PathPart::MapKey(k)) => Some(k.as_str()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn res(v: Json) -> Resource { Resource::from_value(v).unwrap() }

    #[test]
    fn parses_config_shapes() {
        let yaml = r#"
- allMatcher: {}
- apiVersionKindMatcher: {apiVersion: apps/v1, kind: Deployment}
- notMatcher:
    matcher:
      apiGroupKindMatcher: {kind: Namespace}
- anyMatcher:
    matchers:
    - hasNamespaceMatcher: {}
    - customResourceMatcher: {}
- emptyFieldMatcher: {path: [spec, replicas]}
"#;
        let ms: Vec<ResourceMatcher> = crate::resource::decode_yaml(yaml).unwrap();
        assert_eq!(ms.len(), 5);
        assert_eq!(ms[2], ResourceMatcher::NotMatcher { matcher: Box::new(ResourceMatcher::api_group_kind("", "Namespace")) });
    }

    #[test]
    fn evaluates_predicates() {
        let dep = res(json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "d", "namespace": "ns", "annotations": {"x": ""}}, "spec": {}}));
        let crd_obj = res(json!({"apiVersion": "example.com/v1", "kind": "Widget", "metadata": {"name": "w"}}));

        assert!(ResourceMatcher::api_version_kind("apps/v1", "Deployment").matches(&dep));
        assert!(ResourceMatcher::api_group_kind("apps", "Deployment").matches(&dep));
        assert!(!ResourceMatcher::api_group_kind("", "Deployment").matches(&dep));
        assert!(ResourceMatcher::kind_namespace_name("Deployment", "ns", "d").matches(&dep));
        assert!(ResourceMatcher::HasAnnotationMatcher { keys: vec!["x".into()] }.matches(&dep));
        assert!(ResourceMatcher::HasNamespaceMatcher { names: vec![] }.matches(&dep));
        assert!(!ResourceMatcher::HasNamespaceMatcher { names: vec![] }.matches(&crd_obj));
        assert!(ResourceMatcher::CustomResourceMatcher {}.matches(&crd_obj));
        assert!(!ResourceMatcher::CustomResourceMatcher {}.matches(&dep));
        assert!(ResourceMatcher::EmptyFieldMatcher { path: Path::from_strs(&["spec", "replicas"]) }.matches(&dep));
        assert!(!ResourceMatcher::EmptyFieldMatcher { path: Path::from_strs(&["metadata", "name"]) }.matches(&dep));

        let and = ResourceMatcher::AndMatcher { matchers: vec![ResourceMatcher::all(), ResourceMatcher::CustomResourceMatcher {}] };
        assert!(!and.matches(&dep));
        assert!(and.matches(&crd_obj));
    }
}
