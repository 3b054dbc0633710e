//! Change groups: named sets of resources that ordering rules target.

use std::fmt;

use keel_core::{Error, Resource, Result};
use once_cell::sync::Lazy;
use regex::Regex;

pub const CRDS_GROUP: &str = "change-groups.keel.dev/crds";
pub const NAMESPACES_GROUP: &str = "change-groups.keel.dev/namespaces";

// Qualified name without the 63/253 length caps; placeholders may expand long.
static QUALIFIED_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*/)?[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$")
        .unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChangeGroup(String);

impl ChangeGroup {
    pub fn new(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::Validation("expected change group name to be non-empty".into()));
        }
        if !QUALIFIED_NAME.is_match(name) {
            return Err(Error::Validation(format!("expected change group name '{}' to be a qualified name", name)));
        }
        Ok(Self(name.to_string()))
    }

    /// Resolves placeholders against `res` and validates the result.
    pub fn from_template(template: &str, res: &Resource) -> Result<Self> { Self::new(&resolve_placeholders(template, res)?) }

    pub(crate) fn builtin(name: &'static str) -> Self { Self(name.to_string()) }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ChangeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

pub fn is_crd(res: &Resource) -> bool { res.api_group() == "apiextensions.k8s.io" && res.kind() == "CustomResourceDefinition" }

/// Expands `{api-group}`, `{kind}`, `{name}`, `{namespace}` and, for CRDs,
/// `{crd-kind}` and `{crd-group}`.
pub fn resolve_placeholders(template: &str, res: &Resource) -> Result<String> {
    let mut out = template
        .replace("{api-group}", res.api_group())
        .replace("{kind}", res.kind())
        .replace("{name}", res.name())
        .replace("{namespace}", res.namespace());
    if out.contains("{crd-kind}") || out.contains("{crd-group}") {
        if !is_crd(res) {
            return Err(Error::Validation(format!(
                "placeholders {{crd-kind}} and {{crd-group}} are only supported for CustomResourceDefinitions, found in '{}' on {}",
                template,
                res.description()
            )));
        }
        let spec = res.as_map().get("spec");
        let crd_kind = spec.and_then(|s| s.get("names")).and_then(|n| n.get("kind")).and_then(|k| k.as_str()).unwrap_or("");
        let crd_group = spec.and_then(|s| s.get("group")).and_then(|g| g.as_str()).unwrap_or("");
        out = out.replace("{crd-kind}", crd_kind).replace("{crd-group}", crd_group);
    }
    Ok(out)
}
