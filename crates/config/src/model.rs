use serde::{Deserialize, Serialize};

use keel_core::{Error, ModSource, Path, ResourceMatcher, Result};

pub const API_VERSION: &str = "keel.dev/v1alpha1";
pub const KIND: &str = "Config";

/// One configuration document. Documents are merged in order, defaults first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub api_version: String,
    pub kind: String,
    pub minimum_required_version: String,
    pub rebase_rules: Vec<RebaseRule>,
    pub diff_against_last_applied_field_exclusion_rules: Vec<FieldExclusionRule>,
    pub ownership_label_rules: Vec<PathRule>,
    pub label_scoping_rules: Vec<PathRule>,
    pub template_rules: Vec<TemplateRule>,
    pub diff_mask_rules: Vec<DiffMaskRule>,
    pub change_group_bindings: Vec<ChangeGroupBinding>,
    pub change_rule_bindings: Vec<ChangeRuleBinding>,
    pub additional_change_groups: Vec<ChangeGroupBinding>,
    pub additional_change_rules: Vec<ChangeRuleBinding>,
    pub wait_rules: Vec<WaitRule>,
}

impl Config {
    /// Empty document with `apiVersion` and `kind` filled in.
    pub fn new() -> Self { Self { api_version: API_VERSION.to_string(), kind: KIND.to_string(), ..Self::default() } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RebaseRuleType {
    Copy,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebaseRule {
    #[serde(default)]
    pub path: Option<Path>,
    #[serde(default)]
    pub paths: Vec<Path>,
    #[serde(rename = "type")]
    pub kind: RebaseRuleType,
    #[serde(default)]
    pub sources: Vec<ModSource>,
    pub resource_matchers: Vec<ResourceMatcher>,
}

impl RebaseRule {
    /// `path` and `paths` are mutually exclusive; exactly one must be set.
    pub fn all_paths(&self) -> Result<Vec<Path>> {
        match (&self.path, self.paths.is_empty()) {
            (Some(_), false) => Err(Error::Validation("rebase rule: expected only one of path or paths to be specified".into())),
            (None, true) => Err(Error::Validation("rebase rule: expected path or paths to be specified".into())),
            (Some(p), true) => Ok(vec![p.clone()]),
            (None, false) => Ok(self.paths.clone()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let paths = self.all_paths()?;
        match self.kind {
            RebaseRuleType::Copy if self.sources.is_empty() => {
                Err(Error::Validation("rebase rule: copy requires at least one source".into()))
            }
            RebaseRuleType::Remove => paths.iter().try_for_each(Path::require_map_leaf),
            RebaseRuleType::Copy => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldExclusionRule {
    pub path: Path,
    pub resource_matchers: Vec<ResourceMatcher>,
}

/// Path plus the resources it applies to; used by ownership and label-scoping rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathRule {
    pub path: Path,
    pub resource_matchers: Vec<ResourceMatcher>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRule {
    pub resource_matchers: Vec<ResourceMatcher>,
    pub affected_resources: AffectedResources,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AffectedResources {
    #[serde(default)]
    pub object_references: Vec<ObjectReference>,
}

/// Location of an object reference inside affected resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub path: Path,
    pub resource_matchers: Vec<ResourceMatcher>,
    #[serde(default)]
    pub name_key: Option<String>,
}

impl ObjectReference {
    pub fn name_key(&self) -> &str { self.name_key.as_deref().filter(|k| !k.is_empty()).unwrap_or("name") }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffMaskRule {
    pub path: Path,
    pub resource_matchers: Vec<ResourceMatcher>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeGroupBinding {
    pub name: String,
    pub resource_matchers: Vec<ResourceMatcher>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRuleBinding {
    pub rules: Vec<String>,
    #[serde(default)]
    pub ignore_if_cyclical: bool,
    pub resource_matchers: Vec<ResourceMatcher>,
}

/// User-declared convergence check for kinds without a built-in waiter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WaitRule {
    pub supports_observed_generation: bool,
    pub successful_conditions: Vec<String>,
    pub failure_conditions: Vec<String>,
    pub resource_matchers: Vec<ResourceMatcher>,
}
