//! Keel config: documents mixed into the resource stream that tune rebasing,
//! labeling, reference rewriting, diff masking, ordering and waiting.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use keel_core::mods::{FieldCopyMod, FieldRemoveMod, ResourceMod, StringMapAppendMod};
use keel_core::{decode_yaml, matcher::ResourceMatcher, Error, Resource, Result};
use tracing::debug;

mod model;

pub use model::{
    AffectedResources, ChangeGroupBinding, ChangeRuleBinding, Config, DiffMaskRule, FieldExclusionRule, ObjectReference,
    PathRule, RebaseRule, RebaseRuleType, TemplateRule, WaitRule, API_VERSION, KIND,
};

/// Version compared against `minimumRequiredVersion`.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_CONFIG_YAML: &str = include_str!("default_config.yml");

pub fn is_config(res: &Resource) -> bool { res.api_version() == API_VERSION && res.kind() == KIND }

/// Separates config documents from the resources to apply.
pub fn split_config(resources: Vec<Resource>) -> Result<(Vec<Resource>, Vec<Config>)> {
    let mut rs = Vec::with_capacity(resources.len());
    let mut configs = Vec::new();
    for res in resources {
        if is_config(&res) {
            let cfg: Config = res.typed().map_err(|e| Error::Parse(format!("config document: {}", e)))?;
            configs.push(cfg);
        } else {
            rs.push(res);
        }
    }
    Ok((rs, configs))
}

pub fn default_config() -> Result<Config> {
    decode_yaml(DEFAULT_CONFIG_YAML).map_err(|e| Error::Parse(format!("built-in config: {}", e)))
}

/// Merged view over the built-in defaults and user documents.
#[derive(Debug, Clone, Default)]
pub struct Conf {
    configs: Vec<Config>,
}

impl Conf {
    /// Defaults followed by `user`; every document is validated.
    pub fn new(user: Vec<Config>) -> Result<Self> {
        let mut configs = Vec::with_capacity(user.len() + 1);
        configs.push(default_config()?);
        configs.extend(user);
        for cfg in &configs {
            validate(cfg)?;
        }
        debug!(docs = configs.len(), "config loaded");
        Ok(Self { configs })
    }

    /// Only the given documents, without the built-in defaults.
    pub fn without_defaults(configs: Vec<Config>) -> Result<Self> {
        for cfg in &configs {
            validate(cfg)?;
        }
        Ok(Self { configs })
    }

    pub fn from_resources(resources: Vec<Resource>) -> Result<(Vec<Resource>, Self)> {
        let (rs, user) = split_config(resources)?;
        Ok((rs, Self::new(user)?))
    }

    pub fn configs(&self) -> &[Config] { &self.configs }

    pub fn rebase_mods(&self) -> Vec<ResourceMod> {
        let mut mods = Vec::new();
        for rule in self.configs.iter().flat_map(|c| c.rebase_rules.iter()) {
            let matcher = ResourceMatcher::AnyMatcher { matchers: rule.resource_matchers.clone() };
            // Validated in `new`.
            for path in rule.all_paths().unwrap_or_default() {
                mods.push(match rule.kind {
                    RebaseRuleType::Copy => ResourceMod::FieldCopy(FieldCopyMod { matcher: matcher.clone(), path, sources: rule.sources.clone() }),
                    RebaseRuleType::Remove => ResourceMod::FieldRemove(FieldRemoveMod { matcher: matcher.clone(), path }),
                });
            }
        }
        mods
    }

    pub fn diff_against_last_applied_field_exclusion_mods(&self) -> Vec<ResourceMod> {
        self.configs
            .iter()
            .flat_map(|c| c.diff_against_last_applied_field_exclusion_rules.iter())
            .map(|r| ResourceMod::FieldRemove(FieldRemoveMod { matcher: ResourceMatcher::AnyMatcher { matchers: r.resource_matchers.clone() }, path: r.path.clone() }))
            .collect()
    }

    pub fn ownership_label_mods(&self, kvs: &BTreeMap<String, String>) -> Vec<StringMapAppendMod> {
        self.path_rule_mods(|c| &c.ownership_label_rules, kvs, false)
    }

    /// Scoping never creates selectors that are not already there.
    pub fn label_scoping_mods(&self, kvs: &BTreeMap<String, String>) -> Vec<StringMapAppendMod> {
        self.path_rule_mods(|c| &c.label_scoping_rules, kvs, true)
    }

    fn path_rule_mods<F>(&self, rules: F, kvs: &BTreeMap<String, String>, skip_if_not_found: bool) -> Vec<StringMapAppendMod>
    where
        F: Fn(&Config) -> &Vec<PathRule>,
    {
        self.configs
            .iter()
            .flat_map(|c| rules(c).iter())
            .map(|r| StringMapAppendMod {
                matcher: ResourceMatcher::AnyMatcher { matchers: r.resource_matchers.clone() },
                path: r.path.clone(),
                kvs: kvs.clone(),
                skip_if_not_found,
            })
            .collect()
    }

    pub fn template_rules(&self) -> Vec<TemplateRule> {
        self.configs.iter().flat_map(|c| c.template_rules.iter().cloned()).collect()
    }

    pub fn diff_mask_rules(&self) -> Vec<DiffMaskRule> {
        self.configs.iter().flat_map(|c| c.diff_mask_rules.iter().cloned()).collect()
    }

    pub fn change_group_bindings(&self) -> Vec<ChangeGroupBinding> {
        self.configs
            .iter()
            .flat_map(|c| c.change_group_bindings.iter().chain(c.additional_change_groups.iter()).cloned())
            .collect()
    }

    pub fn change_rule_bindings(&self) -> Vec<ChangeRuleBinding> {
        self.configs
            .iter()
            .flat_map(|c| c.change_rule_bindings.iter().chain(c.additional_change_rules.iter()).cloned())
            .collect()
    }

    /// Ordered as declared; user documents come after the defaults.
    pub fn wait_rules(&self) -> Vec<WaitRule> {
        self.configs.iter().flat_map(|c| c.wait_rules.iter().cloned()).collect()
    }
}

fn validate(cfg: &Config) -> Result<()> {
    if cfg.api_version != API_VERSION || cfg.kind != KIND {
        return Err(Error::Validation(format!(
            "config: expected apiVersion '{}' and kind '{}', found '{}' and '{}'",
            API_VERSION, KIND, cfg.api_version, cfg.kind
        )));
    }
    if !cfg.minimum_required_version.is_empty() {
        check_minimum_version(&cfg.minimum_required_version, ENGINE_VERSION)?;
    }
    for rule in &cfg.rebase_rules {
        rule.validate()?;
    }
    for rule in &cfg.diff_against_last_applied_field_exclusion_rules {
        rule.path.require_map_leaf()?;
    }
    for b in cfg.change_rule_bindings.iter().chain(cfg.additional_change_rules.iter()) {
        if b.rules.is_empty() {
            return Err(Error::Validation("change rule binding: expected at least one rule".into()));
        }
    }
    for b in cfg.change_group_bindings.iter().chain(cfg.additional_change_groups.iter()) {
        if b.name.is_empty() {
            return Err(Error::Validation("change group binding: expected non-empty name".into()));
        }
    }
    Ok(())
}

fn parse_version(v: &str) -> Result<(u64, u64, u64)> {
    if v.starts_with('v') {
        return Err(Error::Parse(format!("version '{}' must not have a leading 'v'", v)));
    }
    let core = v.split(&['-', '+'][..]).next().unwrap_or(v);
    let nums: Vec<&str> = core.split('.').collect();
    if nums.len() != 3 {
        return Err(Error::Parse(format!("version '{}' is not of the form major.minor.patch", v)));
    }
    let num = |s: &str| s.parse::<u64>().map_err(|_| Error::Parse(format!("version '{}': '{}' is not a number", v, s)));
    Ok((num(nums[0])?, num(nums[1])?, num(nums[2])?))
}

pub fn check_minimum_version(required: &str, current: &str) -> Result<()> {
    let req = parse_version(required)?;
    let cur = parse_version(current)?;
    if cur < req {
        return Err(Error::Validation(format!(
            "config requires engine version >= {} (current {})",
            required, current
        )));
    }
    Ok(())
}
