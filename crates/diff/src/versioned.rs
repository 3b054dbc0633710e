//! Versioned resources: numbered copies, reference rewriting and retention.

use std::collections::{BTreeMap, BTreeSet};

use keel_config::TemplateRule;
use keel_core::annotations::{suffixed_values, NUM_VERSIONS, VERSIONED, VERSIONED_EXPLICIT_REF, VERSIONED_KEEP_ORIGINAL};
use keel_core::matcher::any_matches;
use keel_core::{Error, ObjectRefSetMod, Resource, ResourceMatcher, Result, UniqueResourceKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::debug;

use crate::change::{Change, ChangeFactory, ChangeOp};
use crate::change_set::{ChangeSet, ChangeSetOpts};

pub const DEFAULT_NUM_VERSIONS: usize = 5;

const VERSION_SEP: &str = "-ver-";

/// Splits `base-ver-N` into `(base, N)`; `N` must be a positive integer.
pub fn parse_versioned_name(name: &str) -> Option<(&str, u64)> {
    let (base, n) = name.rsplit_once(VERSION_SEP)?;
    if base.is_empty() || n.is_empty() || !n.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    n.parse::<u64>().ok().filter(|n| *n >= 1).map(|n| (base, n))
}

pub fn versioned_name(base: &str, n: u64) -> String { format!("{}{}{}", base, VERSION_SEP, n) }

/// Retention window from the resource's annotation.
pub fn num_versions(res: &Resource) -> Result<usize> {
    let Some(raw) = res.annotation(NUM_VERSIONS) else { return Ok(DEFAULT_NUM_VERSIONS) };
    match raw.trim().parse::<usize>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(Error::Validation(format!("expected annotation '{}' on {} to be an integer >= 1, got '{}'", NUM_VERSIONS, res.description(), raw))),
    }
}

/// Reference declared through the explicit-ref annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplicitRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    pub kind: String,
    pub name: String,
}

impl ExplicitRef {
    fn group(&self) -> &str {
        match self.api_group.as_deref() {
            None | Some("") | Some("core") => "",
            Some(g) => g,
        }
    }
}

#[derive(Debug)]
enum Decision {
    Add { name: String, trial: Option<Change> },
    Keep { latest: usize },
}

impl Decision {
    fn name<'r>(&'r self, group: &'r [(u64, Resource)]) -> &'r str {
        match self {
            Decision::Add { name, .. } => name,
            Decision::Keep { latest } => group[*latest].1.name(),
        }
    }
}

/// Expands versioned resources and diffs everything else through [`ChangeSet`].
pub struct VersionedChangeSet<'a> {
    existing: Vec<Resource>,
    desired: Vec<Resource>,
    template_rules: Vec<TemplateRule>,
    opts: ChangeSetOpts,
    factory: &'a ChangeFactory,
}

impl<'a> VersionedChangeSet<'a> {
    pub fn new(existing: Vec<Resource>, desired: Vec<Resource>, template_rules: Vec<TemplateRule>, opts: ChangeSetOpts, factory: &'a ChangeFactory) -> Self {
        Self { existing, desired, template_rules, opts, factory }
    }

    pub fn calculate(self) -> Result<Vec<Change>> {
        let Self { existing, desired, template_rules, opts, factory } = self;

        let mut groups: BTreeMap<UniqueResourceKey, Vec<(u64, Resource)>> = BTreeMap::new();
        let mut plain_existing = Vec::new();
        for res in existing {
            let parsed = if res.has_annotation(VERSIONED) && !res.transient() { parse_versioned_name(res.name()).map(|(b, n)| (b.to_string(), n)) } else { None };
            match parsed {
                Some((base, n)) => groups.entry(UniqueResourceKey::with_custom_name(&res, &base)).or_default().push((n, res)),
                None => plain_existing.push(res),
            }
        }
        for members in groups.values_mut() {
            members.sort_by_key(|(n, _)| *n);
        }

        let mut versioned = Vec::new();
        let mut plain = Vec::new();
        for res in desired {
            if !res.has_annotation(VERSIONED) {
                plain.push(res);
                continue;
            }
            if res.has_annotation(VERSIONED_KEEP_ORIGINAL) {
                plain.push(res.clone());
            }
            versioned.push(res);
        }
        let mut keys = BTreeSet::new();
        for res in &versioned {
            if !keys.insert(UniqueResourceKey::new(res)) {
                return Err(Error::Validation(format!("expected not to find duplicate versioned resource {}", res.description())));
            }
        }

        let empty: Vec<(u64, Resource)> = Vec::new();
        let mut decisions: Vec<Decision> = Vec::new();
        // Names a reference may carry to be rewritten: the base name plus the
        // names assigned by earlier passes. Pins to other versions stay put.
        let mut accepted: BTreeMap<UniqueResourceKey, BTreeSet<String>> = BTreeMap::new();
        // The second pass lets versioned resources that reference each other
        // diff against fully rewritten names.
        for _ in 0..2 {
            decisions.clear();
            for i in 0..versioned.len() {
                let key = UniqueResourceKey::new(&versioned[i]);
                let group = groups.get(&key).unwrap_or(&empty);
                let decision = decide(&versioned[i], group, opts, factory)?;
                let target = versioned[i].clone();
                let new_name = decision.name(group).to_string();
                let names = accepted.entry(key).or_insert_with(|| BTreeSet::from([target.name().to_string()]));
                rewrite_refs(&target, &new_name, names, &template_rules, &mut versioned)?;
                rewrite_refs(&target, &new_name, names, &template_rules, &mut plain)?;
                names.insert(new_name);
                decisions.push(decision);
            }
        }

        let mut changes = Vec::new();
        let mut retained: BTreeMap<UniqueResourceKey, (usize, bool)> = BTreeMap::new();
        for (res, decision) in versioned.iter().zip(decisions) {
            let key = UniqueResourceKey::new(res);
            let group = groups.get(&key).unwrap_or(&empty);
            match decision {
                Decision::Add { name, trial } => {
                    let mut head = res.clone();
                    head.set_name(&name);
                    debug!(resource = %head.description(), "adding resource version");
                    changes.push(match trial {
                        Some(t) => Change::precalculated_add(head, &t)?,
                        None => factory.new_exact_change(None, Some(&head))?,
                    });
                    retained.insert(key, (num_versions(res)?.saturating_sub(1), false));
                }
                Decision::Keep { latest } => {
                    changes.push(factory.new_keep_change(&group[latest].1));
                    retained.insert(key, (num_versions(res)?, true));
                }
            }
        }

        changes.extend(ChangeSet::new(plain_existing, plain, opts, factory).calculate()?);

        for (key, members) in &groups {
            let (keep, latest_emitted) = retained.get(key).copied().unwrap_or((0, false));
            let cutoff = members.len().saturating_sub(keep);
            for (idx, (_, res)) in members.iter().enumerate() {
                if idx < cutoff {
                    changes.push(factory.new_exact_change(Some(res), None)?);
                } else if !(latest_emitted && idx + 1 == members.len()) {
                    changes.push(factory.new_keep_change(res));
                }
            }
        }
        Ok(changes)
    }
}

fn decide(res: &Resource, group: &[(u64, Resource)], opts: ChangeSetOpts, factory: &ChangeFactory) -> Result<Decision> {
    let Some((latest_n, latest)) = group.last() else {
        return Ok(Decision::Add { name: versioned_name(res.name(), 1), trial: None });
    };
    let mut trial_res = res.clone();
    trial_res.set_name(latest.name());
    let trial = if opts.against_last_applied {
        factory.new_change_against_last_applied(Some(latest), Some(&trial_res))?
    } else {
        factory.new_exact_change(Some(latest), Some(&trial_res))?
    };
    Ok(match trial.op() {
        ChangeOp::Keep => Decision::Keep { latest: group.len() - 1 },
        _ => Decision::Add { name: versioned_name(res.name(), latest_n + 1), trial: Some(trial) },
    })
}

fn group_of(api_version: &str) -> &str { api_version.split_once('/').map(|(g, _)| g).unwrap_or("") }

/// Points references to `target` naming one of `accepted` at `new_name` across `resources`.
fn rewrite_refs(target: &Resource, new_name: &str, accepted: &BTreeSet<String>, rules: &[TemplateRule], resources: &mut [Resource]) -> Result<()> {
    for rule in rules.iter().filter(|r| any_matches(&r.resource_matchers, target)) {
        for obj_ref in &rule.affected_resources.object_references {
            let m = ObjectRefSetMod { matcher: ResourceMatcher::AnyMatcher { matchers: obj_ref.resource_matchers.clone() }, path: obj_ref.path.clone() };
            let name_key = obj_ref.name_key();
            for res in resources.iter_mut().filter(|r| r.namespace() == target.namespace()) {
                m.apply(res, |obj| {
                    if ref_matches(obj, name_key, accepted, target) {
                        obj.insert(name_key.to_string(), Json::String(new_name.to_string()));
                    }
                    Ok(())
                })?;
            }
        }
    }

    for res in resources.iter_mut() {
        for (k, raw) in suffixed_values(res, VERSIONED_EXPLICIT_REF) {
            let mut r: ExplicitRef = serde_json::from_str(&raw)
                .map_err(|e| Error::Parse(format!("parsing annotation '{}' on {}: {}", k, res.description(), e)))?;
            let ns = r.namespace.as_deref().unwrap_or(res.namespace());
            if ns == target.namespace() && r.group() == target.api_group() && r.kind == target.kind() && accepted.contains(&r.name) && r.name != new_name {
                r.name = new_name.to_string();
                res.set_annotation(&k, &serde_json::to_string(&r)?);
            }
        }
    }
    Ok(())
}

fn ref_matches(obj: &Map<String, Json>, name_key: &str, accepted: &BTreeSet<String>, target: &Resource) -> bool {
    let field = |k: &str| obj.get(k).and_then(Json::as_str);
    let Some(name) = field(name_key) else { return false };
    accepted.contains(name)
        && field("kind").map_or(true, |k| k == target.kind())
        && field("apiVersion").map_or(true, |v| group_of(v) == target.api_group())
        && field("namespace").filter(|ns| !ns.is_empty()).map_or(true, |ns| ns == target.namespace())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_config::Conf;
    use serde_json::json;

    fn res(v: Json) -> Resource { Resource::from_value(v).unwrap() }

    fn secret(name: &str, data: &str, annotations: Json) -> Resource {
        res(json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": name, "namespace": "ns", "annotations": annotations}, "data": {"k": data}}))
    }

    fn live_secret(base: &str, n: u64, data: &str) -> Resource { secret(&versioned_name(base, n), data, json!({VERSIONED: ""})) }

    fn deployment(secret: &str) -> Resource {
        res(json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "d", "namespace": "ns"},
            "spec": {"template": {"spec": {
                "containers": [{"name": "c", "image": "i", "envFrom": [{"secretRef": {"name": secret}}]}],
                "volumes": [{"name": "v", "secret": {"secretName": secret}}]
            }}}
        }))
    }

    fn run(existing: Vec<Resource>, desired: Vec<Resource>) -> Result<Vec<Change>> {
        let conf = Conf::new(vec![]).unwrap();
        let f = ChangeFactory::from_conf(&conf);
        VersionedChangeSet::new(existing, desired, conf.template_rules(), ChangeSetOpts::default(), &f).calculate()
    }

    fn summary(changes: &[Change]) -> Vec<(String, ChangeOp)> {
        changes.iter().map(|c| (c.resource().name().to_string(), c.op())).collect()
    }

    #[test]
    fn parses_versioned_names() {
        assert_eq!(parse_versioned_name("s-ver-12"), Some(("s", 12)));
        assert_eq!(parse_versioned_name("a-ver-b-ver-2"), Some(("a-ver-b", 2)));
        assert_eq!(parse_versioned_name("s-ver-0"), None);
        assert_eq!(parse_versioned_name("s-ver-x"), None);
        assert_eq!(parse_versioned_name("-ver-1"), None);
    }

    #[test]
    fn first_version_and_references_are_rewritten() {
        let changes = run(vec![], vec![secret("s", "MQ==", json!({VERSIONED: ""})), deployment("s")]).unwrap();
        assert_eq!(summary(&changes), vec![("s-ver-1".to_string(), ChangeOp::Add), ("d".to_string(), ChangeOp::Add)]);
        let d = changes[1].new_resource().unwrap().as_map();
        assert_eq!(d["spec"]["template"]["spec"]["volumes"][0]["secret"]["secretName"], json!("s-ver-1"));
        assert_eq!(d["spec"]["template"]["spec"]["containers"][0]["envFrom"][0]["secretRef"]["name"], json!("s-ver-1"));
    }

    #[test]
    fn unchanged_content_keeps_latest_version() {
        let existing = vec![live_secret("s", 1, "MA=="), live_secret("s", 2, "MQ==")];
        let changes = run(existing, vec![secret("s", "MQ==", json!({VERSIONED: ""})), deployment("s")]).unwrap();
        assert_eq!(
            summary(&changes),
            vec![("s-ver-2".to_string(), ChangeOp::Keep), ("d".to_string(), ChangeOp::Add), ("s-ver-1".to_string(), ChangeOp::Keep)]
        );
        let d = changes[1].new_resource().unwrap().as_map();
        assert_eq!(d["spec"]["template"]["spec"]["volumes"][0]["secret"]["secretName"], json!("s-ver-2"));
    }

    #[test]
    fn changed_content_adds_next_version_and_evicts_surplus() {
        let existing = (1..=3).map(|n| live_secret("s", n, "MA==")).collect();
        let desired = secret("s", "Mg==", json!({VERSIONED: "", NUM_VERSIONS: "2"}));
        let changes = run(existing, vec![desired]).unwrap();
        assert_eq!(
            summary(&changes),
            vec![
                ("s-ver-4".to_string(), ChangeOp::Add),
                ("s-ver-1".to_string(), ChangeOp::Delete),
                ("s-ver-2".to_string(), ChangeOp::Delete),
                ("s-ver-3".to_string(), ChangeOp::Keep),
            ]
        );
        // The add carries the diff against the previous version.
        assert!(changes[0].ops_diff().minimal_string().contains("/data/k"));
    }

    #[test]
    fn pinned_version_reference_is_left_alone() {
        let existing = vec![live_secret("s", 1, "MA=="), live_secret("s", 2, "MA==")];
        let changes = run(existing, vec![secret("s", "Mg==", json!({VERSIONED: ""})), deployment("s-ver-1")]).unwrap();
        assert_eq!(summary(&changes)[0], ("s-ver-3".to_string(), ChangeOp::Add));
        let d = changes.iter().find(|c| c.resource().kind() == "Deployment").unwrap().new_resource().unwrap().as_map();
        assert_eq!(d["spec"]["template"]["spec"]["volumes"][0]["secret"]["secretName"], json!("s-ver-1"));
        assert_eq!(d["spec"]["template"]["spec"]["containers"][0]["envFrom"][0]["secretRef"]["name"], json!("s-ver-1"));
    }

    #[test]
    fn keep_original_and_explicit_refs() {
        let s = secret("s", "MQ==", json!({VERSIONED: "", VERSIONED_KEEP_ORIGINAL: ""}));
        let mut cm = res(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c", "namespace": "other"}}));
        cm.set_annotation(&format!("{}.s", VERSIONED_EXPLICIT_REF), r#"{"namespace":"ns","apiGroup":"core","kind":"Secret","name":"s"}"#);
        let changes = run(vec![], vec![s, cm]).unwrap();
        let names: Vec<_> = summary(&changes).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["s-ver-1", "s", "c"]);
        let rewritten = changes[2].new_resource().unwrap().annotation(&format!("{}.s", VERSIONED_EXPLICIT_REF)).unwrap().to_string();
        let r: ExplicitRef = serde_json::from_str(&rewritten).unwrap();
        assert_eq!(r.name, "s-ver-1");
    }

    #[test]
    fn removed_versioned_resource_deletes_all_versions() {
        let changes = run(vec![live_secret("s", 1, "MA=="), live_secret("s", 2, "MA==")], vec![]).unwrap();
        assert!(changes.iter().all(|c| c.op() == ChangeOp::Delete));
        assert_eq!(changes.len(), 2);
    }

    #[test]
    fn invalid_num_versions_is_rejected() {
        let desired = secret("s", "MQ==", json!({VERSIONED: "", NUM_VERSIONS: "0"}));
        assert!(matches!(run(vec![], vec![desired]), Err(Error::Validation(_))));
    }
}
