use std::fmt;
use std::sync::Arc;

use keel_config::{Conf, DiffMaskRule};
use keel_core::mods::{ModSources, ResourceMod};
use keel_core::{Error, Resource, Result, UniqueResourceKey};
use once_cell::sync::OnceCell;
use crate::history::ResourceWithHistory;
use crate::masked::mask_pair;
use crate::ops_diff::OpsDiff;
use crate::text_diff::TextDiff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChangeOp {
    Add,
    Delete,
    Update,
    Keep,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Add => "add",
            ChangeOp::Delete => "delete",
            ChangeOp::Update => "update",
            ChangeOp::Keep => "keep",
        }
    }
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// One reconciled pair. `new` is the rebased desired form; `applied` is the
/// desired form as authored, kept for recording on the server.
#[derive(Debug, Clone)]
pub struct Change {
    existing: Option<Resource>,
    new: Option<Resource>,
    applied: Option<Resource>,
    op: ChangeOp,
    masks: Arc<Vec<DiffMaskRule>>,
    text_diff: OnceCell<TextDiff>,
    ops_diff: OnceCell<OpsDiff>,
}

impl Change {
    fn new(existing: Option<Resource>, new: Option<Resource>, applied: Option<Resource>, masks: Arc<Vec<DiffMaskRule>>) -> Result<Self> {
        let mut change = Self { existing, new, applied, op: ChangeOp::Keep, masks, text_diff: OnceCell::new(), ops_diff: OnceCell::new() };
        change.op = change.classify()?;
        Ok(change)
    }

    fn classify(&self) -> Result<ChangeOp> {
        match (&self.existing, &self.new) {
            (None, None) => Err(Error::Internal("change requires an existing or a desired resource".into())),
            (None, Some(_)) => Ok(ChangeOp::Add),
            (Some(_), None) => Ok(ChangeOp::Delete),
            // A terminating live copy cannot be updated; it is recreated once gone.
            (Some(e), Some(_)) if e.is_being_deleted() => Ok(ChangeOp::Add),
            (Some(_), Some(_)) if self.ops_diff().is_empty() => Ok(ChangeOp::Keep),
            (Some(_), Some(_)) => Ok(ChangeOp::Update),
        }
    }

    /// Add for `new` that reuses diffs computed against a previous version.
    pub(crate) fn precalculated_add(new: Resource, trial: &Change) -> Result<Self> {
        let text = trial.text_diff()?.clone();
        let ops = trial.ops_diff().clone();
        Ok(Self {
            existing: None,
            applied: Some(new.clone()),
            new: Some(new),
            op: ChangeOp::Add,
            masks: trial.masks.clone(),
            text_diff: OnceCell::with_value(text),
            ops_diff: OnceCell::with_value(ops),
        })
    }

    /// Keep pinned to a live resource.
    pub(crate) fn keep_of(existing: &Resource, masks: Arc<Vec<DiffMaskRule>>) -> Self {
        let res = ResourceWithHistory::historyless(existing);
        Self {
            existing: Some(res.clone()),
            new: Some(res.clone()),
            applied: Some(res),
            op: ChangeOp::Keep,
            masks,
            text_diff: OnceCell::with_value(TextDiff::default()),
            ops_diff: OnceCell::with_value(OpsDiff::default()),
        }
    }

    pub fn op(&self) -> ChangeOp { self.op }
    pub fn existing(&self) -> Option<&Resource> { self.existing.as_ref() }
    pub fn new_resource(&self) -> Option<&Resource> { self.new.as_ref() }
    pub fn applied(&self) -> Option<&Resource> { self.applied.as_ref() }

    /// Desired side when present, live side otherwise.
    pub fn resource(&self) -> &Resource {
        match (&self.new, &self.existing) {
            (Some(r), _) | (None, Some(r)) => r,
            // Construction guarantees one side.
            (None, None) => unreachable!("change without resources"),
        }
    }

    pub fn key(&self) -> UniqueResourceKey { UniqueResourceKey::new(self.resource()) }
    pub fn description(&self) -> String { self.resource().description() }

    /// Deletes of resources the engine did not create are left to the cluster.
    pub fn ignored_reason(&self) -> Option<&'static str> {
        match (&self.op, &self.existing) {
            (ChangeOp::Delete, Some(e)) if e.transient() => Some("cluster managed"),
            _ => None,
        }
    }

    pub fn is_ignored(&self) -> bool { self.ignored_reason().is_some() }

    pub fn ops_diff(&self) -> &OpsDiff {
        self.ops_diff.get_or_init(|| {
            let l = self.existing.as_ref().map(Resource::to_value);
            let r = self.new.as_ref().map(Resource::to_value);
            OpsDiff::new(l.as_ref(), r.as_ref())
        })
    }

    pub fn text_diff(&self) -> Result<&TextDiff> {
        self.text_diff.get_or_try_init(|| {
            let (l, r) = mask_pair(self.existing.as_ref(), self.new.as_ref(), &self.masks)?;
            let yaml = |r: Option<Resource>| -> Result<String> { r.map(|r| r.to_yaml()).transpose().map(Option::unwrap_or_default) };
            Ok(TextDiff::new(&yaml(l)?, &yaml(r)?))
        })
    }

    pub fn fingerprint(&self) -> String { self.ops_diff().fingerprint() }
}

/// Builds changes with the configured rebase, exclusion and mask rules.
#[derive(Debug, Clone, Default)]
pub struct ChangeFactory {
    rebase_mods: Arc<Vec<ResourceMod>>,
    exclusion_mods: Arc<Vec<ResourceMod>>,
    masks: Arc<Vec<DiffMaskRule>>,
}

impl ChangeFactory {
    pub fn new(rebase_mods: Vec<ResourceMod>, exclusion_mods: Vec<ResourceMod>, masks: Vec<DiffMaskRule>) -> Self {
        Self { rebase_mods: Arc::new(rebase_mods), exclusion_mods: Arc::new(exclusion_mods), masks: Arc::new(masks) }
    }

    pub fn from_conf(conf: &Conf) -> Self {
        Self::new(conf.rebase_mods(), conf.diff_against_last_applied_field_exclusion_mods(), conf.diff_mask_rules())
    }

    pub fn masks(&self) -> Arc<Vec<DiffMaskRule>> { self.masks.clone() }

    /// Overwrites server-owned fields of `new` using the configured rules.
    pub fn rebase(&self, existing: Option<&Resource>, new: &Resource) -> Result<Resource> {
        let mut result = new.clone();
        let Some(existing) = existing else { return Ok(result) };
        let srcs = ModSources::new(Some(new), Some(existing));
        for m in self.rebase_mods.iter() {
            m.apply(&mut result, &srcs)?;
        }
        Ok(result)
    }

    pub(crate) fn exclude(&self, res: &Resource) -> Result<Resource> {
        let mut out = res.clone();
        for m in self.exclusion_mods.iter() {
            m.apply(&mut out, &ModSources::default())?;
        }
        Ok(out)
    }

    pub fn new_exact_change(&self, existing: Option<&Resource>, new: Option<&Resource>) -> Result<Change> {
        let existing = existing.map(ResourceWithHistory::historyless);
        let new = new.map(ResourceWithHistory::historyless);
        let rebased = new.as_ref().map(|n| self.rebase(existing.as_ref(), n)).transpose()?;
        Change::new(existing, rebased, new, self.masks.clone())
    }

    /// Like [`Self::new_exact_change`] but compares against the last applied form
    /// recorded on the live resource, when that record is still trustworthy.
    pub fn new_change_against_last_applied(&self, existing: Option<&Resource>, new: Option<&Resource>) -> Result<Change> {
        let live = existing.cloned();
        let compared = match existing {
            Some(e) => {
                let base = match self.resource_with_history(e).last_applied_resource()? {
                    Some(last) => {
                        let mut rebased = self.rebase(Some(e), &last)?;
                        rebased.mark_transient(e.transient());
                        rebased
                    }
                    None => e.clone(),
                };
                Some(ResourceWithHistory::historyless(&base))
            }
            None => None,
        };
        let new = new.map(ResourceWithHistory::historyless);
        let rebased = new.as_ref().map(|n| self.rebase(live.as_ref(), n)).transpose()?;
        Change::new(compared, rebased, new, self.masks.clone())
    }

    pub fn new_keep_change(&self, existing: &Resource) -> Change { Change::keep_of(existing, self.masks.clone()) }

    pub fn resource_with_history<'a>(&'a self, res: &Resource) -> ResourceWithHistory<'a> { ResourceWithHistory::new(res.clone(), self) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value as Json};

    fn res(v: Json) -> Resource { Resource::from_value(v).unwrap() }

    fn factory() -> ChangeFactory { ChangeFactory::from_conf(&Conf::new(vec![]).unwrap()) }

    fn live_cm(data: &str) -> Resource {
        res(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "c", "namespace": "ns", "uid": "u1", "resourceVersion": "5", "creationTimestamp": "2024-01-01T00:00:00Z", "labels": {"a": "1"}},
            "data": {"k": data}
        }))
    }

    fn desired_cm(data: &str) -> Resource {
        res(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c", "namespace": "ns", "labels": {"a": "1"}}, "data": {"k": data}}))
    }

    #[test]
    fn classifies_pairs() {
        let f = factory();
        assert_eq!(f.new_exact_change(None, Some(&desired_cm("v"))).unwrap().op(), ChangeOp::Add);
        assert_eq!(f.new_exact_change(Some(&live_cm("v")), None).unwrap().op(), ChangeOp::Delete);
        assert_eq!(f.new_exact_change(Some(&live_cm("v")), Some(&desired_cm("v"))).unwrap().op(), ChangeOp::Keep);
        let upd = f.new_exact_change(Some(&live_cm("v")), Some(&desired_cm("w"))).unwrap();
        assert_eq!(upd.op(), ChangeOp::Update);
        assert!(upd.text_diff().unwrap().minimal_string().contains("+   k: w"));
        assert_eq!(upd.ops_diff().ops().len(), 1);
        assert!(f.new_exact_change(None, None).is_err());
    }

    #[test]
    fn rebase_keeps_desired_for_recording() {
        let f = factory();
        let c = f.new_exact_change(Some(&live_cm("v")), Some(&desired_cm("w"))).unwrap();
        assert_eq!(c.new_resource().unwrap().uid(), Some("u1"));
        assert_eq!(c.applied().unwrap().uid(), None);
    }

    #[test]
    fn transient_delete_is_ignored_and_terminating_live_is_add() {
        let f = factory();
        let mut live = live_cm("v");
        live.mark_transient(true);
        let c = f.new_exact_change(Some(&live), None).unwrap();
        assert_eq!(c.ignored_reason(), Some("cluster managed"));

        let mut terminating = live_cm("v");
        terminating.as_map_mut()["metadata"]["deletionTimestamp"] = json!("2024-01-02T00:00:00Z");
        let c = f.new_exact_change(Some(&terminating), Some(&desired_cm("v"))).unwrap();
        assert_eq!(c.op(), ChangeOp::Add);
    }

    #[test]
    fn secret_values_are_masked_in_text_diff_only() {
        let f = factory();
        let live = res(json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "s", "namespace": "ns"}, "data": {"p": "b2xk"}}));
        let desired = res(json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "s", "namespace": "ns"}, "data": {"p": "bmV3"}}));
        let c = f.new_exact_change(Some(&live), Some(&desired)).unwrap();
        assert_eq!(c.op(), ChangeOp::Update);
        let text = c.text_diff().unwrap().full_string();
        assert!(!text.contains("bmV3"), "text={}", text);
        assert!(text.contains("value not shown (#2)"), "text={}", text);
        assert!(c.ops_diff().minimal_string().contains("bmV3"));
    }
}
