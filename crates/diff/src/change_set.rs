use keel_core::{Error, Resource, Result, UniqueResourceKey};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::change::{Change, ChangeFactory};

#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeSetOpts {
    /// Compare against the recorded last-applied form instead of the live object.
    pub against_last_applied: bool,
}

/// Pairs existing and desired resources by key.
pub struct ChangeSet<'a> {
    existing: Vec<Resource>,
    desired: Vec<Resource>,
    opts: ChangeSetOpts,
    factory: &'a ChangeFactory,
}

impl<'a> ChangeSet<'a> {
    pub fn new(existing: Vec<Resource>, desired: Vec<Resource>, opts: ChangeSetOpts, factory: &'a ChangeFactory) -> Self {
        Self { existing, desired, opts, factory }
    }

    /// Changes in desired order, followed by deletes in existing order.
    pub fn calculate(mut self) -> Result<Vec<Change>> {
        let existing = std::mem::take(&mut self.existing);
        let mut existing_by_key: FxHashMap<UniqueResourceKey, Resource> = FxHashMap::default();
        let mut existing_order = Vec::with_capacity(existing.len());
        for res in existing {
            let key = UniqueResourceKey::new(&res);
            if existing_by_key.insert(key.clone(), res).is_none() {
                existing_order.push(key);
            }
        }

        let mut seen: FxHashSet<UniqueResourceKey> = FxHashSet::default();
        let mut changes = Vec::with_capacity(self.desired.len() + existing_order.len());
        for res in &self.desired {
            let key = UniqueResourceKey::new(res);
            if !seen.insert(key.clone()) {
                return Err(Error::Validation(format!("expected not to find duplicate resource {}", res.description())));
            }
            changes.push(self.change(existing_by_key.remove(&key).as_ref(), Some(res))?);
        }
        for key in existing_order {
            if let Some(res) = existing_by_key.remove(&key) {
                changes.push(self.change(Some(&res), None)?);
            }
        }
        debug!(count = changes.len(), against_last_applied = self.opts.against_last_applied, "calculated changes");
        Ok(changes)
    }

    fn change(&self, existing: Option<&Resource>, desired: Option<&Resource>) -> Result<Change> {
        if self.opts.against_last_applied {
            self.factory.new_change_against_last_applied(existing, desired)
        } else {
            self.factory.new_exact_change(existing, desired)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeOp;
    use keel_config::Conf;
    use serde_json::json;

    fn cm(name: &str, v: &str) -> Resource {
        Resource::from_value(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name, "namespace": "ns"}, "data": {"k": v}})).unwrap()
    }

    #[test]
    fn pairs_by_key_and_orders_deletes_last() {
        let f = ChangeFactory::from_conf(&Conf::new(vec![]).unwrap());
        let existing = vec![cm("gone", "x"), cm("same", "1"), cm("changed", "1")];
        let desired = vec![cm("changed", "2"), cm("fresh", "1"), cm("same", "1")];
        let changes = ChangeSet::new(existing, desired, ChangeSetOpts::default(), &f).calculate().unwrap();
        let got: Vec<_> = changes.iter().map(|c| (c.resource().name().to_string(), c.op())).collect();
        assert_eq!(
            got,
            vec![
                ("changed".to_string(), ChangeOp::Update),
                ("fresh".to_string(), ChangeOp::Add),
                ("same".to_string(), ChangeOp::Keep),
                ("gone".to_string(), ChangeOp::Delete),
            ]
        );
    }

    #[test]
    fn duplicate_desired_is_rejected() {
        let f = ChangeFactory::default();
        let err = ChangeSet::new(vec![], vec![cm("a", "1"), cm("a", "2")], ChangeSetOpts::default(), &f).calculate().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn against_last_applied_ignores_fields_present_when_recorded() {
        let f = ChangeFactory::from_conf(&Conf::new(vec![]).unwrap());
        let mut live = cm("a", "1");
        live.as_map_mut().insert("binaryData".into(), json!({"b": "AA=="}));
        let live = f.resource_with_history(&live).record_last_applied(&cm("a", "1")).unwrap().unwrap();

        let opts = ChangeSetOpts { against_last_applied: true };
        let changes = ChangeSet::new(vec![live.clone()], vec![cm("a", "1")], opts, &f).calculate().unwrap();
        assert_eq!(changes[0].op(), ChangeOp::Keep);

        let exact = ChangeSet::new(vec![live], vec![cm("a", "1")], ChangeSetOpts::default(), &f).calculate().unwrap();
        assert_eq!(exact[0].op(), ChangeOp::Update);
    }
}
