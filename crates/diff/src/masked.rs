//! Hides sensitive values from textual diffs.

use keel_config::DiffMaskRule;
use keel_core::resource::canonical_json;
use keel_core::{ObjectRefSetMod, Resource, ResourceMatcher, Result};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;

/// Masks values under each matching rule's path, numbering distinct values so
/// equal values on both sides read the same.
pub fn mask_pair(left: Option<&Resource>, right: Option<&Resource>, rules: &[DiffMaskRule]) -> Result<(Option<Resource>, Option<Resource>)> {
    let mut seen: FxHashMap<String, usize> = FxHashMap::default();
    let mut out = [left.cloned(), right.cloned()];
    for rule in rules {
        let m = ObjectRefSetMod { matcher: ResourceMatcher::AnyMatcher { matchers: rule.resource_matchers.clone() }, path: rule.path.clone() };
        for res in out.iter_mut().flatten() {
            m.apply(res, |obj| {
                for val in obj.values_mut() {
                    let key = canonical_json(val);
                    let next = seen.len() + 1;
                    let n = *seen.entry(key).or_insert(next);
                    *val = Json::String(format!("<-- value not shown (#{})", n));
                }
                Ok(())
            })?;
        }
    }
    let [l, r] = out;
    Ok((l, r))
}
