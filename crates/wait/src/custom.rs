use keel_config::WaitRule;
use keel_core::Resource;

use crate::state::{condition, conditions, generation_pending, observed_generation, DoneApplyState};

/// Evaluates a user-declared wait rule against the resource's conditions.
pub fn check(rule: &WaitRule, res: &Resource) -> DoneApplyState {
    if rule.supports_observed_generation {
        if let Some(msg) = generation_pending(res, observed_generation(res)) {
            return DoneApplyState::in_progress(msg);
        }
    }
    let conds = conditions(res);
    for name in &rule.failure_conditions {
        if let Some(c) = condition(&conds, name).filter(|c| c.is_true()) {
            return DoneApplyState::failed(format!("Encountered failure condition {}: {}", name, c.detail()));
        }
    }
    let pending: Vec<&str> = rule
        .successful_conditions
        .iter()
        .filter(|name| !condition(&conds, name).map_or(false, |c| c.is_true()))
        .map(String::as_str)
        .collect();
    if pending.is_empty() {
        let matched = rule.successful_conditions.join(", ");
        return if matched.is_empty() { DoneApplyState::ok() } else { DoneApplyState::ok_with(format!("Encountered successful condition {}", matched)) };
    }
    DoneApplyState::in_progress(format!("Waiting on condition(s) {}", pending.join(", ")))
}
