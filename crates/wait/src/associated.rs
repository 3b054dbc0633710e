//! Waiting on resources created on behalf of a parent (pods of a deployment, ...).

use keel_core::annotations::DISABLE_ASSOCIATED_RESOURCES_WAIT;
use keel_core::{Error, Resource, Result};

use crate::state::DoneApplyState;

/// Whether the parent's associated resources should be waited on.
/// The opt-out annotation must carry an empty value.
pub fn wait_for_associated(res: &Resource) -> Result<bool> {
    match res.annotation(DISABLE_ASSOCIATED_RESOURCES_WAIT) {
        Some("") => return Ok(false),
        Some(v) => {
            return Err(Error::Validation(format!(
                "expected annotation '{}' on {} to have empty value, got '{}'",
                DISABLE_ASSOCIATED_RESOURCES_WAIT,
                res.description(),
                v
            )))
        }
        None => {}
    }
    Ok(matches!((res.api_group(), res.kind()), ("apps", "Deployment") | ("apps", "DaemonSet") | ("batch", "Job")))
}

/// Combines the parent's verdict with its associates'. A done parent wins;
/// otherwise the first failed associate fails the wait.
pub fn aggregate(parent: DoneApplyState, associated: &[(String, DoneApplyState)]) -> DoneApplyState {
    if parent.done {
        return parent;
    }
    if let Some((desc, st)) = associated.iter().find(|(_, st)| st.is_failure()) {
        return DoneApplyState::failed(format!("Associated resource {} failed: {}", desc, st.message));
    }
    let pending: Vec<String> = associated.iter().filter(|(_, st)| !st.done).map(|(desc, st)| format!("{}: {}", desc, st.message)).collect();
    if pending.is_empty() {
        return parent;
    }
    let mut msg = parent.message;
    if !msg.is_empty() {
        msg.push_str("; ");
    }
    msg.push_str(&format!("waiting on {} associated resource(s): {}", pending.len(), pending.join(", ")));
    DoneApplyState::in_progress(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn opt_out_must_be_empty() {
        let mut dep = Resource::from_value(json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "d"}})).unwrap();
        assert!(wait_for_associated(&dep).unwrap());
        dep.set_annotation(DISABLE_ASSOCIATED_RESOURCES_WAIT, "");
        assert!(!wait_for_associated(&dep).unwrap());
        dep.set_annotation(DISABLE_ASSOCIATED_RESOURCES_WAIT, "yes");
        assert!(matches!(wait_for_associated(&dep), Err(Error::Validation(_))));

        let cm = Resource::from_value(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c"}})).unwrap();
        assert!(!wait_for_associated(&cm).unwrap());
    }

    #[test]
    fn aggregation() {
        let pod = |st: DoneApplyState| ("pod/p (v1) namespace: ns".to_string(), st);
        assert!(aggregate(DoneApplyState::ok(), &[pod(DoneApplyState::failed("boom"))]).is_success());

        let failed = aggregate(DoneApplyState::in_progress("rolling"), &[pod(DoneApplyState::failed("CrashLoopBackOff"))]);
        assert!(failed.is_failure());
        assert!(failed.message.contains("CrashLoopBackOff"));

        let pending = aggregate(DoneApplyState::in_progress("rolling"), &[pod(DoneApplyState::in_progress("Pending"))]);
        assert!(!pending.done);
        assert_eq!(pending.message, "rolling; waiting on 1 associated resource(s): pod/p (v1) namespace: ns: Pending");
    }
}
