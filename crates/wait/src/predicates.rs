use keel_config::{Conf, WaitRule};
use keel_core::matcher::any_matches;
use keel_core::{Resource, Result};
use tracing::trace;

use crate::custom;
use crate::kinds;
use crate::state::DoneApplyState;

/// Per-resource convergence check, selected by [`ConvergencePredicates::for_resource`].
#[derive(Debug, Clone, PartialEq)]
pub enum Convergence {
    Deleting,
    Custom(WaitRule),
    Crd,
    ApiService { ignore_failing: bool },
    Deployment,
    DaemonSet,
    StatefulSet,
    ReplicaSet,
    Pod,
    Service,
    Job,
    CronJob,
    Reconciling,
    Generic,
}

impl Convergence {
    pub fn check(&self, res: &Resource) -> Result<DoneApplyState> {
        match self {
            Convergence::Deleting => Ok(DoneApplyState::in_progress("Deleting")),
            Convergence::Custom(rule) => Ok(custom::check(rule, res)),
            Convergence::Crd => kinds::crd(res),
            Convergence::ApiService { ignore_failing } => kinds::api_service(res, *ignore_failing),
            Convergence::Deployment => kinds::deployment(res),
            Convergence::DaemonSet => kinds::daemon_set(res),
            Convergence::StatefulSet => kinds::stateful_set(res),
            Convergence::ReplicaSet => kinds::replica_set(res),
            Convergence::Pod => kinds::pod(res),
            Convergence::Service => kinds::service(res),
            Convergence::Job => kinds::job(res),
            Convergence::CronJob | Convergence::Generic => Ok(DoneApplyState::ok()),
            Convergence::Reconciling => kinds::reconciling(res),
        }
    }
}

/// Chooses a convergence check per resource; custom rules win over built-ins.
#[derive(Debug, Clone, Default)]
pub struct ConvergencePredicates {
    rules: Vec<WaitRule>,
    ignore_failing_api_services: bool,
}

impl ConvergencePredicates {
    pub fn new(rules: Vec<WaitRule>) -> Self { Self { rules, ignore_failing_api_services: false } }

    pub fn from_conf(conf: &Conf) -> Self { Self::new(conf.wait_rules()) }

    pub fn with_ignore_failing_api_services(mut self, ignore: bool) -> Self {
        self.ignore_failing_api_services = ignore;
        self
    }

    pub fn for_resource(&self, res: &Resource) -> Convergence {
        if res.is_being_deleted() {
            return Convergence::Deleting;
        }
        if let Some(rule) = self.rules.iter().find(|r| any_matches(&r.resource_matchers, res)) {
            trace!(resource = %res.description(), "using custom wait rule");
            return Convergence::Custom(rule.clone());
        }
        match (res.api_group(), res.kind()) {
            ("apiextensions.k8s.io", "CustomResourceDefinition") => Convergence::Crd,
            ("apiregistration.k8s.io", "APIService") => Convergence::ApiService { ignore_failing: self.ignore_failing_api_services },
            ("apps", "Deployment") | ("extensions", "Deployment") => Convergence::Deployment,
            ("apps", "DaemonSet") | ("extensions", "DaemonSet") => Convergence::DaemonSet,
            ("apps", "StatefulSet") => Convergence::StatefulSet,
            ("apps", "ReplicaSet") | ("extensions", "ReplicaSet") => Convergence::ReplicaSet,
            ("", "Pod") => Convergence::Pod,
            ("", "Service") => Convergence::Service,
            ("batch", "Job") => Convergence::Job,
            ("batch", "CronJob") => Convergence::CronJob,
            _ if kinds::is_reconciling_kind(res) => Convergence::Reconciling,
            _ => Convergence::Generic,
        }
    }

    pub fn check(&self, res: &Resource) -> Result<DoneApplyState> { self.for_resource(res).check(res) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ResourceMatcher;
    use serde_json::json;

    #[test]
    fn selection_order() {
        let dep = Resource::from_value(json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "d", "namespace": "ns"}})).unwrap();
        let preds = ConvergencePredicates::default();
        assert_eq!(preds.for_resource(&dep), Convergence::Deployment);

        let rule = WaitRule { successful_conditions: vec!["Available".into()], resource_matchers: vec![ResourceMatcher::api_group_kind("apps", "Deployment")], ..Default::default() };
        let preds = ConvergencePredicates::new(vec![rule.clone()]);
        assert_eq!(preds.for_resource(&dep), Convergence::Custom(rule));

        let mut deleting = dep.clone();
        deleting.as_map_mut()["metadata"]["deletionTimestamp"] = json!("2024-01-01T00:00:00Z");
        assert_eq!(preds.for_resource(&deleting), Convergence::Deleting);
        assert_eq!(preds.check(&deleting).unwrap(), DoneApplyState::in_progress("Deleting"));

        let cm = Resource::from_value(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c"}})).unwrap();
        assert!(preds.check(&cm).unwrap().is_success());

        let app = Resource::from_value(json!({
            "apiVersion": "kappctrl.k14s.io/v1alpha1", "kind": "App", "metadata": {"name": "a"},
            "status": {"conditions": [{"type": "ReconcileFailed", "status": "True", "message": "fetch failed"}]}
        }))
        .unwrap();
        assert_eq!(preds.for_resource(&app), Convergence::Reconciling);
        assert!(preds.check(&app).unwrap().is_failure());
    }

    #[test]
    fn failing_api_services_can_be_ignored() {
        let svc = Resource::from_value(json!({
            "apiVersion": "apiregistration.k8s.io/v1", "kind": "APIService", "metadata": {"name": "v1.metrics"},
            "status": {"conditions": [{"type": "Available", "status": "False", "reason": "MissingEndpoints"}]}
        }))
        .unwrap();
        assert!(!ConvergencePredicates::default().check(&svc).unwrap().done);
        let ignoring = ConvergencePredicates::default().with_ignore_failing_api_services(true);
        let st = ignoring.check(&svc).unwrap();
        assert!(st.is_success());
        assert!(st.message.contains("MissingEndpoints"));
    }
}
