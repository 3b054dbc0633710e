//! Built-in convergence checks for well-known kinds.

use k8s_openapi::api::apps::v1::{DaemonSetStatus, DeploymentStatus, ReplicaSetStatus, StatefulSetStatus};
use k8s_openapi::api::batch::v1::JobStatus;
use k8s_openapi::api::core::v1::{PodStatus, ServiceStatus};
use keel_core::annotations::DEPLOYMENT_MIN_AVAILABLE;
use keel_core::prelude::*;
use serde::de::DeserializeOwned;
use serde_json::Value as Json;

use crate::state::{condition, conditions, generation_pending, observed_generation, DoneApplyState};

fn status_of<T: DeserializeOwned + Default>(res: &Resource) -> Result<T> {
    match res.status() {
        None | Some(Json::Null) => Ok(T::default()),
        Some(s) => serde_json::from_value(s.clone()).map_err(|e| Error::Parse(format!("decoding status of {}: {}", res.description(), e))),
    }
}

fn spec_i64(res: &Resource, path: &[&str]) -> Option<i64> {
    let mut cur = res.as_map().get("spec")?;
    for k in path {
        cur = cur.get(k)?;
    }
    cur.as_i64()
}

fn spec_str<'a>(res: &'a Resource, key: &str) -> Option<&'a str> { res.as_map().get("spec").and_then(|s| s.get(key)).and_then(Json::as_str) }

fn spec_replicas(res: &Resource) -> i64 { spec_i64(res, &["replicas"]).unwrap_or(1) }

pub fn crd(res: &Resource) -> Result<DoneApplyState> {
    let conds = conditions(res);
    if let Some(c) = condition(&conds, "NamesAccepted").filter(|c| c.status == "False") {
        return Ok(DoneApplyState::failed(format!("Names not accepted: {}", c.detail())));
    }
    let established = condition(&conds, "Established").map_or(false, |c| c.is_true());
    let accepted = condition(&conds, "NamesAccepted").map_or(false, |c| c.is_true());
    Ok(if established && accepted { DoneApplyState::ok() } else { DoneApplyState::in_progress("Waiting for Established and NamesAccepted conditions") })
}

pub fn api_service(res: &Resource, ignore_failing: bool) -> Result<DoneApplyState> {
    let conds = conditions(res);
    match condition(&conds, "Available") {
        Some(c) if c.is_true() => Ok(DoneApplyState::ok()),
        Some(c) if ignore_failing => Ok(DoneApplyState::ok_with(format!("Ignoring unavailable API service: {}", c.detail()))),
        Some(c) => Ok(DoneApplyState::in_progress(format!("Waiting to become available: {}", c.detail()))),
        None if ignore_failing => Ok(DoneApplyState::ok_with("Ignoring API service without Available condition")),
        None => Ok(DoneApplyState::in_progress("Waiting to become available")),
    }
}

/// Parses the minimum-available annotation: an integer or a percentage of
/// spec replicas, rounded up.
pub fn min_available(res: &Resource) -> Result<Option<i64>> {
    let Some(raw) = res.annotation(DEPLOYMENT_MIN_AVAILABLE) else { return Ok(None) };
    let invalid = || Error::Validation(format!("expected annotation '{}' on {} to be an integer or percentage, got '{}'", DEPLOYMENT_MIN_AVAILABLE, res.description(), raw));
    if let Some(pct) = raw.trim().strip_suffix('%') {
        let pct: i64 = pct.parse().map_err(|_| invalid())?;
        if !(0..=100).contains(&pct) {
            return Err(invalid());
        }
        return Ok(Some((spec_replicas(res) * pct + 99) / 100));
    }
    raw.trim().parse::<i64>().ok().filter(|n| *n >= 0).map(Some).ok_or_else(invalid)
}

pub fn deployment(res: &Resource) -> Result<DoneApplyState> {
    let st: DeploymentStatus = status_of(res)?;
    if let Some(msg) = generation_pending(res, st.observed_generation) {
        return Ok(DoneApplyState::in_progress(msg));
    }
    for c in st.conditions.iter().flatten() {
        if c.type_ == "Progressing" && c.status == "False" {
            let detail = [c.reason.as_deref(), c.message.as_deref()].into_iter().flatten().collect::<Vec<_>>().join(": ");
            return Ok(DoneApplyState::failed(format!("Deployment is not progressing: {}", detail)));
        }
    }
    let available = i64::from(st.available_replicas.unwrap_or(0));
    if let Some(min) = min_available(res)? {
        return Ok(if available >= min {
            DoneApplyState::ok_with(format!("Found {} available replicas (minimum {})", available, min))
        } else {
            DoneApplyState::in_progress(format!("Waiting for {} available replicas, found {}", min, available))
        });
    }
    let replicas = spec_replicas(res);
    let updated = i64::from(st.updated_replicas.unwrap_or(0));
    if updated < replicas {
        return Ok(DoneApplyState::in_progress(format!("Waiting for {} updated replicas, found {}", replicas, updated)));
    }
    let unavailable = st.unavailable_replicas.unwrap_or(0);
    if unavailable > 0 {
        return Ok(DoneApplyState::in_progress(format!("Waiting for {} unavailable replicas", unavailable)));
    }
    Ok(DoneApplyState::ok())
}

pub fn daemon_set(res: &Resource) -> Result<DoneApplyState> {
    let st: DaemonSetStatus = status_of(res)?;
    if let Some(msg) = generation_pending(res, st.observed_generation) {
        return Ok(DoneApplyState::in_progress(msg));
    }
    let updated = st.updated_number_scheduled.unwrap_or(0);
    if updated < st.desired_number_scheduled {
        return Ok(DoneApplyState::in_progress(format!("Waiting for {} updated pods, found {}", st.desired_number_scheduled, updated)));
    }
    let unavailable = st.number_unavailable.unwrap_or(0);
    if unavailable > 0 {
        return Ok(DoneApplyState::in_progress(format!("Waiting for {} unavailable pods", unavailable)));
    }
    Ok(DoneApplyState::ok())
}

pub fn stateful_set(res: &Resource) -> Result<DoneApplyState> {
    let st: StatefulSetStatus = status_of(res)?;
    if let Some(msg) = generation_pending(res, st.observed_generation) {
        return Ok(DoneApplyState::in_progress(msg));
    }
    let replicas = spec_replicas(res);
    let partition = spec_i64(res, &["updateStrategy", "rollingUpdate", "partition"]).unwrap_or(0).clamp(0, replicas);
    let expected_updated = replicas - partition;
    let updated = i64::from(st.updated_replicas.unwrap_or(0));
    if updated < expected_updated {
        return Ok(DoneApplyState::in_progress(format!("Waiting for {} replicas to be updated, found {}", expected_updated, updated)));
    }
    let ready = i64::from(st.ready_replicas.unwrap_or(0));
    if ready != replicas {
        return Ok(DoneApplyState::in_progress(format!("Waiting for {} ready replicas, found {}", replicas, ready)));
    }
    Ok(DoneApplyState::ok())
}

pub fn replica_set(res: &Resource) -> Result<DoneApplyState> {
    let st: ReplicaSetStatus = status_of(res)?;
    if let Some(msg) = generation_pending(res, st.observed_generation) {
        return Ok(DoneApplyState::in_progress(msg));
    }
    let replicas = spec_replicas(res);
    let available = i64::from(st.available_replicas.unwrap_or(0));
    if available < replicas {
        return Ok(DoneApplyState::in_progress(format!("Waiting for {} available replicas, found {}", replicas, available)));
    }
    Ok(DoneApplyState::ok())
}

pub fn pod(res: &Resource) -> Result<DoneApplyState> {
    let st: PodStatus = status_of(res)?;
    match st.phase.as_deref().unwrap_or("Pending") {
        "Pending" => {
            let waiting = st
                .container_statuses
                .iter()
                .flatten()
                .filter_map(|cs| cs.state.as_ref()?.waiting.as_ref()?.reason.clone())
                .next();
            Ok(DoneApplyState::in_progress(match waiting {
                Some(reason) => format!("Pending: {}", reason),
                None => "Pending".to_string(),
            }))
        }
        "Running" => {
            let is_true = |t: &str| st.conditions.iter().flatten().any(|c| c.type_ == t && c.status == "True");
            let missing: Vec<&str> = ["Initialized", "Ready", "PodScheduled"].into_iter().filter(|t| !is_true(t)).collect();
            Ok(if missing.is_empty() { DoneApplyState::ok() } else { DoneApplyState::in_progress(format!("Running, waiting for conditions: {}", missing.join(", "))) })
        }
        "Succeeded" => Ok(DoneApplyState::ok_with("Succeeded")),
        "Failed" => Ok(DoneApplyState::failed(format!("Failed: {}", st.message.or(st.reason).unwrap_or_default()))),
        other => Ok(DoneApplyState::failed(format!("Phase {}", other))),
    }
}

pub fn service(res: &Resource) -> Result<DoneApplyState> {
    let type_ = spec_str(res, "type").unwrap_or("ClusterIP");
    if type_ == "ExternalName" {
        return Ok(DoneApplyState::ok());
    }
    if spec_str(res, "clusterIP").map_or(true, str::is_empty) {
        return Ok(DoneApplyState::in_progress("Waiting for cluster IP"));
    }
    if type_ == "LoadBalancer" {
        let st: ServiceStatus = status_of(res)?;
        let ingress = st.load_balancer.and_then(|lb| lb.ingress).unwrap_or_default();
        if ingress.is_empty() {
            return Ok(DoneApplyState::in_progress("Waiting for load balancer ingress"));
        }
    }
    Ok(DoneApplyState::ok())
}

pub fn job(res: &Resource) -> Result<DoneApplyState> {
    let st: JobStatus = status_of(res)?;
    for c in st.conditions.iter().flatten() {
        if c.status != "True" {
            continue;
        }
        match c.type_.as_str() {
            "Failed" => return Ok(DoneApplyState::failed(format!("Failed: {}", c.message.clone().or_else(|| c.reason.clone()).unwrap_or_default()))),
            "Complete" => return Ok(DoneApplyState::ok_with("Completed")),
            _ => {}
        }
    }
    Ok(DoneApplyState::in_progress(format!(
        "Waiting to complete ({} active, {} failed, {} succeeded)",
        st.active.unwrap_or(0),
        st.failed.unwrap_or(0),
        st.succeeded.unwrap_or(0)
    )))
}

/// Resources reconciled by a controller that reports `ReconcileSucceeded`,
/// `ReconcileFailed` and `Reconciling` conditions.
pub fn reconciling(res: &Resource) -> Result<DoneApplyState> {
    if let Some(msg) = generation_pending(res, observed_generation(res)) {
        return Ok(DoneApplyState::in_progress(msg));
    }
    let conds = conditions(res);
    if let Some(c) = condition(&conds, "ReconcileFailed").filter(|c| c.is_true()) {
        return Ok(DoneApplyState::failed(format!("Reconcile failed: {}", c.detail())));
    }
    if condition(&conds, "ReconcileSucceeded").map_or(false, |c| c.is_true()) {
        return Ok(DoneApplyState::ok());
    }
    Ok(DoneApplyState::in_progress("Reconciling"))
}

pub fn is_reconciling_kind(res: &Resource) -> bool {
    conditions(res).iter().any(|c| matches!(c.type_.as_str(), "ReconcileSucceeded" | "ReconcileFailed" | "Reconciling"))
}
