use std::fmt;

use keel_core::Resource;
use serde::Deserialize;

/// Outcome of one convergence check.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DoneApplyState {
    pub done: bool,
    pub successful: bool,
    pub message: String,
}

impl DoneApplyState {
    pub fn ok() -> Self { Self { done: true, successful: true, message: String::new() } }
    pub fn ok_with(message: impl Into<String>) -> Self { Self { done: true, successful: true, message: message.into() } }
    pub fn failed(message: impl Into<String>) -> Self { Self { done: true, successful: false, message: message.into() } }
    pub fn in_progress(message: impl Into<String>) -> Self { Self { done: false, successful: false, message: message.into() } }

    pub fn is_success(&self) -> bool { self.done && self.successful }
    pub fn is_failure(&self) -> bool { self.done && !self.successful }
}

impl fmt::Display for DoneApplyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = match (self.done, self.successful) {
            (true, true) => "ok",
            (true, false) => "failed",
            (false, _) => "ongoing",
        };
        if self.message.is_empty() {
            f.write_str(verdict)
        } else {
            write!(f, "{}: {}", verdict, self.message)
        }
    }
}

/// Loosely typed status condition; any shape with `type` and `status`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusCondition {
    #[serde(rename = "type", default)]
    pub type_: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl StatusCondition {
    pub fn is_true(&self) -> bool { self.status == "True" }

    /// `reason (message)` with whichever parts are present.
    pub fn detail(&self) -> String {
        match (self.reason.as_deref().filter(|s| !s.is_empty()), self.message.as_deref().filter(|s| !s.is_empty())) {
            (Some(r), Some(m)) => format!("{} ({})", r, m),
            (Some(r), None) => r.to_string(),
            (None, Some(m)) => m.to_string(),
            (None, None) => String::new(),
        }
    }
}

pub fn conditions(res: &Resource) -> Vec<StatusCondition> {
    res.status()
        .and_then(|s| s.get("conditions"))
        .and_then(|c| serde_json::from_value::<Vec<StatusCondition>>(c.clone()).ok())
        .unwrap_or_default()
}

pub fn condition<'a>(conds: &'a [StatusCondition], type_: &str) -> Option<&'a StatusCondition> { conds.iter().find(|c| c.type_ == type_) }

/// `Some(message)` while the controller has not observed the current generation.
pub fn generation_pending(res: &Resource, observed: Option<i64>) -> Option<String> {
    let observed = observed.unwrap_or(0);
    (res.generation() > observed).then(|| format!("Waiting for generation {} to be observed", res.generation()))
}

pub fn observed_generation(res: &Resource) -> Option<i64> { res.status().and_then(|s| s.get("observedGeneration")).and_then(|v| v.as_i64()) }
