use serde::{Deserialize, Serialize};

/// Failure details reported by the cluster for a rejected request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApiFailure {
    pub code: u16,
    pub reason: String,
    pub message: String,
}

impl ApiFailure {
    pub fn new(code: u16, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code, reason: reason.into(), message: message.into() }
    }
}

impl std::fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{} (code {})", self.message, self.code)
        } else {
            write!(f, "{} (reason: {}, code {})", self.message, self.reason, self.code)
        }
    }
}

/// Engine errors. Cluster-originated variants keep the server's reason code.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("path {path}: expected {expected}, found {found}")]
    PathTypeMismatch { path: String, expected: &'static str, found: String },
    #[error("conflict: {0}")]
    Conflict(ApiFailure),
    #[error("invalid: {0}")]
    Invalid(ApiFailure),
    #[error("already exists: {0}")]
    AlreadyExists(ApiFailure),
    #[error("not found: {0}")]
    NotFound(ApiFailure),
    #[error("api: {0}")]
    Api(ApiFailure),
    #[error("transport: {0}")]
    Transport(String),
    #[error("detected cycle while ordering changes: {0}")]
    Cycle(String),
    #[error("{desc}: failed to update due to resource conflict (approved diff no longer matches): {source}")]
    DriftDetected { desc: String, source: Box<Error> },
    #[error("{desc}: finished unsuccessfully ({message})")]
    ConvergenceFailed { desc: String, message: String },
    #[error("timed out waiting after {0:?}")]
    Timeout(std::time::Duration),
    #[error("cancelled")]
    Cancelled,
    #[error("internal: {0}")]
    Internal(String),
    #[error("{op} {desc}: {source}")]
    Change { desc: String, op: String, source: Box<Error> },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wraps an error with the description and operation of the change that produced it.
    pub fn in_change(self, desc: impl Into<String>, op: impl Into<String>) -> Self {
        Error::Change { desc: desc.into(), op: op.into(), source: Box::new(self) }
    }

    /// Innermost error beneath any `Change` context.
    pub fn root(&self) -> &Error {
        match self {
            Error::Change { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_conflict(&self) -> bool { matches!(self.root(), Error::Conflict(_)) }
    pub fn is_invalid(&self) -> bool { matches!(self.root(), Error::Invalid(_)) }
    pub fn is_not_found(&self) -> bool { matches!(self.root(), Error::NotFound(_)) }
    pub fn is_already_exists(&self) -> bool { matches!(self.root(), Error::AlreadyExists(_)) }

    /// Errors worth retrying at the apply layer. Webhook timeouts surface as 504/500 with a Timeout reason.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Error::Transport(_) => true,
            Error::Api(f) => f.code == 429 || f.reason == "Timeout" || f.reason == "ServerTimeout",
            _ => false,
        }
    }

    /// Server reason code, when the error came from the cluster.
    pub fn reason(&self) -> Option<&str> {
        match self.root() {
            Error::Conflict(f) | Error::Invalid(f) | Error::AlreadyExists(f) | Error::NotFound(f) | Error::Api(f) => {
                Some(f.reason.as_str())
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self { Error::Parse(e.to_string()) }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self { Error::Parse(e.to_string()) }
}

impl From<regex::Error> for Error {
    fn from(e: regex::Error) -> Self { Error::Validation(e.to_string()) }
}
