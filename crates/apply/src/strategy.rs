//! Per-resource apply strategies read from annotations.

use std::fmt;

use keel_core::annotations::{
    CREATE_STRATEGY, CREATE_STRATEGY_FALLBACK_ON_UPDATE, DELETE_STRATEGY, DELETE_STRATEGY_ORPHAN, DISABLE_WAIT, EXISTS, NOOP,
    UPDATE_STRATEGY, UPDATE_STRATEGY_ALWAYS_REPLACE, UPDATE_STRATEGY_FALLBACK_ON_REPLACE,
};
use keel_core::{Error, Resource, Result};
use keel_diff::{Change, ChangeOp};

fn unknown(key: &str, value: &str, res: &Resource) -> Error {
    Error::Validation(format!("unknown value '{}' for annotation '{}' on {}", value, key, res.description()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateStrategy {
    Default,
    FallbackOnUpdate,
}

impl CreateStrategy {
    pub fn of(res: &Resource) -> Result<Self> {
        match res.annotation(CREATE_STRATEGY) {
            None | Some("") => Ok(Self::Default),
            Some(CREATE_STRATEGY_FALLBACK_ON_UPDATE) => Ok(Self::FallbackOnUpdate),
            Some(v) => Err(unknown(CREATE_STRATEGY, v, res)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStrategy {
    Default,
    FallbackOnReplace,
    AlwaysReplace,
}

impl UpdateStrategy {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "" => Ok(Self::Default),
            UPDATE_STRATEGY_FALLBACK_ON_REPLACE => Ok(Self::FallbackOnReplace),
            UPDATE_STRATEGY_ALWAYS_REPLACE => Ok(Self::AlwaysReplace),
            other => Err(Error::Validation(format!("unknown update strategy '{}'", other))),
        }
    }

    /// The annotation wins; an absent annotation falls back to `default`.
    pub fn of(res: &Resource, default: Self) -> Result<Self> {
        match res.annotation(UPDATE_STRATEGY) {
            None => Ok(default),
            Some(v) => Self::parse(v).map_err(|_| unknown(UPDATE_STRATEGY, v, res)),
        }
    }
}

impl fmt::Display for UpdateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::FallbackOnReplace => f.write_str(UPDATE_STRATEGY_FALLBACK_ON_REPLACE),
            Self::AlwaysReplace => f.write_str(UPDATE_STRATEGY_ALWAYS_REPLACE),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStrategy {
    Default,
    Orphan,
}

impl DeleteStrategy {
    pub fn of(res: &Resource) -> Result<Self> {
        match res.annotation(DELETE_STRATEGY) {
            None | Some("") => Ok(Self::Default),
            Some(DELETE_STRATEGY_ORPHAN) => Ok(Self::Orphan),
            Some(v) => Err(unknown(DELETE_STRATEGY, v, res)),
        }
    }
}

/// What applying a change does on the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOp {
    Noop,
    Create(CreateStrategy),
    Update(UpdateStrategy),
    Delete(DeleteStrategy),
    /// Already terminating: nothing to call, only wait.
    AwaitDeletion,
    /// Declared as pre-existing: nothing to create, only wait.
    Exists,
}

impl ApplyOp {
    pub fn for_change(change: &Change, default_update: UpdateStrategy) -> Result<Self> {
        if change.is_ignored() || change.resource().has_annotation(NOOP) {
            return Ok(Self::Noop);
        }
        match change.op() {
            ChangeOp::Keep => Ok(Self::Noop),
            ChangeOp::Add if change.resource().has_annotation(EXISTS) => Ok(Self::Exists),
            ChangeOp::Add => Ok(Self::Create(CreateStrategy::of(change.resource())?)),
            ChangeOp::Update => Ok(Self::Update(UpdateStrategy::of(change.resource(), default_update)?)),
            ChangeOp::Delete => match change.existing() {
                Some(e) if e.is_being_deleted() => Ok(Self::AwaitDeletion),
                Some(e) => Ok(Self::Delete(DeleteStrategy::of(e)?)),
                None => Ok(Self::Noop),
            },
        }
    }

    pub fn is_noop(&self) -> bool { matches!(self, Self::Noop) }
}

impl fmt::Display for ApplyOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Noop => f.write_str("noop"),
            Self::Create(_) => f.write_str("create"),
            Self::Update(UpdateStrategy::AlwaysReplace) => f.write_str("replace"),
            Self::Update(_) => f.write_str("update"),
            Self::Delete(DeleteStrategy::Orphan) => f.write_str("orphan"),
            Self::Delete(_) | Self::AwaitDeletion => f.write_str("delete"),
            Self::Exists => f.write_str("exists"),
        }
    }
}

/// What waiting on an applied change checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOp {
    Noop,
    Converge,
    Deletion,
    Existence,
}

impl WaitOp {
    pub fn for_change(change: &Change, apply: ApplyOp) -> Self {
        match apply {
            ApplyOp::Noop | ApplyOp::Delete(DeleteStrategy::Orphan) => Self::Noop,
            ApplyOp::Delete(_) | ApplyOp::AwaitDeletion => Self::Deletion,
            ApplyOp::Exists => Self::Existence,
            ApplyOp::Create(_) | ApplyOp::Update(_) if change.resource().has_annotation(DISABLE_WAIT) => Self::Noop,
            ApplyOp::Create(_) | ApplyOp::Update(_) => Self::Converge,
        }
    }
}
