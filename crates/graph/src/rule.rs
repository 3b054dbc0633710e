//! Change rules: `(upsert|delete) (before|after) (upserting|deleting) <group>`.

use std::fmt;

use keel_core::{Error, Resource, Result};
use keel_diff::ChangeOp;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::group::{resolve_placeholders, ChangeGroup, CRDS_GROUP, NAMESPACES_GROUP};

static RULE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(upsert|delete) (before|after) (upserting|deleting) (.+)$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleAction {
    Upsert,
    Delete,
}

impl RuleAction {
    /// Keep changes never match.
    pub fn matches(&self, op: ChangeOp) -> bool {
        match self {
            RuleAction::Upsert => matches!(op, ChangeOp::Add | ChangeOp::Update),
            RuleAction::Delete => op == ChangeOp::Delete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleOrder {
    Before,
    After,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChangeRule {
    pub action: RuleAction,
    pub order: RuleOrder,
    pub target_action: RuleAction,
    pub target_group: ChangeGroup,
    pub ignore_if_cyclical: bool,
}

impl ChangeRule {
    pub fn parse(s: &str, ignore_if_cyclical: bool) -> Result<Self> {
        let caps = RULE
            .captures(s.trim())
            .ok_or_else(|| Error::Parse(format!("expected change rule '{}' to match '(upsert|delete) (before|after) (upserting|deleting) <group>'", s)))?;
        let action = if &caps[1] == "upsert" { RuleAction::Upsert } else { RuleAction::Delete };
        let order = if &caps[2] == "before" { RuleOrder::Before } else { RuleOrder::After };
        let target_action = if &caps[3] == "upserting" { RuleAction::Upsert } else { RuleAction::Delete };
        let target_group = ChangeGroup::new(caps[4].trim())?;
        Ok(Self { action, order, target_action, target_group, ignore_if_cyclical })
    }

    /// Parses after resolving placeholders against the resource carrying the rule.
    pub fn from_template(s: &str, res: &Resource, ignore_if_cyclical: bool) -> Result<Self> {
        Self::parse(&resolve_placeholders(s, res)?, ignore_if_cyclical)
    }

    /// Ordering every resource receives unless it opts out.
    pub fn builtin_for(res: &Resource) -> Vec<Self> {
        let rule = |action, order, target_action, group: &'static str| Self {
            action,
            order,
            target_action,
            target_group: ChangeGroup::builtin(group),
            ignore_if_cyclical: true,
        };
        let mut out = Vec::new();
        if !crate::group::is_crd(res) {
            out.push(rule(RuleAction::Upsert, RuleOrder::After, RuleAction::Upsert, CRDS_GROUP));
            out.push(rule(RuleAction::Delete, RuleOrder::Before, RuleAction::Delete, CRDS_GROUP));
        }
        if !res.namespace().is_empty() {
            out.push(rule(RuleAction::Upsert, RuleOrder::After, RuleAction::Upsert, NAMESPACES_GROUP));
        }
        out
    }
}

impl fmt::Display for ChangeRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = |a: RuleAction, ing: bool| match (a, ing) {
            (RuleAction::Upsert, false) => "upsert",
            (RuleAction::Delete, false) => "delete",
            (RuleAction::Upsert, true) => "upserting",
            (RuleAction::Delete, true) => "deleting",
        };
        let order = match self.order {
            RuleOrder::Before => "before",
            RuleOrder::After => "after",
        };
        write!(f, "{} {} {} {}", action(self.action, false), order, action(self.target_action, true), self.target_group)
    }
}
