use keel_config::{ChangeGroupBinding, ChangeRuleBinding, Conf};
use keel_core::annotations::{suffixed_values, CHANGE_GROUP, CHANGE_RULE, DISABLE_DEFAULT_CHANGE_GROUP_AND_RULES};
use keel_core::matcher::any_matches;
use keel_core::{Error, Resource, Result};
use keel_diff::{Change, ChangeOp};
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::group::{is_crd, ChangeGroup, CRDS_GROUP, NAMESPACES_GROUP};
use crate::rule::{ChangeRule, RuleOrder};

pub type NodeId = usize;

/// `from` waits for `to` because of `rule`.
#[derive(Debug, Clone)]
pub struct Edge {
    pub to: NodeId,
    pub rule: ChangeRule,
}

#[derive(Debug)]
pub struct Node {
    pub change: Change,
    pub groups: Vec<ChangeGroup>,
    pub rules: Vec<ChangeRule>,
    waiting_for: Vec<Edge>,
}

impl Node {
    pub fn waiting_for(&self) -> &[Edge] { &self.waiting_for }

    pub fn description(&self) -> String { format!("({}) {}", self.change.op(), self.change.description()) }
}

/// Dependency graph over changes, stored as an arena indexed by [`NodeId`].
#[derive(Debug)]
pub struct ChangeGraph {
    nodes: Vec<Node>,
}

impl ChangeGraph {
    pub fn from_conf(changes: Vec<Change>, conf: &Conf) -> Result<Self> {
        Self::new(changes, &conf.change_group_bindings(), &conf.change_rule_bindings())
    }

    pub fn new(changes: Vec<Change>, group_bindings: &[ChangeGroupBinding], rule_bindings: &[ChangeRuleBinding]) -> Result<Self> {
        let mut nodes = Vec::with_capacity(changes.len());
        for change in changes {
            let res = change.resource();
            let groups = groups_for(res, group_bindings).map_err(|e| e.in_change(change.description(), "resolving change groups for"))?;
            let rules = rules_for(res, rule_bindings).map_err(|e| e.in_change(change.description(), "resolving change rules for"))?;
            nodes.push(Node { change, groups, rules, waiting_for: Vec::new() });
        }
        let mut graph = Self { nodes };
        graph.build_edges()?;
        Ok(graph)
    }

    fn build_edges(&mut self) -> Result<()> {
        let mut by_group: FxHashMap<&ChangeGroup, Vec<NodeId>> = FxHashMap::default();
        for (id, node) in self.nodes.iter().enumerate() {
            for g in &node.groups {
                by_group.entry(g).or_default().push(id);
            }
        }

        let mut mandatory = Vec::new();
        let mut optional = Vec::new();
        for (id, node) in self.nodes.iter().enumerate() {
            let op = node.change.op();
            for rule in node.rules.iter().filter(|r| r.action.matches(op)) {
                let Some(targets) = by_group.get(&rule.target_group) else { continue };
                for &other in targets {
                    if other == id || !rule.target_action.matches(self.nodes[other].change.op()) {
                        continue;
                    }
                    let (from, to) = match rule.order {
                        RuleOrder::After => (id, other),
                        RuleOrder::Before => (other, id),
                    };
                    let edge = (from, Edge { to, rule: rule.clone() });
                    if rule.ignore_if_cyclical {
                        optional.push(edge);
                    } else {
                        mandatory.push(edge);
                    }
                }
            }
        }

        for (from, edge) in mandatory {
            self.add_edge(from, edge);
        }
        if let Some(trace) = self.find_cycle() {
            return Err(Error::Cycle(trace));
        }
        for (from, edge) in optional {
            if self.reaches(edge.to, from) {
                counter!("keel_graph_dropped_edges_total", 1u64);
                debug!(from = %self.nodes[from].description(), to = %self.nodes[edge.to].description(), rule = %edge.rule, "dropping cyclical optional edge");
                continue;
            }
            self.add_edge(from, edge);
        }
        Ok(())
    }

    fn add_edge(&mut self, from: NodeId, edge: Edge) {
        let node = &mut self.nodes[from];
        if !node.waiting_for.iter().any(|e| e.to == edge.to) {
            node.waiting_for.push(edge);
        }
    }

    /// True when `from` transitively waits for `target`.
    fn reaches(&self, from: NodeId, target: NodeId) -> bool {
        let mut seen = FxHashSet::default();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if seen.insert(id) {
                stack.extend(self.nodes[id].waiting_for.iter().map(|e| e.to));
            }
        }
        false
    }

    fn find_cycle(&self) -> Option<String> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        fn visit<'g>(g: &'g ChangeGraph, id: NodeId, colors: &mut [Color], path: &mut Vec<(NodeId, &'g ChangeRule)>) -> Option<String> {
            colors[id] = Color::Gray;
            for edge in &g.nodes[id].waiting_for {
                path.push((id, &edge.rule));
                match colors[edge.to] {
                    Color::Gray => {
                        let start = path.iter().position(|(n, _)| *n == edge.to).unwrap_or(0);
                        let mut trace: Vec<String> = Vec::new();
                        for (n, rule) in &path[start..] {
                            trace.push(g.nodes[*n].description());
                            trace.push(format!("[{}]", rule));
                        }
                        trace.push(g.nodes[edge.to].description());
                        return Some(trace.join(" -> "));
                    }
                    Color::White => {
                        if let Some(t) = visit(g, edge.to, colors, path) {
                            return Some(t);
                        }
                    }
                    Color::Black => {}
                }
                path.pop();
            }
            colors[id] = Color::Black;
            None
        }

        let mut colors = vec![Color::White; self.nodes.len()];
        let mut path = Vec::new();
        for id in 0..self.nodes.len() {
            if colors[id] == Color::White {
                if let Some(t) = visit(self, id, &mut colors, &mut path) {
                    return Some(t);
                }
            }
        }
        None
    }

    pub fn len(&self) -> usize { self.nodes.len() }
    pub fn is_empty(&self) -> bool { self.nodes.is_empty() }
    pub fn node(&self, id: NodeId) -> &Node { &self.nodes[id] }
    pub fn change(&self, id: NodeId) -> &Change { &self.nodes[id].change }
    pub fn nodes(&self) -> &[Node] { &self.nodes }

    pub fn waiting_for(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ { self.nodes[id].waiting_for.iter().map(|e| e.to) }

    pub fn all_matching(&self, pred: impl Fn(&Change) -> bool) -> Vec<NodeId> {
        self.nodes.iter().enumerate().filter(|(_, n)| pred(&n.change)).map(|(id, _)| id).collect()
    }

    /// Topological layers: every node appears after all nodes it waits for.
    pub fn linearize(&self) -> Vec<Vec<NodeId>> {
        let mut done: FxHashSet<NodeId> = FxHashSet::default();
        let mut layers = Vec::new();
        while done.len() < self.nodes.len() {
            let layer: Vec<NodeId> =
                (0..self.nodes.len()).filter(|id| !done.contains(id) && self.waiting_for(*id).all(|p| done.contains(&p))).collect();
            if layer.is_empty() {
                break;
            }
            done.extend(layer.iter().copied());
            layers.push(layer);
        }
        layers
    }

    /// One line per node in linearized order, indented by layer.
    pub fn print_linearized(&self) -> String {
        let mut out = String::new();
        for (depth, layer) in self.linearize().iter().enumerate() {
            for id in layer {
                out.push_str(&format!("{}{}\n", "  ".repeat(depth), self.nodes[*id].description()));
            }
        }
        out
    }

    pub fn ops_count(&self, op: ChangeOp) -> usize { self.nodes.iter().filter(|n| n.change.op() == op).count() }
}

fn groups_for(res: &Resource, bindings: &[ChangeGroupBinding]) -> Result<Vec<ChangeGroup>> {
    let mut out = Vec::new();
    for (_, v) in suffixed_values(res, CHANGE_GROUP) {
        out.push(ChangeGroup::from_template(&v, res)?);
    }
    for b in bindings.iter().filter(|b| any_matches(&b.resource_matchers, res)) {
        out.push(ChangeGroup::from_template(&b.name, res)?);
    }
    if !res.has_annotation(DISABLE_DEFAULT_CHANGE_GROUP_AND_RULES) {
        if is_crd(res) {
            out.push(ChangeGroup::builtin(CRDS_GROUP));
        }
        if res.api_group().is_empty() && res.kind() == "Namespace" {
            out.push(ChangeGroup::builtin(NAMESPACES_GROUP));
        }
    }
    out.sort();
    out.dedup();
    Ok(out)
}

fn rules_for(res: &Resource, bindings: &[ChangeRuleBinding]) -> Result<Vec<ChangeRule>> {
    let mut out = Vec::new();
    for (_, v) in suffixed_values(res, CHANGE_RULE) {
        out.push(ChangeRule::from_template(&v, res, false)?);
    }
    for b in bindings.iter().filter(|b| any_matches(&b.resource_matchers, res)) {
        for r in &b.rules {
            out.push(ChangeRule::from_template(r, res, b.ignore_if_cyclical)?);
        }
    }
    if !res.has_annotation(DISABLE_DEFAULT_CHANGE_GROUP_AND_RULES) {
        out.extend(ChangeRule::builtin_for(res));
    }
    Ok(out)
}
