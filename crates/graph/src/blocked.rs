use rustc_hash::FxHashSet;

use crate::graph::{ChangeGraph, NodeId};

/// Tracks which nodes have converged and which are free to apply.
#[derive(Debug, Clone)]
pub struct BlockedChanges {
    waiting_for: Vec<Vec<(NodeId, String)>>,
    descriptions: Vec<String>,
    waited: FxHashSet<NodeId>,
}

impl BlockedChanges {
    pub fn new(graph: &ChangeGraph) -> Self {
        let waiting_for = graph.nodes().iter().map(|n| n.waiting_for().iter().map(|e| (e.to, e.rule.to_string())).collect()).collect();
        let descriptions = graph.nodes().iter().map(|n| n.description()).collect();
        Self { waiting_for, descriptions, waited: FxHashSet::default() }
    }

    fn is_free(&self, id: NodeId) -> bool { self.waiting_for[id].iter().all(|(p, _)| self.waited.contains(p)) }

    /// Nodes whose predecessors have all converged, including converged ones.
    pub fn unblocked(&self) -> Vec<NodeId> { (0..self.waiting_for.len()).filter(|id| self.is_free(*id)).collect() }

    pub fn blocked(&self) -> Vec<NodeId> { (0..self.waiting_for.len()).filter(|id| !self.is_free(*id)).collect() }

    /// Marks `id` as successfully waited.
    pub fn unblock(&mut self, id: NodeId) { self.waited.insert(id); }

    pub fn is_waited(&self, id: NodeId) -> bool { self.waited.contains(&id) }

    pub fn why_blocked(&self, id: NodeId) -> String {
        let pending: Vec<String> = self.waiting_for[id]
            .iter()
            .filter(|(p, _)| !self.waited.contains(p))
            .map(|(p, rule)| format!("  - {} (rule: {})", self.descriptions[*p], rule))
            .collect();
        if pending.is_empty() {
            return format!("{} is not blocked", self.descriptions[id]);
        }
        format!("{} is waiting on {} change(s):\n{}", self.descriptions[id], pending.len(), pending.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_config::Conf;
    use keel_core::Resource;
    use keel_diff::ChangeFactory;
    use serde_json::json;

    #[test]
    fn unblocks_successors_once_waited() {
        let f = ChangeFactory::default();
        let ns = Resource::from_value(json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "app1"}})).unwrap();
        let cm = Resource::from_value(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "app-config", "namespace": "app1"}})).unwrap();
        let changes = vec![f.new_exact_change(None, Some(&cm)).unwrap(), f.new_exact_change(None, Some(&ns)).unwrap()];
        let graph = ChangeGraph::from_conf(changes, &Conf::new(vec![]).unwrap()).unwrap();
        let mut blocked = BlockedChanges::new(&graph);

        assert_eq!(blocked.unblocked(), vec![1]);
        assert_eq!(blocked.blocked(), vec![0]);
        let why = blocked.why_blocked(0);
        assert!(why.contains("waiting on 1 change(s)"), "why={}", why);
        assert!(why.contains("(add) namespace/app1 (v1) cluster (rule: upsert after upserting change-groups.keel.dev/namespaces)"), "why={}", why);

        blocked.unblock(1);
        assert!(blocked.is_waited(1));
        assert_eq!(blocked.unblocked(), vec![0, 1]);
        assert!(blocked.blocked().is_empty());
        assert!(blocked.why_blocked(0).ends_with("is not blocked"));
    }
}
