//! Keel graph: change groups and rules resolved from annotations, bindings
//! and built-in defaults, the dependency graph over changes and the
//! blocked/unblocked bookkeeping the apply loop drives.

#![forbid(unsafe_code)]

pub mod blocked;
pub mod graph;
pub mod group;
pub mod rule;

pub use blocked::BlockedChanges;
pub use graph::{ChangeGraph, Edge, Node, NodeId};
pub use group::{ChangeGroup, CRDS_GROUP, NAMESPACES_GROUP};
pub use rule::{ChangeRule, RuleAction, RuleOrder};
