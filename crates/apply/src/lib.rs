//! Keel apply: turns planned changes into ordered cluster calls. Changes are
//! applied in dependency batches, conflicting updates are recalculated
//! against the live object, and every applied change is waited on before its
//! dependents run.

#![forbid(unsafe_code)]

pub mod cluster_change;
pub mod cluster_change_set;
pub mod labels;
pub mod opts;
pub mod reconcile;
pub mod retry;
pub mod strategy;
pub mod waiting;

pub use cluster_change::{ChangeContext, ClusterChange};
pub use cluster_change_set::{ApplyReport, ClusterChangeSet};
pub use labels::LabeledResources;
pub use opts::ReconcileOpts;
pub use reconcile::{Plan, PlanSummary, Reconciler};
pub use retry::RetryingGateway;
pub use strategy::{ApplyOp, CreateStrategy, DeleteStrategy, UpdateStrategy, WaitOp};
