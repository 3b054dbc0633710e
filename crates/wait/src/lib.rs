//! Keel wait: decides whether an applied resource has converged. Built-in
//! checks cover common workload kinds; custom wait rules from config take
//! precedence; parents can fold in the state of associated resources.

#![forbid(unsafe_code)]

pub mod associated;
pub mod custom;
pub mod kinds;
pub mod predicates;
pub mod state;

pub use associated::{aggregate, wait_for_associated};
pub use predicates::{Convergence, ConvergencePredicates};
pub use state::DoneApplyState;
