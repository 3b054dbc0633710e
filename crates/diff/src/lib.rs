//! Keel diff: pairs desired and live resources into changes, rebases
//! server-owned fields, renders textual and structural diffs, keeps the
//! last-applied record and expands versioned resources.

#![forbid(unsafe_code)]

pub mod change;
pub mod change_set;
pub mod history;
pub mod masked;
pub mod ops_diff;
pub mod text_diff;
pub mod versioned;

pub use change::{Change, ChangeFactory, ChangeOp};
pub use change_set::{ChangeSet, ChangeSetOpts};
pub use history::ResourceWithHistory;
pub use ops_diff::{DiffOp, OpsDiff};
pub use text_diff::{DiffLine, LineTag, TextDiff};
pub use versioned::{ExplicitRef, VersionedChangeSet};
