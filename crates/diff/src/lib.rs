//! Three-way change computation: structural ops diffs, rebase, embedded
//! last-applied history, and the change set builder.

#![forbid(unsafe_code)]

pub mod change;
pub mod changeset;
pub mod history;
pub mod ops;
pub mod rebase;
pub mod template;

pub use change::{Change, ChangeFactory, ChangeOp};
pub use changeset::{ChangeSet, ChangeSetOpts};
pub use history::{historyless, ResourceWithHistory};
pub use ops::{FieldOp, OpsDiff};

use berth_core::CoreError;

#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    #[error("invalid change: neither existing nor new resource present")]
    InvalidChange,
    #[error("history for {resource} does not fit the annotation budget ({bytes} bytes)")]
    HistoryTooLarge { resource: String, bytes: usize },
    #[error("rebase failed for {resource}: {source}")]
    RebaseFailed {
        resource: String,
        #[source]
        source: CoreError,
    },
    #[error(transparent)]
    Core(#[from] CoreError),
}
