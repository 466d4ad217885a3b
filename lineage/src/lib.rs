//! Provenance recording for symbolic edits.
//!
//! A project opts in by carrying a lineage store under its marker directory
//! (`.spectrena/lineage.db` or `.spectrena/lineage`). [`LineageRecorder`]
//! attributes each completed edit to a task and appends one `code_changes`
//! row per touched file. Recording is best-effort: every failure is logged
//! and folded into a [`RecordOutcome`], never returned as an error.

mod context;
mod error;
mod marker;
mod recorder;
mod store;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use context::{ActiveTask, TaskContext, TaskContextResolver, TaskSource};
pub use marker::{StoreKind, StoreMarker, find_store_marker};
pub use recorder::{
    ChangeSet, FileChange, LineageRecorder, RecordOutcome, STORED_HASH_LEN, SkipReason,
};
pub use store::{LineageConfig, LineageStore};
