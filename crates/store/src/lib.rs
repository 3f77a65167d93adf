//! Per-project durable state: evidence, propositions, interviews, scripts,
//! and the monotonic identifier counters.  All other crates see this state
//! only as consistent snapshots (`ProjectState`) and structural diffs
//! (`StoreDiff`) applied through [`ProjectStore::commit`].

mod diff;
mod ids;
mod schema;
mod store;

pub use diff::StoreDiff;
pub use ids::IdCounters;
pub use schema::{
    Evidence, Instruction, Interview, InterviewScript, Priority, Project, Proposition,
    PropositionStatus, ScriptMode, ScriptSection,
};
pub use store::{ProjectState, ProjectStore, StoreError};
