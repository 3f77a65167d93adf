use serde::{Deserialize, Serialize};

use crate::ids::IdCounters;
use crate::schema::{Evidence, Interview, InterviewScript, Proposition};

/// A validated structural diff against one project's state.
///
/// Produced by the reconciler after id assignment and invariant checks;
/// applied atomically by [`crate::ProjectStore::commit`].  Updated
/// propositions are full replacements keyed by id — merge links and
/// pruned-status flips arrive as updates with `merged_into` / `weak` set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreDiff {
    pub interview: Option<Interview>,
    pub new_evidence: Vec<Evidence>,
    pub new_propositions: Vec<Proposition>,
    pub updated_propositions: Vec<Proposition>,
    pub script: Option<InterviewScript>,
    /// Post-assignment counter values.  `None` leaves counters untouched.
    pub counters: Option<IdCounters>,
}

impl StoreDiff {
    pub fn is_empty(&self) -> bool {
        self.interview.is_none()
            && self.new_evidence.is_empty()
            && self.new_propositions.is_empty()
            && self.updated_propositions.is_empty()
            && self.script.is_none()
    }
}
