use serde::{Deserialize, Serialize};

use eidetic_store::{PropositionStatus, ScriptMode};

/// Incremental updates fanned out to per-project subscribers, emitted in the
/// order the reconciler applied them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProjectEvent {
    NewEvidence {
        id: String,
        interview_id: String,
        factor: String,
        outcome: String,
    },
    NewProposition {
        id: String,
        statement: String,
        status: PropositionStatus,
        confidence: f64,
    },
    PropositionUpdated {
        id: String,
        status: PropositionStatus,
        confidence: f64,
    },
    PropositionMerged {
        id: String,
        merged_into: String,
    },
    PropositionPruned {
        id: String,
    },
    ScriptUpdated {
        version: u32,
        mode: ScriptMode,
        convergence_score: f64,
        novelty_rate: f64,
    },
    AnalysisFailed {
        interview_id: Option<String>,
        detail: String,
    },
    ScriptGenerationFailed {
        detail: String,
    },
    PublishFailed {
        script_version: u32,
        detail: String,
    },
}
