//! The three LLM-backed agents.  Each wraps the shared oracle with a narrow
//! operation surface: the Designer authors interview scripts, the Analyst
//! turns transcripts into proposed knowledge-base diffs, the Synthesizer
//! writes the final report.  None of them writes to the stores.

mod analyst;
mod designer;
mod synthesizer;

pub use analyst::{
    AnalysisDiff, Analyst, AnalystError, EvidenceMapping, ExtractedEvidence, MergeProposal,
    ProposedProposition, Relation, RetroMapping, SubsumeProposal, jaccard, merge_candidates,
};
pub use designer::{
    Designer, DesignerError, PlannedSection, ScriptMetrics, build_interviewer_prompt,
    plan_sections,
};
pub use synthesizer::Synthesizer;
