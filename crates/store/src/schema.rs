use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a causal claim.  `Weak` and `Merged` are terminal for active
/// participation: such propositions are excluded from mapping, merging,
/// scripts, and convergence metrics, but stay in the store for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropositionStatus {
    Untested,
    Exploring,
    Confirmed,
    Challenged,
    Saturated,
    Weak,
    Merged,
}

impl PropositionStatus {
    /// Live propositions take part in mapping, merging, and scripts.
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Weak | Self::Merged)
    }

    /// Denominator membership for the convergence score.
    pub fn counts_for_convergence(self) -> bool {
        matches!(
            self,
            Self::Exploring | Self::Confirmed | Self::Challenged | Self::Saturated
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

/// What the interviewer should do with a proposition's script section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Instruction {
    Explore,
    Verify,
    Challenge,
    Saturated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptMode {
    Divergent,
    Convergent,
}

/// A single respondent observation: verbatim quote in the source language,
/// interpretive fields in English.  Append-only once committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub id: String,
    pub interview_id: String,
    pub quote: String,
    pub interpretation: String,
    pub factor: String,
    pub mechanism: String,
    pub outcome: String,
    pub tags: Vec<String>,
    pub language: String,
    pub timestamp: DateTime<Utc>,
}

/// A causal claim of the form factor → mechanism → outcome, aggregated from
/// evidence.  `confidence` is whatever the last reconciliation produced; it
/// is never recomputed on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposition {
    pub id: String,
    pub factor: String,
    pub mechanism: String,
    pub outcome: String,
    pub confidence: f64,
    pub status: PropositionStatus,
    pub supporting_evidence: BTreeSet<String>,
    pub contradicting_evidence: BTreeSet<String>,
    pub first_seen_interview: Option<String>,
    pub last_updated_interview: Option<String>,
    pub interviews_without_new_evidence: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_into: Option<String>,
}

impl Proposition {
    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }

    /// One-line rendering used in prompts and reports.
    pub fn statement(&self) -> String {
        format!("{} → {} → {}", self.factor, self.mechanism, self.outcome)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interview {
    pub id: String,
    pub conversation_id: String,
    pub transcript: String,
    pub received_at: DateTime<Utc>,
    pub script_version_used: Option<u32>,
    pub language: String,
    /// Analysis failure detail, recorded when the transcript was kept but
    /// could not be processed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptSection {
    pub proposition_id: String,
    pub priority: Priority,
    pub instruction: Instruction,
    pub main_question: String,
    pub probes: Vec<String>,
    pub context: String,
}

/// An immutable Designer-produced interview guide.  Only one version is
/// active per project at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterviewScript {
    pub version: u32,
    pub generated_after_interview: Option<String>,
    pub research_question: String,
    pub opening_question: String,
    pub sections: Vec<ScriptSection>,
    pub closing_question: String,
    pub wildcard: String,
    pub mode: ScriptMode,
    pub convergence_score: f64,
    pub novelty_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes_summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub research_question: String,
    pub seed_angles: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// External voice-runtime agent identifier; webhook deliveries are
    /// routed to the owning project by this id.
    pub voice_agent_id: String,
    pub current_script_version: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serde_uses_lowercase_names() {
        let json = serde_json::to_string(&PropositionStatus::Challenged).unwrap();
        assert_eq!(json, "\"challenged\"");
        let back: PropositionStatus = serde_json::from_str("\"saturated\"").unwrap();
        assert_eq!(back, PropositionStatus::Saturated);
    }

    #[test]
    fn instruction_serde_uses_uppercase_names() {
        let json = serde_json::to_string(&Instruction::Explore).unwrap();
        assert_eq!(json, "\"EXPLORE\"");
    }

    #[test]
    fn merged_and_weak_are_not_live() {
        assert!(!PropositionStatus::Merged.is_live());
        assert!(!PropositionStatus::Weak.is_live());
        assert!(PropositionStatus::Challenged.is_live());
        assert!(!PropositionStatus::Untested.counts_for_convergence());
        assert!(PropositionStatus::Saturated.counts_for_convergence());
    }
}
