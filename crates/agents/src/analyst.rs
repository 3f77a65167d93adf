//! Single-pass transcript analysis.
//!
//! One oracle call per interview covers evidence extraction, mapping against
//! every live proposition, orphan-driven proposition generation, the
//! retroactive scan of prior evidence against newly born propositions, and
//! authored text for merge/subsume proposals.  The reply is validated record
//! by record into the tagged shapes below; anything else is dropped with a
//! warning.  The Analyst is a pure function of its inputs — it never writes.

use std::collections::BTreeSet;

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use eidetic_config::AgentModelConfig;
use eidetic_llm::{ChatMessage, LlmError, Oracle};
use eidetic_store::{ProjectState, Proposition, ScriptMode};

#[derive(Debug, Error)]
pub enum AnalystError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    /// The reply parsed as JSON but carried no usable analysis.
    #[error("analysis reply unusable: {0}")]
    Shape(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    Supports,
    Contradicts,
}

/// An extracted observation, still carrying the Analyst's symbolic ref
/// (`e1`, `e2`…).  Real ids are assigned by the reconciler on commit.
#[derive(Debug, Clone)]
pub struct ExtractedEvidence {
    pub symbol: String,
    pub quote: String,
    pub interpretation: String,
    pub factor: String,
    pub mechanism: String,
    pub outcome: String,
    pub tags: Vec<String>,
    pub language: String,
}

/// New evidence classified against an existing live proposition.
#[derive(Debug, Clone)]
pub struct EvidenceMapping {
    pub evidence_symbol: String,
    pub proposition_id: String,
    pub relation: Relation,
}

/// A newly generated proposition with symbolic ref (`p1`…).  Evidence refs
/// may be symbols from this interview or real ids surfaced by the
/// retroactive scan.
#[derive(Debug, Clone)]
pub struct ProposedProposition {
    pub symbol: String,
    pub factor: String,
    pub mechanism: String,
    pub outcome: String,
    pub supporting_refs: Vec<String>,
    pub contradicting_refs: Vec<String>,
}

/// Pre-existing evidence re-classified against a newly born proposition.
#[derive(Debug, Clone)]
pub struct RetroMapping {
    pub evidence_id: String,
    pub proposition_symbol: String,
    pub relation: Relation,
}

/// Unified text authored for a pair of overlapping propositions.  Candidate
/// pairs are precomputed in code; the model never picks them.
#[derive(Debug, Clone)]
pub struct MergeProposal {
    pub source_ids: Vec<String>,
    pub factor: String,
    pub mechanism: String,
    pub outcome: String,
}

/// A strict specialization folded into its generalization.
#[derive(Debug, Clone)]
pub struct SubsumeProposal {
    pub specific_id: String,
    pub general_id: String,
}

/// Everything the Analyst proposes for one interview.  Symbolic ids only;
/// the reconciler performs final id assignment and invariant checks.
#[derive(Debug, Clone, Default)]
pub struct AnalysisDiff {
    pub evidence: Vec<ExtractedEvidence>,
    pub mappings: Vec<EvidenceMapping>,
    pub new_propositions: Vec<ProposedProposition>,
    pub retro_mappings: Vec<RetroMapping>,
    pub merges: Vec<MergeProposal>,
    pub subsumes: Vec<SubsumeProposal>,
}

// ── Merge candidate detection ─────────────────────────────────────────────────

/// Jaccard similarity of two evidence-id sets; 0 when the union is empty.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Pairs of live propositions whose supporting-evidence overlap crosses the
/// merge threshold, with their similarity.  Pure; the Analyst prompt lists
/// these so the model authors unified text without choosing pairs.
pub fn merge_candidates(
    propositions: &[&Proposition],
    threshold: f64,
) -> Vec<(String, String, f64)> {
    let mut candidates = Vec::new();
    for (i, a) in propositions.iter().enumerate() {
        for b in &propositions[i + 1..] {
            let similarity = jaccard(&a.supporting_evidence, &b.supporting_evidence);
            if similarity >= threshold {
                candidates.push((a.id.clone(), b.id.clone(), similarity));
            }
        }
    }
    candidates
}

// ── The agent ─────────────────────────────────────────────────────────────────

pub struct Analyst {
    oracle: Oracle,
    model: AgentModelConfig,
}

impl Analyst {
    pub fn new(oracle: Oracle, model: AgentModelConfig) -> Self {
        Self { oracle, model }
    }

    /// Analyze one transcript against a store snapshot.
    ///
    /// `merge_threshold` gates the precomputed merge candidates; `mode`
    /// tightens new-proposition generation when the project has converged.
    pub async fn analyze(
        &self,
        transcript: &str,
        interview_id: &str,
        language: &str,
        state: &ProjectState,
        mode: ScriptMode,
        merge_threshold: f64,
    ) -> Result<AnalysisDiff, AnalystError> {
        let live = state.live_propositions();
        let candidates = merge_candidates(&live, merge_threshold);
        let prompt = build_analysis_prompt(transcript, language, state, &live, &candidates, mode);

        let reply = self
            .oracle
            .chat_json(
                &self.model.model,
                &[
                    ChatMessage::system(ANALYST_ROLE),
                    ChatMessage::user(prompt),
                ],
                self.model.temperature,
                self.model.max_tokens,
            )
            .await?;

        let diff = parse_analysis_reply(&reply, language)?;
        info!(
            interview = %interview_id,
            evidence = diff.evidence.len(),
            mappings = diff.mappings.len(),
            new_propositions = diff.new_propositions.len(),
            retro_mappings = diff.retro_mappings.len(),
            merges = diff.merges.len(),
            subsumes = diff.subsumes.len(),
            "transcript analyzed"
        );
        Ok(diff)
    }
}

const ANALYST_ROLE: &str = "You are a qualitative research analyst. You extract causal \
     observations from interview transcripts and maintain a knowledge base of causal \
     propositions. You reply with a single strict JSON object and nothing else.";

fn build_analysis_prompt(
    transcript: &str,
    language: &str,
    state: &ProjectState,
    live: &[&Proposition],
    merge_candidates: &[(String, String, f64)],
    mode: ScriptMode,
) -> String {
    let proposition_block = if live.is_empty() {
        "  (none yet)".to_string()
    } else {
        live.iter()
            .map(|p| {
                format!(
                    "  [{}] {} (status={:?}, support={}, contradict={})",
                    p.id,
                    p.statement(),
                    p.status,
                    p.supporting_evidence.len(),
                    p.contradicting_evidence.len(),
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let prior_evidence_block = if state.evidence.is_empty() {
        "  (none yet)".to_string()
    } else {
        state
            .evidence
            .iter()
            .map(|e| format!("  [{}] {}", e.id, truncate(&e.interpretation, 160)))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let merge_block = if merge_candidates.is_empty() {
        String::new()
    } else {
        let pairs = merge_candidates
            .iter()
            .map(|(a, b, sim)| format!("  {a} + {b} (overlap {sim:.2})"))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "\n\nMERGE CANDIDATES (these pairs share enough supporting evidence to be unified; \
             author one combined factor/mechanism/outcome per pair in \"merges\"):\n{pairs}"
        )
    };

    let mode_directive = match mode {
        ScriptMode::Divergent => {
            "The project is still divergent: generate a new proposition from any cluster of 2+ \
             related orphan observations, from a single orphan with a strong clear signal, or \
             from a causal pattern you recognize across observations."
        }
        ScriptMode::Convergent => {
            "The project has converged: generate a new proposition ONLY for orphan evidence \
             whose causal claim is unambiguous. Prefer leaving observations unmapped."
        }
    };

    format!(
        "RESEARCH QUESTION:\n{question}\n\n\
         CURRENT PROPOSITIONS:\n{proposition_block}\n\n\
         PRIOR EVIDENCE (id and interpretation):\n{prior_evidence_block}\n\n\
         TRANSCRIPT (language: {language}; mine ONLY respondent turns, never the interviewer):\n\
         {transcript}\n\n\
         Perform a single-pass analysis:\n\
         1. Extract 10-25 atomic observations from respondent turns. The \"quote\" must be a \
         verbatim substring of a respondent turn in the source language; \"interpretation\", \
         \"factor\", \"mechanism\", \"outcome\" and \"tags\" (2-5) are English.\n\
         2. Classify every observation against every current proposition as supports, \
         contradicts, or irrelevant. Omit irrelevant pairs from the output.\n\
         3. {mode_directive}\n\
         4. For every NEW proposition, re-classify every item of PRIOR EVIDENCE against it \
         (\"retro\" entries; omit irrelevant pairs).\n\
         5. For each pair listed under MERGE CANDIDATES (if any), author the unified \
         proposition text. Additionally, if one existing proposition is a strict \
         specialization of another, report it under \"subsumes\".{merge_block}\n\n\
         Reply with exactly this JSON shape:\n\
         {{\n\
           \"evidence\": [{{\"ref\": \"e1\", \"quote\": \"...\", \"interpretation\": \"...\", \
         \"factor\": \"...\", \"mechanism\": \"...\", \"outcome\": \"...\", \
         \"tags\": [\"...\"], \"language\": \"{language}\"}}],\n\
           \"mappings\": [{{\"evidence\": \"e1\", \"proposition\": \"P001\", \
         \"relation\": \"supports\"}}],\n\
           \"new_propositions\": [{{\"ref\": \"p1\", \"factor\": \"...\", \
         \"mechanism\": \"...\", \"outcome\": \"...\", \"supporting\": [\"e1\"], \
         \"contradicting\": []}}],\n\
           \"retro\": [{{\"evidence\": \"E001\", \"proposition\": \"p1\", \
         \"relation\": \"supports\"}}],\n\
           \"merges\": [{{\"sources\": [\"P001\", \"P002\"], \"factor\": \"...\", \
         \"mechanism\": \"...\", \"outcome\": \"...\"}}],\n\
           \"subsumes\": [{{\"specific\": \"P003\", \"general\": \"P001\"}}]\n\
         }}",
        question = state.project.research_question,
    )
}

// ── Reply validation ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawEvidence {
    #[serde(rename = "ref")]
    symbol: String,
    quote: String,
    interpretation: String,
    factor: String,
    mechanism: String,
    outcome: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMapping {
    evidence: String,
    proposition: String,
    relation: String,
}

#[derive(Debug, Deserialize)]
struct RawProposition {
    #[serde(rename = "ref")]
    symbol: String,
    factor: String,
    mechanism: String,
    outcome: String,
    #[serde(default)]
    supporting: Vec<String>,
    #[serde(default)]
    contradicting: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawMerge {
    sources: Vec<String>,
    factor: String,
    mechanism: String,
    outcome: String,
}

#[derive(Debug, Deserialize)]
struct RawSubsume {
    specific: String,
    general: String,
}

/// Validate the oracle's JSON into an [`AnalysisDiff`].  Individual records
/// that fail to decode or carry empty required fields are dropped with a
/// warning; a reply without an evidence array at all is unusable.
fn parse_analysis_reply(
    reply: &serde_json::Value,
    default_language: &str,
) -> Result<AnalysisDiff, AnalystError> {
    let evidence_items = reply["evidence"]
        .as_array()
        .ok_or_else(|| AnalystError::Shape("reply has no \"evidence\" array".to_string()))?;

    let mut diff = AnalysisDiff::default();

    for item in evidence_items {
        match serde_json::from_value::<RawEvidence>(item.clone()) {
            Ok(raw) => {
                if raw.quote.trim().is_empty()
                    || raw.factor.trim().is_empty()
                    || raw.mechanism.trim().is_empty()
                    || raw.outcome.trim().is_empty()
                {
                    warn!(symbol = %raw.symbol, "dropping evidence with empty required field");
                    continue;
                }
                let mut tags = raw.tags;
                tags.truncate(5);
                if tags.len() < 2 {
                    warn!(symbol = %raw.symbol, "evidence carries fewer than 2 tags");
                }
                diff.evidence.push(ExtractedEvidence {
                    symbol: raw.symbol,
                    quote: raw.quote,
                    interpretation: raw.interpretation,
                    factor: raw.factor,
                    mechanism: raw.mechanism,
                    outcome: raw.outcome,
                    tags,
                    language: raw.language.unwrap_or_else(|| default_language.to_string()),
                });
            }
            Err(err) => warn!(error = %err, "dropping undecodable evidence record"),
        }
    }

    if diff.evidence.is_empty() {
        return Err(AnalystError::Shape(
            "no usable evidence extracted".to_string(),
        ));
    }

    for item in reply["mappings"].as_array().unwrap_or(&Vec::new()) {
        match serde_json::from_value::<RawMapping>(item.clone()) {
            Ok(raw) => match parse_relation(&raw.relation) {
                Some(relation) => diff.mappings.push(EvidenceMapping {
                    evidence_symbol: raw.evidence,
                    proposition_id: raw.proposition,
                    relation,
                }),
                // "irrelevant" carries no information; anything else is noise.
                None => {
                    if raw.relation != "irrelevant" {
                        warn!(relation = %raw.relation, "dropping mapping with unknown relation");
                    }
                }
            },
            Err(err) => warn!(error = %err, "dropping undecodable mapping record"),
        }
    }

    for item in reply["new_propositions"].as_array().unwrap_or(&Vec::new()) {
        match serde_json::from_value::<RawProposition>(item.clone()) {
            Ok(raw) => {
                if raw.factor.trim().is_empty()
                    || raw.mechanism.trim().is_empty()
                    || raw.outcome.trim().is_empty()
                {
                    warn!(symbol = %raw.symbol, "dropping proposition with empty causal field");
                    continue;
                }
                diff.new_propositions.push(ProposedProposition {
                    symbol: raw.symbol,
                    factor: raw.factor,
                    mechanism: raw.mechanism,
                    outcome: raw.outcome,
                    supporting_refs: raw.supporting,
                    contradicting_refs: raw.contradicting,
                });
            }
            Err(err) => warn!(error = %err, "dropping undecodable proposition record"),
        }
    }

    for item in reply["retro"].as_array().unwrap_or(&Vec::new()) {
        match serde_json::from_value::<RawMapping>(item.clone()) {
            Ok(raw) => {
                if let Some(relation) = parse_relation(&raw.relation) {
                    diff.retro_mappings.push(RetroMapping {
                        evidence_id: raw.evidence,
                        proposition_symbol: raw.proposition,
                        relation,
                    });
                }
            }
            Err(err) => warn!(error = %err, "dropping undecodable retro record"),
        }
    }

    for item in reply["merges"].as_array().unwrap_or(&Vec::new()) {
        match serde_json::from_value::<RawMerge>(item.clone()) {
            Ok(raw) => {
                if raw.sources.len() < 2 {
                    warn!("dropping merge with fewer than 2 sources");
                    continue;
                }
                diff.merges.push(MergeProposal {
                    source_ids: raw.sources,
                    factor: raw.factor,
                    mechanism: raw.mechanism,
                    outcome: raw.outcome,
                });
            }
            Err(err) => warn!(error = %err, "dropping undecodable merge record"),
        }
    }

    for item in reply["subsumes"].as_array().unwrap_or(&Vec::new()) {
        match serde_json::from_value::<RawSubsume>(item.clone()) {
            Ok(raw) => diff.subsumes.push(SubsumeProposal {
                specific_id: raw.specific,
                general_id: raw.general,
            }),
            Err(err) => warn!(error = %err, "dropping undecodable subsume record"),
        }
    }

    Ok(diff)
}

fn parse_relation(raw: &str) -> Option<Relation> {
    match raw {
        "supports" => Some(Relation::Supports),
        "contradicts" => Some(Relation::Contradicts),
        _ => None,
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    let chars = text.chars().collect::<Vec<_>>();
    if chars.len() <= max_chars {
        return text.to_string();
    }
    let truncated: String = chars.into_iter().take(max_chars).collect();
    format!("{truncated}…")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use serde_json::json;

    use super::{
        AnalystError, Relation, jaccard, merge_candidates, parse_analysis_reply,
    };
    use eidetic_store::{Proposition, PropositionStatus};

    fn proposition(id: &str, supporting: &[&str]) -> Proposition {
        Proposition {
            id: id.to_string(),
            factor: "f".to_string(),
            mechanism: "m".to_string(),
            outcome: "o".to_string(),
            confidence: 0.5,
            status: PropositionStatus::Exploring,
            supporting_evidence: supporting.iter().map(ToString::to_string).collect(),
            contradicting_evidence: BTreeSet::new(),
            first_seen_interview: None,
            last_updated_interview: None,
            interviews_without_new_evidence: 0,
            merged_into: None,
        }
    }

    #[test]
    fn jaccard_of_empty_sets_is_zero() {
        assert_eq!(jaccard(&BTreeSet::new(), &BTreeSet::new()), 0.0);
    }

    #[test]
    fn merge_triggers_only_at_threshold() {
        // |{E4}| / |{E4,E7,E9}| = 1/3 — below threshold.
        let a = proposition("P001", &["E4", "E7"]);
        let b = proposition("P002", &["E4", "E9"]);
        assert!(merge_candidates(&[&a, &b], 0.6).is_empty());

        // Shared E11: 2/4 = 0.5 — still below.
        let a = proposition("P001", &["E4", "E7", "E11"]);
        let b = proposition("P002", &["E4", "E9", "E11"]);
        assert!(merge_candidates(&[&a, &b], 0.6).is_empty());

        // Shared E13: 3/5 = 0.6 — merge triggers.
        let a = proposition("P001", &["E4", "E7", "E11", "E13"]);
        let b = proposition("P002", &["E4", "E9", "E11", "E13"]);
        let candidates = merge_candidates(&[&a, &b], 0.6);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].0, "P001");
        assert_eq!(candidates[0].1, "P002");
        assert!((candidates[0].2 - 0.6).abs() < 1e-9);
    }

    #[test]
    fn parse_keeps_valid_records_and_drops_noise() {
        let reply = json!({
            "evidence": [
                {"ref": "e1", "quote": "The venue was freezing", "interpretation":
                 "Cold venue impaired thinking", "factor": "venue temperature",
                 "mechanism": "physical discomfort", "outcome": "reduced cognition",
                 "tags": ["environment", "cognition"], "language": "en"},
                {"ref": "e2", "quote": "", "interpretation": "x", "factor": "f",
                 "mechanism": "m", "outcome": "o", "tags": ["a", "b"]},
                {"ref": "e3", "quote": "q", "interpretation": "x", "factor": "",
                 "mechanism": "m", "outcome": "o", "tags": ["a", "b"]}
            ],
            "mappings": [
                {"evidence": "e1", "proposition": "P001", "relation": "supports"},
                {"evidence": "e1", "proposition": "P002", "relation": "irrelevant"},
                {"evidence": "e1", "proposition": "P003", "relation": "banana"}
            ],
            "new_propositions": [
                {"ref": "p1", "factor": "cold environment", "mechanism": "discomfort",
                 "outcome": "reduced focus", "supporting": ["e1"], "contradicting": []}
            ],
            "retro": [
                {"evidence": "E001", "proposition": "p1", "relation": "supports"}
            ],
            "merges": [
                {"sources": ["P001"], "factor": "f", "mechanism": "m", "outcome": "o"}
            ],
            "subsumes": []
        });

        let diff = parse_analysis_reply(&reply, "en").unwrap();
        assert_eq!(diff.evidence.len(), 1);
        assert_eq!(diff.evidence[0].symbol, "e1");
        assert_eq!(diff.mappings.len(), 1);
        assert_eq!(diff.mappings[0].relation, Relation::Supports);
        assert_eq!(diff.new_propositions.len(), 1);
        assert_eq!(diff.retro_mappings.len(), 1);
        // Single-source merge is dropped.
        assert!(diff.merges.is_empty());
    }

    #[test]
    fn reply_without_evidence_array_is_unusable() {
        let reply = json!({"mappings": []});
        let err = parse_analysis_reply(&reply, "en").unwrap_err();
        assert!(matches!(err, AnalystError::Shape(_)));
    }

    #[test]
    fn missing_language_falls_back_to_interview_language() {
        let reply = json!({
            "evidence": [
                {"ref": "e1", "quote": "Зал был холодный", "interpretation":
                 "The venue was cold", "factor": "venue", "mechanism": "discomfort",
                 "outcome": "distraction", "tags": ["environment", "comfort"]}
            ]
        });
        let diff = parse_analysis_reply(&reply, "ru").unwrap();
        assert_eq!(diff.evidence[0].language, "ru");
    }
}
