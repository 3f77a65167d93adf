//! Interview-guide authorship.
//!
//! Section planning is deterministic: which propositions appear, with which
//! instruction and priority, and what gets dropped at the section cap is
//! decided in code from the snapshot alone.  The oracle only authors
//! question wording for the planned sections, so a model failure can never
//! change what the next interview covers — only leave it with fallback
//! phrasing or (when the whole call fails) the previous script.

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use eidetic_config::AgentModelConfig;
use eidetic_llm::{ChatMessage, LlmError, Oracle};
use eidetic_store::{
    IdCounters, Instruction, InterviewScript, Priority, ProjectState, Proposition, ScriptMode,
    ScriptSection,
};

#[derive(Debug, Error)]
pub enum DesignerError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("designer reply unusable: {0}")]
    Shape(String),
}

/// Store-derived metrics computed by the reconciler during commit and
/// recorded verbatim on the script; the Designer never recomputes them.
#[derive(Debug, Clone, Copy)]
pub struct ScriptMetrics {
    pub convergence_score: f64,
    pub novelty_rate: f64,
    pub mode: ScriptMode,
}

impl ScriptMetrics {
    pub fn cold_start() -> Self {
        Self {
            convergence_score: 0.0,
            novelty_rate: 0.0,
            mode: ScriptMode::Divergent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSection {
    pub proposition_id: String,
    pub instruction: Instruction,
    pub priority: Priority,
}

// ── Deterministic planning ────────────────────────────────────────────────────

/// Instruction for one live proposition.
///
/// Challenging is reserved for claims corroborated across interviews: a
/// strong-looking proposition resting on a single voice is verified first.
fn assign_instruction(p: &Proposition, state: &ProjectState) -> Instruction {
    use eidetic_store::PropositionStatus::*;

    match p.status {
        Saturated => Instruction::Saturated,
        Untested => Instruction::Explore,
        _ => {
            if p.supporting_evidence.is_empty() && p.contradicting_evidence.is_empty() {
                Instruction::Explore
            } else if p.confidence > 0.7
                && (!p.contradicting_evidence.is_empty()
                    || (spans_multiple_interviews(p, state)
                        && p.interviews_without_new_evidence == 0))
            {
                Instruction::Challenge
            } else if p.confidence >= 0.4 {
                Instruction::Verify
            } else {
                Instruction::Explore
            }
        }
    }
}

fn spans_multiple_interviews(p: &Proposition, state: &ProjectState) -> bool {
    let mut seen: Option<&str> = None;
    for id in &p.supporting_evidence {
        if let Some(evidence) = state.evidence_by_id(id) {
            match seen {
                None => seen = Some(&evidence.interview_id),
                Some(first) if first != evidence.interview_id => return true,
                Some(_) => {}
            }
        }
    }
    false
}

fn priority_for(instruction: Instruction) -> Priority {
    match instruction {
        Instruction::Challenge | Instruction::Explore => Priority::High,
        Instruction::Verify => Priority::Medium,
        Instruction::Saturated => Priority::Low,
    }
}

/// Rank used when the section cap forces drops: higher drops first.
/// Saturated guards go before Verify; Challenge and Explore go last.
fn drop_rank(instruction: Instruction) -> u8 {
    match instruction {
        Instruction::Saturated => 3,
        Instruction::Verify => 2,
        Instruction::Explore => 1,
        Instruction::Challenge => 0,
    }
}

/// Plan the next script's sections from a snapshot: one section per live
/// proposition, capped at `max_sections`.
///
/// Drop order at the cap: Saturated guards first, then lowest priority
/// within the Verify class, with staleness (most interviews without new
/// evidence) and then ascending id breaking ties.  Challenge and Explore
/// sections are never dropped before Verify or Saturated ones.
pub fn plan_sections(state: &ProjectState, max_sections: usize) -> Vec<PlannedSection> {
    let mut planned: Vec<(PlannedSection, &Proposition)> = state
        .live_propositions()
        .into_iter()
        .map(|p| {
            let instruction = assign_instruction(p, state);
            (
                PlannedSection {
                    proposition_id: p.id.clone(),
                    instruction,
                    priority: priority_for(instruction),
                },
                p,
            )
        })
        .collect();

    while planned.len() > max_sections {
        let victim = planned
            .iter()
            .enumerate()
            .max_by(|(_, (a, pa)), (_, (b, pb))| {
                drop_rank(a.instruction)
                    .cmp(&drop_rank(b.instruction))
                    .then(a.priority.cmp(&b.priority))
                    .then(
                        pa.interviews_without_new_evidence
                            .cmp(&pb.interviews_without_new_evidence),
                    )
                    .then(pa.id.cmp(&pb.id).reverse())
            })
            .map(|(idx, _)| idx)
            .expect("planned is non-empty while over cap");
        let (dropped, _) = planned.remove(victim);
        warn!(
            proposition = %dropped.proposition_id,
            instruction = ?dropped.instruction,
            "section cap exceeded — dropping section"
        );
    }

    // Interview order: challenge strong claims while attention is fresh,
    // then verification, then open exploration; saturated guards trail.
    planned.sort_by(|(a, pa), (b, pb)| {
        section_order(a.instruction)
            .cmp(&section_order(b.instruction))
            .then(pb.confidence.total_cmp(&pa.confidence))
            .then(pa.id.cmp(&pb.id))
    });

    planned.into_iter().map(|(section, _)| section).collect()
}

fn section_order(instruction: Instruction) -> u8 {
    match instruction {
        Instruction::Challenge => 0,
        Instruction::Verify => 1,
        Instruction::Explore => 2,
        Instruction::Saturated => 3,
    }
}

// ── The agent ─────────────────────────────────────────────────────────────────

pub struct Designer {
    oracle: Oracle,
    model: AgentModelConfig,
}

const DESIGNER_ROLE: &str = "You are a qualitative research interview designer. You author \
     interview guides that probe causal claims. You reply with a single strict JSON object \
     and nothing else.";

impl Designer {
    pub fn new(oracle: Oracle, model: AgentModelConfig) -> Self {
        Self { oracle, model }
    }

    /// Cold start: 5–8 seed propositions covering diverse angles plus script
    /// v1 with one EXPLORE section per proposition.  Assigns real ids from
    /// `counters`; the caller commits both with the advanced counters.
    pub async fn generate_initial(
        &self,
        research_question: &str,
        seed_angles: &[String],
        counters: &mut IdCounters,
        max_sections: usize,
    ) -> Result<(Vec<Proposition>, InterviewScript), DesignerError> {
        let angles_block = if seed_angles.is_empty() {
            "  (none given — choose diverse angles yourself)".to_string()
        } else {
            seed_angles
                .iter()
                .map(|a| format!("  - {a}"))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let prompt = format!(
            "RESEARCH QUESTION:\n{research_question}\n\n\
             SEED ANGLES:\n{angles_block}\n\n\
             Author 5-8 initial causal propositions (factor → mechanism → outcome) covering \
             diverse angles on the research question, and an opening interview script that \
             explores each of them.\n\n\
             Reply with exactly this JSON shape:\n\
             {{\n\
               \"propositions\": [{{\"factor\": \"...\", \"mechanism\": \"...\", \
             \"outcome\": \"...\"}}],\n\
               \"opening_question\": \"...\",\n\
               \"sections\": [{{\"proposition\": 1, \"priority\": \"high|medium|low\", \
             \"main_question\": \"...\", \"probes\": [\"...\", \"...\"], \
             \"context\": \"...\"}}],\n\
               \"closing_question\": \"...\",\n\
               \"wildcard\": \"...\"\n\
             }}\n\
             \"proposition\" in each section is the 1-based index into \"propositions\"."
        );

        let reply = self
            .oracle
            .chat_json(
                &self.model.model,
                &[ChatMessage::system(DESIGNER_ROLE), ChatMessage::user(prompt)],
                self.model.temperature,
                self.model.max_tokens,
            )
            .await?;

        let raw: RawInitialReply = serde_json::from_value(reply.clone())
            .map_err(|err| DesignerError::Shape(err.to_string()))?;

        if raw.propositions.len() < 3 {
            return Err(DesignerError::Shape(format!(
                "only {} seed propositions returned",
                raw.propositions.len()
            )));
        }
        if raw.propositions.len() < 5 {
            warn!(
                count = raw.propositions.len(),
                "designer returned fewer seed propositions than asked"
            );
        }

        let mut propositions = Vec::new();
        for seed in raw.propositions.iter().take(8) {
            propositions.push(Proposition {
                id: counters.next_proposition(),
                factor: seed.factor.clone(),
                mechanism: seed.mechanism.clone(),
                outcome: seed.outcome.clone(),
                confidence: 0.0,
                status: eidetic_store::PropositionStatus::Untested,
                supporting_evidence: Default::default(),
                contradicting_evidence: Default::default(),
                first_seen_interview: None,
                last_updated_interview: None,
                interviews_without_new_evidence: 0,
                merged_into: None,
            });
        }

        let mut sections = Vec::new();
        for (idx, proposition) in propositions.iter().enumerate().take(max_sections) {
            let authored = raw
                .sections
                .iter()
                .find(|s| s.proposition == idx + 1);
            sections.push(ScriptSection {
                proposition_id: proposition.id.clone(),
                priority: authored
                    .and_then(|s| parse_priority(&s.priority))
                    .unwrap_or(Priority::Medium),
                instruction: Instruction::Explore,
                main_question: authored
                    .map(|s| s.main_question.clone())
                    .filter(|q| !q.trim().is_empty())
                    .unwrap_or_else(|| fallback_question(proposition)),
                probes: clamp_probes(authored.map(|s| s.probes.clone()).unwrap_or_default()),
                context: authored.map(|s| s.context.clone()).unwrap_or_default(),
            });
        }

        let script = InterviewScript {
            version: counters.next_script_version(),
            generated_after_interview: None,
            research_question: research_question.to_string(),
            opening_question: raw.opening_question,
            sections,
            closing_question: raw.closing_question,
            wildcard: raw.wildcard,
            mode: ScriptMode::Divergent,
            convergence_score: 0.0,
            novelty_rate: 0.0,
            changes_summary: None,
        };

        info!(
            propositions = propositions.len(),
            sections = script.sections.len(),
            "initial propositions and script v1 generated"
        );
        Ok((propositions, script))
    }

    /// Author the next script version from the post-commit snapshot.
    /// Planning is done here in code; the oracle writes question text for
    /// the planned sections only.
    pub async fn update_script(
        &self,
        state: &ProjectState,
        metrics: ScriptMetrics,
        counters: &mut IdCounters,
        generated_after: &str,
        max_sections: usize,
    ) -> Result<InterviewScript, DesignerError> {
        let plan = plan_sections(state, max_sections);
        let previous = state.current_script();

        let plan_block = plan
            .iter()
            .map(|section| {
                let p = state
                    .proposition(&section.proposition_id)
                    .expect("planned sections reference live propositions");
                format!(
                    "  [{}] {:?}: {} (confidence {:.2}, support {}, contradict {})",
                    p.id,
                    section.instruction,
                    p.statement(),
                    p.confidence,
                    p.supporting_evidence.len(),
                    p.contradicting_evidence.len(),
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let recent_evidence_block = {
            let start = state.evidence.len().saturating_sub(10);
            let lines = state.evidence[start..]
                .iter()
                .map(|e| format!("  [{}] {}", e.id, e.interpretation))
                .collect::<Vec<_>>()
                .join("\n");
            if lines.is_empty() {
                "  (none yet)".to_string()
            } else {
                lines
            }
        };

        let previous_block = previous
            .map(|script| {
                script
                    .sections
                    .iter()
                    .map(|s| format!("  [{}] {}", s.proposition_id, s.main_question))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_else(|| "  (no previous script)".to_string());

        let mode_note = match metrics.mode {
            ScriptMode::Divergent => "The project is divergent: favor open exploration.",
            ScriptMode::Convergent => {
                "The project has converged: questions should pressure-test established claims \
                 rather than open new ground."
            }
        };

        let prompt = format!(
            "RESEARCH QUESTION:\n{question}\n\n\
             PLANNED SECTIONS (fixed — author questions for exactly these, in this order):\n\
             {plan_block}\n\n\
             RECENT EVIDENCE:\n{recent_evidence_block}\n\n\
             PREVIOUS SCRIPT QUESTIONS:\n{previous_block}\n\n\
             {mode_note}\n\
             Instruction meanings: EXPLORE = open-ended discovery; VERIFY = test whether the \
             claim holds for this respondent; CHALLENGE = actively hunt for counter-examples \
             and boundary conditions; SATURATED = do not probe unless the respondent raises it.\n\
             Vary wording from the previous script. Reply with exactly this JSON shape:\n\
             {{\n\
               \"opening_question\": \"...\",\n\
               \"sections\": [{{\"proposition\": \"P001\", \"main_question\": \"...\", \
             \"probes\": [\"...\", \"...\"], \"context\": \"...\"}}],\n\
               \"closing_question\": \"...\",\n\
               \"wildcard\": \"...\",\n\
               \"changes_summary\": \"...\"\n\
             }}",
            question = state.project.research_question,
        );

        let reply = self
            .oracle
            .chat_json(
                &self.model.model,
                &[ChatMessage::system(DESIGNER_ROLE), ChatMessage::user(prompt)],
                self.model.temperature,
                self.model.max_tokens,
            )
            .await?;

        let raw: RawUpdateReply = serde_json::from_value(reply)
            .map_err(|err| DesignerError::Shape(err.to_string()))?;

        let sections = plan
            .iter()
            .map(|planned| {
                let p = state
                    .proposition(&planned.proposition_id)
                    .expect("planned sections reference live propositions");
                let authored = raw
                    .sections
                    .iter()
                    .find(|s| s.proposition == planned.proposition_id);
                if authored.is_none() {
                    warn!(
                        proposition = %planned.proposition_id,
                        "designer reply missed a planned section — using fallback wording"
                    );
                }
                ScriptSection {
                    proposition_id: planned.proposition_id.clone(),
                    priority: planned.priority,
                    instruction: planned.instruction,
                    main_question: authored
                        .map(|s| s.main_question.clone())
                        .filter(|q| !q.trim().is_empty())
                        .unwrap_or_else(|| fallback_question(p)),
                    probes: clamp_probes(authored.map(|s| s.probes.clone()).unwrap_or_default()),
                    context: authored.map(|s| s.context.clone()).unwrap_or_default(),
                }
            })
            .collect();

        let script = InterviewScript {
            version: counters.next_script_version(),
            generated_after_interview: Some(generated_after.to_string()),
            research_question: state.project.research_question.clone(),
            opening_question: raw.opening_question,
            sections,
            closing_question: raw.closing_question,
            wildcard: raw.wildcard,
            mode: metrics.mode,
            convergence_score: metrics.convergence_score,
            novelty_rate: metrics.novelty_rate,
            changes_summary: raw.changes_summary,
        };

        info!(
            version = script.version,
            sections = script.sections.len(),
            mode = ?script.mode,
            "script updated"
        );
        Ok(script)
    }
}

fn fallback_question(p: &Proposition) -> String {
    format!("How has {} affected your experience?", p.factor)
}

/// Keep 2–3 probes: truncate excess, and let short lists through as-is —
/// the interviewer copes with one probe better than with padding.
fn clamp_probes(mut probes: Vec<String>) -> Vec<String> {
    probes.retain(|p| !p.trim().is_empty());
    probes.truncate(3);
    probes
}

fn parse_priority(raw: &str) -> Option<Priority> {
    match raw {
        "high" => Some(Priority::High),
        "medium" => Some(Priority::Medium),
        "low" => Some(Priority::Low),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct RawSeedProposition {
    factor: String,
    mechanism: String,
    outcome: String,
}

#[derive(Debug, Deserialize)]
struct RawInitialSection {
    proposition: usize,
    #[serde(default)]
    priority: String,
    main_question: String,
    #[serde(default)]
    probes: Vec<String>,
    #[serde(default)]
    context: String,
}

#[derive(Debug, Deserialize)]
struct RawInitialReply {
    propositions: Vec<RawSeedProposition>,
    opening_question: String,
    #[serde(default)]
    sections: Vec<RawInitialSection>,
    closing_question: String,
    wildcard: String,
}

#[derive(Debug, Deserialize)]
struct RawUpdateSection {
    proposition: String,
    main_question: String,
    #[serde(default)]
    probes: Vec<String>,
    #[serde(default)]
    context: String,
}

#[derive(Debug, Deserialize)]
struct RawUpdateReply {
    opening_question: String,
    #[serde(default)]
    sections: Vec<RawUpdateSection>,
    closing_question: String,
    wildcard: String,
    #[serde(default)]
    changes_summary: Option<String>,
}

// ── Interviewer prompt template ───────────────────────────────────────────────

/// Render a script into the plain-text system prompt the external voice
/// runtime consumes verbatim.  The template is part of the script contract.
pub fn build_interviewer_prompt(script: &InterviewScript, max_duration_minutes: u32) -> String {
    let sections_block = script
        .sections
        .iter()
        .enumerate()
        .map(|(idx, section)| {
            let guidance = match section.instruction {
                Instruction::Explore => {
                    "Explore openly; follow whatever the respondent brings up."
                }
                Instruction::Verify => {
                    "Verify: ask whether this holds for the respondent, and how."
                }
                Instruction::Challenge => {
                    "Challenge: look for counter-examples and conditions where it breaks."
                }
                Instruction::Saturated => {
                    "Do NOT probe this topic; only listen if the respondent raises it."
                }
            };
            let probes = if section.probes.is_empty() {
                String::new()
            } else {
                format!(
                    "\n   Probes: {}",
                    section.probes.join(" / ")
                )
            };
            let context = if section.context.is_empty() {
                String::new()
            } else {
                format!("\n   Context: {}", section.context)
            };
            format!(
                "{}. [{:?}] {}\n   {}{}{}",
                idx + 1,
                section.instruction,
                section.main_question,
                guidance,
                probes,
                context,
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "You are a voice interviewer conducting qualitative research.\n\
         RESEARCH QUESTION: {question}\n\
         Keep the conversation natural and under {max_duration_minutes} minutes. Ask one \
         question at a time, listen, and follow up before moving on.\n\n\
         OPEN WITH: {opening}\n\n\
         TOPICS (in order):\n{sections_block}\n\n\
         BEFORE CLOSING, ASK: {wildcard}\n\
         CLOSE WITH: {closing}",
        question = script.research_question,
        opening = script.opening_question,
        wildcard = script.wildcard,
        closing = script.closing_question,
    )
}
