//! Final report authorship.
//!
//! The report skeleton — what counts as established, contested, open, or
//! set aside, and in what order — is computed from the snapshot.  The
//! oracle contributes an executive summary on top; if it fails the report
//! degrades to the skeleton instead of failing the command.

use tracing::warn;

use eidetic_config::AgentModelConfig;
use eidetic_llm::{ChatMessage, Oracle};
use eidetic_store::{ProjectState, Proposition, PropositionStatus};

pub struct Synthesizer {
    oracle: Oracle,
    model: AgentModelConfig,
}

const SYNTHESIZER_ROLE: &str = "You are a qualitative research writer. You turn a causal \
     knowledge base into a clear narrative for stakeholders. You reply with a single strict \
     JSON object and nothing else.";

impl Synthesizer {
    pub fn new(oracle: Oracle, model: AgentModelConfig) -> Self {
        Self { oracle, model }
    }

    pub async fn write_report(&self, state: &ProjectState) -> String {
        let skeleton = report_skeleton(state);

        let prompt = format!(
            "Write an executive summary (3-6 paragraphs, markdown, no heading) of the research \
             findings below. Lead with the strongest established causal claims, then the \
             contested ones, then what remains open.\n\n{skeleton}\n\n\
             Reply with exactly this JSON shape:\n{{\"summary\": \"...\"}}"
        );

        match self
            .oracle
            .chat_json(
                &self.model.model,
                &[
                    ChatMessage::system(SYNTHESIZER_ROLE),
                    ChatMessage::user(prompt),
                ],
                self.model.temperature,
                self.model.max_tokens,
            )
            .await
        {
            Ok(reply) => match reply["summary"].as_str() {
                Some(summary) if !summary.trim().is_empty() => {
                    format!("{summary}\n\n---\n\n{skeleton}")
                }
                _ => {
                    warn!("synthesizer reply had no summary — returning skeleton report");
                    skeleton
                }
            },
            Err(err) => {
                warn!(error = %err, "synthesizer unavailable — returning skeleton report");
                skeleton
            }
        }
    }
}

/// Deterministic markdown report: established findings first, contested and
/// open threads next, weak and merged propositions in the appendix.
pub fn report_skeleton(state: &ProjectState) -> String {
    let mut established: Vec<&Proposition> = state
        .propositions
        .iter()
        .filter(|p| {
            matches!(
                p.status,
                PropositionStatus::Confirmed | PropositionStatus::Saturated
            )
        })
        .collect();
    established.sort_by(|a, b| b.confidence.total_cmp(&a.confidence).then(a.id.cmp(&b.id)));

    let contested: Vec<&Proposition> = state
        .propositions
        .iter()
        .filter(|p| p.status == PropositionStatus::Challenged)
        .collect();

    let open: Vec<&Proposition> = state
        .propositions
        .iter()
        .filter(|p| {
            matches!(
                p.status,
                PropositionStatus::Untested | PropositionStatus::Exploring
            )
        })
        .collect();

    let set_aside: Vec<&Proposition> = state
        .propositions
        .iter()
        .filter(|p| {
            matches!(p.status, PropositionStatus::Weak | PropositionStatus::Merged)
        })
        .collect();

    let metrics_line = state
        .current_script()
        .map(|s| {
            format!(
                "Convergence {:.2}, novelty {:.2}, mode {:?} as of script v{}.",
                s.convergence_score, s.novelty_rate, s.mode, s.version
            )
        })
        .unwrap_or_else(|| "No script published yet.".to_string());

    let mut out = String::new();
    out.push_str(&format!(
        "# {}\n\n{} interviews, {} evidence items, {} propositions. {}\n",
        state.project.research_question,
        state.interviews.len(),
        state.evidence.len(),
        state.propositions.len(),
        metrics_line,
    ));

    out.push_str("\n## Established findings\n\n");
    if established.is_empty() {
        out.push_str("None yet.\n");
    }
    for p in &established {
        out.push_str(&render_finding(state, p));
    }

    out.push_str("\n## Contested claims\n\n");
    if contested.is_empty() {
        out.push_str("None.\n");
    }
    for p in &contested {
        out.push_str(&render_finding(state, p));
    }

    out.push_str("\n## Open threads\n\n");
    if open.is_empty() {
        out.push_str("None.\n");
    }
    for p in &open {
        out.push_str(&format!("- [{}] {}\n", p.id, p.statement()));
    }

    out.push_str("\n## Appendix: set aside\n\n");
    if set_aside.is_empty() {
        out.push_str("Nothing was pruned or merged.\n");
    }
    for p in &set_aside {
        match p.status {
            PropositionStatus::Merged => out.push_str(&format!(
                "- [{}] {} — merged into {}\n",
                p.id,
                p.statement(),
                p.merged_into.as_deref().unwrap_or("?"),
            )),
            _ => out.push_str(&format!(
                "- [{}] {} — pruned at confidence {:.2}\n",
                p.id,
                p.statement(),
                p.confidence,
            )),
        }
    }

    out
}

fn render_finding(state: &ProjectState, p: &Proposition) -> String {
    let sample_quote = p
        .supporting_evidence
        .iter()
        .filter_map(|id| state.evidence_by_id(id))
        .next()
        .map(|e| format!("  > \"{}\"\n", e.quote))
        .unwrap_or_default();
    format!(
        "- [{}] {} (confidence {:.2}, {} supporting / {} contradicting)\n{}",
        p.id,
        p.statement(),
        p.confidence,
        p.supporting_evidence.len(),
        p.contradicting_evidence.len(),
        sample_quote,
    )
}
