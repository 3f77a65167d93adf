//! Diff validation and commit preparation.
//!
//! Takes the Analyst's symbolic [`AnalysisDiff`] plus a store snapshot and
//! produces a validated [`StoreDiff`]: real ids assigned, symbolic refs
//! resolved, invariants enforced, confidence recomputed, status transitions
//! and staleness counters applied, merges collapsed transitively, and the
//! convergence metrics computed.  Offending records are dropped and noted;
//! extracted evidence always survives — raw observations are worth keeping
//! even when the interpretation around them is broken.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{info, warn};

use eidetic_agents::{AnalysisDiff, Relation, ScriptMetrics, jaccard};
use eidetic_config::EngineConfig;
use eidetic_store::{
    Evidence, IdCounters, Interview, InterviewScript, ProjectState, Proposition,
    PropositionStatus, ScriptMode, StoreDiff,
};

use crate::events::ProjectEvent;

#[derive(Debug)]
pub struct ReconcileOutcome {
    pub diff: StoreDiff,
    /// Events in application order, ready for the bus.
    pub events: Vec<ProjectEvent>,
    pub metrics: ScriptMetrics,
    /// Human-readable notes for every dropped record.
    pub rejections: Vec<String>,
}

pub fn reconcile(
    state: &ProjectState,
    analysis: &AnalysisDiff,
    interview: Interview,
    counters: &mut IdCounters,
    config: &EngineConfig,
) -> ReconcileOutcome {
    let interview_id = interview.id.clone();
    let mut rejections: Vec<String> = Vec::new();

    // ── Evidence: verify quotes, assign real ids ─────────────────────────
    // Only the respondent's side of the conversation is quotable: an
    // interviewer question echoed back as "evidence" must not pass.
    let respondent_normalized = normalize(&respondent_turns(&interview.transcript));
    let mut symbol_to_evidence: HashMap<String, String> = HashMap::new();
    let mut new_evidence: Vec<Evidence> = Vec::new();
    for item in &analysis.evidence {
        if !respondent_normalized.contains(&normalize(&item.quote)) {
            rejections.push(format!(
                "evidence {}: quote not found in any respondent turn",
                item.symbol
            ));
            continue;
        }
        if symbol_to_evidence.contains_key(&item.symbol) {
            rejections.push(format!("evidence {}: duplicate symbol", item.symbol));
            continue;
        }
        let id = counters.next_evidence();
        symbol_to_evidence.insert(item.symbol.clone(), id.clone());
        new_evidence.push(Evidence {
            id,
            interview_id: interview_id.clone(),
            quote: item.quote.clone(),
            interpretation: item.interpretation.clone(),
            factor: item.factor.clone(),
            mechanism: item.mechanism.clone(),
            outcome: item.outcome.clone(),
            tags: item.tags.clone(),
            language: item.language.clone(),
            timestamp: interview.received_at,
        });
    }

    // Evidence id → owning interview, for the single-interview penalty and
    // the cross-interview confirmation check.
    let mut evidence_interview: HashMap<String, String> = state
        .evidence
        .iter()
        .map(|e| (e.id.clone(), e.interview_id.clone()))
        .collect();
    let prior_evidence_ids: BTreeSet<String> = evidence_interview.keys().cloned().collect();
    for item in &new_evidence {
        evidence_interview.insert(item.id.clone(), interview_id.clone());
    }

    let resolve_ref = |r: &str| -> Option<String> {
        if let Some(id) = symbol_to_evidence.get(r) {
            Some(id.clone())
        } else if evidence_interview.contains_key(r) {
            Some(r.to_string())
        } else {
            None
        }
    };

    // Working copies of every proposition; mutated in place below.
    let mut props: BTreeMap<String, Proposition> = state
        .propositions
        .iter()
        .cloned()
        .map(|p| (p.id.clone(), p))
        .collect();
    let original: HashMap<String, Proposition> = props
        .values()
        .cloned()
        .map(|p| (p.id.clone(), p))
        .collect();
    let pre_existing: Vec<String> = props.keys().cloned().collect();
    // Propositions whose evidence sets grew this interview.
    let mut touched: BTreeSet<String> = BTreeSet::new();

    // ── Forward mappings against live propositions ───────────────────────
    for mapping in &analysis.mappings {
        let Some(evidence_id) = resolve_ref(&mapping.evidence_symbol) else {
            rejections.push(format!(
                "mapping references unknown evidence {}",
                mapping.evidence_symbol
            ));
            continue;
        };
        let Some(prop) = props.get_mut(&mapping.proposition_id) else {
            rejections.push(format!(
                "mapping references unknown proposition {}",
                mapping.proposition_id
            ));
            continue;
        };
        if !prop.is_live() {
            rejections.push(format!(
                "mapping targets {} which is {:?}",
                prop.id, prop.status
            ));
            continue;
        }
        add_relation(prop, evidence_id, mapping.relation, &mut touched, &mut rejections);
    }

    // ── Newly born propositions ──────────────────────────────────────────
    let mut symbol_to_prop: HashMap<String, String> = HashMap::new();
    let mut born: Vec<String> = Vec::new();
    let mut novel_evidence: BTreeSet<String> = BTreeSet::new();
    for proposal in &analysis.new_propositions {
        let mut supporting = BTreeSet::new();
        for r in &proposal.supporting_refs {
            match resolve_ref(r) {
                Some(id) => {
                    supporting.insert(id);
                }
                None => rejections.push(format!(
                    "new proposition {}: unknown supporting ref {r}",
                    proposal.symbol
                )),
            }
        }
        let mut contradicting = BTreeSet::new();
        for r in &proposal.contradicting_refs {
            match resolve_ref(r) {
                Some(id) if supporting.contains(&id) => rejections.push(format!(
                    "new proposition {}: {id} appears in both evidence sets",
                    proposal.symbol
                )),
                Some(id) => {
                    contradicting.insert(id);
                }
                None => rejections.push(format!(
                    "new proposition {}: unknown contradicting ref {r}",
                    proposal.symbol
                )),
            }
        }
        if supporting.is_empty() && contradicting.is_empty() {
            rejections.push(format!(
                "new proposition {}: no resolvable evidence",
                proposal.symbol
            ));
            continue;
        }

        for id in supporting.iter().chain(contradicting.iter()) {
            if !prior_evidence_ids.contains(id) {
                novel_evidence.insert(id.clone());
            }
        }

        let id = counters.next_proposition();
        symbol_to_prop.insert(proposal.symbol.clone(), id.clone());
        props.insert(
            id.clone(),
            Proposition {
                id: id.clone(),
                factor: proposal.factor.clone(),
                mechanism: proposal.mechanism.clone(),
                outcome: proposal.outcome.clone(),
                confidence: 0.0,
                status: PropositionStatus::Untested,
                supporting_evidence: supporting,
                contradicting_evidence: contradicting,
                first_seen_interview: Some(interview_id.clone()),
                last_updated_interview: Some(interview_id.clone()),
                interviews_without_new_evidence: 0,
                merged_into: None,
            },
        );
        touched.insert(id.clone());
        born.push(id);
    }

    // ── Retroactive scan: prior evidence against newly born props only ───
    for retro in &analysis.retro_mappings {
        let Some(prop_id) = symbol_to_prop.get(&retro.proposition_symbol) else {
            rejections.push(format!(
                "retro mapping references unknown new proposition {}",
                retro.proposition_symbol
            ));
            continue;
        };
        if !prior_evidence_ids.contains(&retro.evidence_id) {
            rejections.push(format!(
                "retro mapping references non-prior evidence {}",
                retro.evidence_id
            ));
            continue;
        }
        let prop = props.get_mut(prop_id).expect("born props are present");
        add_relation(
            prop,
            retro.evidence_id.clone(),
            retro.relation,
            &mut touched,
            &mut rejections,
        );
    }

    // ── Subsume: a specialization becomes evidence for its generalization ─
    for subsume in &analysis.subsumes {
        if subsume.specific_id == subsume.general_id {
            rejections.push(format!("subsume of {} into itself", subsume.specific_id));
            continue;
        }
        let ok = [&subsume.specific_id, &subsume.general_id]
            .iter()
            .all(|id| props.get(*id).is_some_and(|p| p.is_live()));
        if !ok {
            rejections.push(format!(
                "subsume {} → {}: both propositions must exist and be live",
                subsume.specific_id, subsume.general_id
            ));
            continue;
        }

        let specific_support = props[&subsume.specific_id].supporting_evidence.clone();
        let general = props.get_mut(&subsume.general_id).expect("checked above");
        for id in specific_support {
            if general.contradicting_evidence.contains(&id) {
                rejections.push(format!(
                    "subsume into {}: {id} already contradicts it",
                    general.id
                ));
                continue;
            }
            if general.supporting_evidence.insert(id) {
                touched.insert(general.id.clone());
            }
        }
        let specific = props
            .get_mut(&subsume.specific_id)
            .expect("checked above");
        specific.status = PropositionStatus::Merged;
        specific.merged_into = Some(subsume.general_id.clone());
        touched.remove(&subsume.specific_id);
    }

    // ── Merges: re-verify overlap on current sets, then unify ────────────
    for merge in &analysis.merges {
        let distinct: BTreeSet<&String> = merge.source_ids.iter().collect();
        if distinct.len() < 2 {
            rejections.push("merge needs at least two distinct sources".to_string());
            continue;
        }
        let all_live = merge
            .source_ids
            .iter()
            .all(|id| props.get(id).is_some_and(|p| p.is_live()));
        if !all_live {
            rejections.push(format!(
                "merge of {:?}: all sources must exist and be live",
                merge.source_ids
            ));
            continue;
        }

        let below_threshold = merge.source_ids.iter().enumerate().any(|(i, a)| {
            merge.source_ids[i + 1..].iter().any(|b| {
                jaccard(
                    &props[a].supporting_evidence,
                    &props[b].supporting_evidence,
                ) < config.merge_overlap_threshold
            })
        });
        if below_threshold {
            rejections.push(format!(
                "merge of {:?}: supporting-evidence overlap below threshold",
                merge.source_ids
            ));
            continue;
        }

        let mut supporting = BTreeSet::new();
        let mut contradicting = BTreeSet::new();
        for source in &merge.source_ids {
            supporting.extend(props[source].supporting_evidence.iter().cloned());
            contradicting.extend(props[source].contradicting_evidence.iter().cloned());
        }
        // Support wins where the sources disagreed about an item.
        let overlap: Vec<String> = contradicting
            .intersection(&supporting)
            .cloned()
            .collect();
        for id in overlap {
            contradicting.remove(&id);
            rejections.push(format!(
                "merge of {:?}: {id} was both supporting and contradicting — kept as supporting",
                merge.source_ids
            ));
        }

        let id = counters.next_proposition();
        props.insert(
            id.clone(),
            Proposition {
                id: id.clone(),
                factor: merge.factor.clone(),
                mechanism: merge.mechanism.clone(),
                outcome: merge.outcome.clone(),
                confidence: 0.0,
                status: PropositionStatus::Untested,
                supporting_evidence: supporting,
                contradicting_evidence: contradicting,
                first_seen_interview: Some(interview_id.clone()),
                last_updated_interview: Some(interview_id.clone()),
                interviews_without_new_evidence: 0,
                merged_into: None,
            },
        );
        touched.insert(id.clone());
        born.push(id.clone());

        for source in &merge.source_ids {
            let p = props.get_mut(source).expect("checked above");
            p.status = PropositionStatus::Merged;
            p.merged_into = Some(id.clone());
            touched.remove(source);
        }
    }

    // ── Collapse merge chains: A→B and B→C become A→C in one pass ────────
    let merge_targets: HashMap<String, String> = props
        .values()
        .filter(|p| p.status == PropositionStatus::Merged)
        .filter_map(|p| p.merged_into.clone().map(|t| (p.id.clone(), t)))
        .collect();
    for p in props.values_mut() {
        if p.status != PropositionStatus::Merged {
            continue;
        }
        if let Some(target) = &p.merged_into {
            let mut terminal = target.clone();
            let mut hops = 0;
            while let Some(next) = merge_targets.get(&terminal) {
                terminal = next.clone();
                hops += 1;
                if hops > merge_targets.len() {
                    warn!(proposition = %p.id, "merge chain did not terminate — keeping direct link");
                    terminal = target.clone();
                    break;
                }
            }
            p.merged_into = Some(terminal);
        }
    }

    // ── Staleness counters on pre-existing live propositions ─────────────
    for id in &pre_existing {
        let p = props.get_mut(id).expect("pre-existing props are present");
        if !p.is_live() {
            continue;
        }
        if touched.contains(id) {
            p.interviews_without_new_evidence = 0;
            p.last_updated_interview = Some(interview_id.clone());
        } else {
            p.interviews_without_new_evidence += 1;
        }
    }

    // ── Confidence for every proposition whose sets changed ──────────────
    for id in &touched {
        let p = props.get_mut(id).expect("touched props are present");
        p.confidence = compute_confidence(p, &evidence_interview);
    }

    // ── Status transitions, then prune ───────────────────────────────────
    for p in props.values_mut() {
        if p.is_live() {
            apply_transitions(p, &evidence_interview);
        }
    }
    for p in props.values_mut() {
        if p.is_live()
            && p.confidence < config.prune_confidence_threshold
            && p.interviews_without_new_evidence >= config.prune_min_interviews
        {
            p.status = PropositionStatus::Weak;
        }
    }

    // ── Metrics ──────────────────────────────────────────────────────────
    let metrics = convergence_metrics(
        props.values(),
        novel_evidence.len(),
        new_evidence.len(),
        config,
    );

    // ── Events in application order, then the diff ───────────────────────
    let mut events = Vec::new();
    for item in &new_evidence {
        events.push(ProjectEvent::NewEvidence {
            id: item.id.clone(),
            interview_id: interview_id.clone(),
            factor: item.factor.clone(),
            outcome: item.outcome.clone(),
        });
    }
    for id in &born {
        let p = &props[id];
        events.push(ProjectEvent::NewProposition {
            id: p.id.clone(),
            statement: p.statement(),
            status: p.status,
            confidence: p.confidence,
        });
    }

    let mut updated_propositions = Vec::new();
    for id in &pre_existing {
        let now = &props[id];
        let before = &original[id];
        let materially_changed = now.supporting_evidence != before.supporting_evidence
            || now.contradicting_evidence != before.contradicting_evidence
            || now.status != before.status
            || now.confidence != before.confidence;
        let counter_changed =
            now.interviews_without_new_evidence != before.interviews_without_new_evidence;

        if materially_changed || counter_changed {
            updated_propositions.push(now.clone());
        }
        if !materially_changed {
            continue;
        }
        if now.status == PropositionStatus::Merged && before.status != PropositionStatus::Merged {
            events.push(ProjectEvent::PropositionMerged {
                id: now.id.clone(),
                merged_into: now.merged_into.clone().unwrap_or_default(),
            });
        } else if now.status == PropositionStatus::Weak
            && before.status != PropositionStatus::Weak
        {
            events.push(ProjectEvent::PropositionPruned { id: now.id.clone() });
        } else {
            events.push(ProjectEvent::PropositionUpdated {
                id: now.id.clone(),
                status: now.status,
                confidence: now.confidence,
            });
        }
    }

    if !rejections.is_empty() {
        warn!(
            interview = %interview_id,
            dropped = rejections.len(),
            "analysis diff had invalid parts — dropped, valid evidence kept"
        );
        events.push(ProjectEvent::AnalysisFailed {
            interview_id: Some(interview_id.clone()),
            detail: rejections.join("; "),
        });
    }

    let new_propositions = born.iter().map(|id| props[id].clone()).collect();
    let diff = StoreDiff {
        interview: Some(interview),
        new_evidence,
        new_propositions,
        updated_propositions,
        script: None,
        counters: Some(*counters),
    };

    info!(
        interview = %interview_id,
        evidence = diff.new_evidence.len(),
        born = born.len(),
        updated = diff.updated_propositions.len(),
        convergence = metrics.convergence_score,
        novelty = metrics.novelty_rate,
        mode = ?metrics.mode,
        "analysis reconciled"
    );

    ReconcileOutcome {
        diff,
        events,
        metrics,
        rejections,
    }
}

/// Validate a Designer-produced script against the snapshot it will be
/// committed into: section cap, live targets only, no proposition twice.
pub fn validate_script(
    state: &ProjectState,
    script: &InterviewScript,
    max_sections: usize,
) -> Result<(), String> {
    if script.sections.len() > max_sections {
        return Err(format!(
            "script has {} sections, cap is {max_sections}",
            script.sections.len()
        ));
    }
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    for section in &script.sections {
        match state.proposition(&section.proposition_id) {
            Some(p) if p.is_live() => {}
            Some(p) => {
                return Err(format!(
                    "section references {} which is {:?}",
                    p.id, p.status
                ));
            }
            None => {
                return Err(format!(
                    "section references unknown proposition {}",
                    section.proposition_id
                ));
            }
        }
        if !seen.insert(&section.proposition_id) {
            return Err(format!(
                "proposition {} appears in more than one section",
                section.proposition_id
            ));
        }
    }
    Ok(())
}

fn add_relation(
    prop: &mut Proposition,
    evidence_id: String,
    relation: Relation,
    touched: &mut BTreeSet<String>,
    rejections: &mut Vec<String>,
) {
    let conflicts = match relation {
        Relation::Supports => prop.contradicting_evidence.contains(&evidence_id),
        Relation::Contradicts => prop.supporting_evidence.contains(&evidence_id),
    };
    if conflicts {
        rejections.push(format!(
            "{evidence_id} cannot both support and contradict {}",
            prop.id
        ));
        return;
    }
    let grew = match relation {
        Relation::Supports => prop.supporting_evidence.insert(evidence_id),
        Relation::Contradicts => prop.contradicting_evidence.insert(evidence_id),
    };
    if grew {
        touched.insert(prop.id.clone());
    }
}

/// `|supp| / (|supp| + |contra|)`, 0 when both are empty, minus the 0.2
/// single-interview penalty (floored at 0) when every referenced item comes
/// from one interview.
fn compute_confidence(
    prop: &Proposition,
    evidence_interview: &HashMap<String, String>,
) -> f64 {
    let supp = prop.supporting_evidence.len();
    let contra = prop.contradicting_evidence.len();
    if supp + contra == 0 {
        return 0.0;
    }
    let mut confidence = supp as f64 / (supp + contra) as f64;

    let interviews: BTreeSet<&String> = prop
        .supporting_evidence
        .iter()
        .chain(prop.contradicting_evidence.iter())
        .filter_map(|id| evidence_interview.get(id))
        .collect();
    if interviews.len() == 1 {
        confidence = (confidence - 0.2).max(0.0);
    }
    confidence
}

fn distinct_supporting_interviews(
    prop: &Proposition,
    evidence_interview: &HashMap<String, String>,
) -> usize {
    prop.supporting_evidence
        .iter()
        .filter_map(|id| evidence_interview.get(id))
        .collect::<BTreeSet<_>>()
        .len()
}

fn apply_transitions(prop: &mut Proposition, evidence_interview: &HashMap<String, String>) {
    use PropositionStatus::*;

    if prop.status == Untested
        && !(prop.supporting_evidence.is_empty() && prop.contradicting_evidence.is_empty())
    {
        prop.status = Exploring;
    }
    if prop.status == Exploring
        && prop.confidence >= 0.7
        && prop.supporting_evidence.len() >= 2
        && distinct_supporting_interviews(prop, evidence_interview) >= 2
    {
        prop.status = Confirmed;
    }
    if matches!(prop.status, Exploring | Confirmed)
        && !prop.contradicting_evidence.is_empty()
        && prop.confidence < 0.7
    {
        prop.status = Challenged;
    }
    if prop.status == Confirmed
        && prop.confidence >= 0.8
        && prop.interviews_without_new_evidence >= 2
    {
        prop.status = Saturated;
    }
}

fn convergence_metrics<'a>(
    props: impl Iterator<Item = &'a Proposition>,
    novel_evidence: usize,
    new_evidence: usize,
    config: &EngineConfig,
) -> ScriptMetrics {
    let mut settled = 0usize;
    let mut active = 0usize;
    for p in props {
        if p.status.counts_for_convergence() {
            active += 1;
            if matches!(
                p.status,
                PropositionStatus::Confirmed | PropositionStatus::Saturated
            ) {
                settled += 1;
            }
        }
    }

    let convergence_score = if active == 0 {
        0.0
    } else {
        settled as f64 / active as f64
    };
    let novelty_rate = if new_evidence == 0 {
        0.0
    } else {
        novel_evidence as f64 / new_evidence as f64
    };
    // Strict ≥ on score and ≤ on novelty by contract.
    let mode = if convergence_score >= config.convergence_score_threshold
        && novelty_rate <= config.novelty_rate_threshold
    {
        ScriptMode::Convergent
    } else {
        ScriptMode::Divergent
    };

    ScriptMetrics {
        convergence_score,
        novelty_rate,
        mode,
    }
}

/// Case- and whitespace-insensitive form used for quote containment checks.
fn normalize(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Speaker labels attributed to the machine side of the conversation.
const INTERVIEWER_LABELS: &[&str] = &["interviewer", "agent", "assistant", "ai", "bot", "system"];

/// Keep only respondent turns of a `Speaker: text` transcript.  Unlabelled
/// lines are kept as-is: a raw transcript without speaker structure cannot
/// be narrowed further.
fn respondent_turns(transcript: &str) -> String {
    transcript
        .lines()
        .filter(|line| match line.split_once(':') {
            Some((speaker, _)) => !INTERVIEWER_LABELS.contains(&normalize(speaker).as_str()),
            None => true,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::Utc;

    use super::{compute_confidence, reconcile, validate_script};
    use crate::events::ProjectEvent;
    use eidetic_agents::{
        AnalysisDiff, EvidenceMapping, ExtractedEvidence, MergeProposal, ProposedProposition,
        Relation, RetroMapping, SubsumeProposal,
    };
    use eidetic_config::EngineConfig;
    use eidetic_store::{
        Evidence, IdCounters, Instruction, Interview, InterviewScript, Priority, Project,
        ProjectState, Proposition, PropositionStatus, ScriptMode, ScriptSection,
    };

    fn base_state() -> ProjectState {
        ProjectState::new(Project {
            id: "p".to_string(),
            research_question: "What is your experience with this hackathon?".to_string(),
            seed_angles: vec![],
            created_at: Utc::now(),
            voice_agent_id: "agent_p".to_string(),
            current_script_version: 1,
        })
    }

    fn stored_evidence(id: &str, interview: &str) -> Evidence {
        Evidence {
            id: id.to_string(),
            interview_id: interview.to_string(),
            quote: format!("quote {id}"),
            interpretation: format!("interpretation {id}"),
            factor: "f".to_string(),
            mechanism: "m".to_string(),
            outcome: "o".to_string(),
            tags: vec!["a".to_string(), "b".to_string()],
            language: "en".to_string(),
            timestamp: Utc::now(),
        }
    }

    fn stored_proposition(id: &str, supporting: &[&str], contradicting: &[&str]) -> Proposition {
        Proposition {
            id: id.to_string(),
            factor: format!("factor {id}"),
            mechanism: "m".to_string(),
            outcome: "o".to_string(),
            confidence: 0.5,
            status: PropositionStatus::Exploring,
            supporting_evidence: supporting.iter().map(ToString::to_string).collect(),
            contradicting_evidence: contradicting.iter().map(ToString::to_string).collect(),
            first_seen_interview: Some("INT_001".to_string()),
            last_updated_interview: Some("INT_001".to_string()),
            interviews_without_new_evidence: 0,
            merged_into: None,
        }
    }

    fn interview(id: &str, transcript: &str) -> Interview {
        Interview {
            id: id.to_string(),
            conversation_id: format!("conv_{id}"),
            transcript: transcript.to_string(),
            received_at: Utc::now(),
            script_version_used: Some(1),
            language: "en".to_string(),
            error: None,
        }
    }

    fn extracted(symbol: &str, quote: &str) -> ExtractedEvidence {
        ExtractedEvidence {
            symbol: symbol.to_string(),
            quote: quote.to_string(),
            interpretation: format!("interpretation of {symbol}"),
            factor: "time pressure".to_string(),
            mechanism: "forced prioritization".to_string(),
            outcome: "focus".to_string(),
            tags: vec!["time".to_string(), "focus".to_string()],
            language: "en".to_string(),
        }
    }

    fn supports(evidence: &str, proposition: &str) -> EvidenceMapping {
        EvidenceMapping {
            evidence_symbol: evidence.to_string(),
            proposition_id: proposition.to_string(),
            relation: Relation::Supports,
        }
    }

    #[test]
    fn first_interview_maps_evidence_and_applies_penalty() {
        // Scenario: cold-start proposition gains one supporting item.
        let mut state = base_state();
        let mut p = stored_proposition("P001", &[], &[]);
        p.status = PropositionStatus::Untested;
        p.confidence = 0.0;
        p.first_seen_interview = None;
        p.last_updated_interview = None;
        state.propositions.push(p);

        let analysis = AnalysisDiff {
            evidence: vec![extracted("e1", "Time pressure helped us focus")],
            mappings: vec![supports("e1", "P001")],
            ..AnalysisDiff::default()
        };

        let mut counters = state.counters;
        let outcome = reconcile(
            &state,
            &analysis,
            interview("INT_001", "User: Time pressure helped us focus"),
            &mut counters,
            &EngineConfig::default(),
        );

        assert!(outcome.rejections.is_empty());
        assert_eq!(outcome.diff.new_evidence.len(), 1);
        assert_eq!(outcome.diff.new_evidence[0].id, "E001");
        assert!(outcome.diff.interview.is_some());

        let updated = &outcome.diff.updated_propositions[0];
        assert_eq!(updated.id, "P001");
        assert_eq!(
            updated.supporting_evidence,
            ["E001".to_string()].into_iter().collect::<BTreeSet<_>>()
        );
        // 1/1 = 1.0 minus the single-interview penalty.
        assert!((updated.confidence - 0.8).abs() < 1e-9);
        assert_eq!(updated.status, PropositionStatus::Exploring);
        assert_eq!(updated.interviews_without_new_evidence, 0);
        assert_eq!(updated.last_updated_interview.as_deref(), Some("INT_001"));

        assert!(matches!(outcome.events[0], ProjectEvent::NewEvidence { .. }));
        assert!(matches!(
            outcome.events[1],
            ProjectEvent::PropositionUpdated { .. }
        ));
    }

    #[test]
    fn orphan_evidence_births_proposition_with_first_seen() {
        let mut state = base_state();
        state.evidence.push(stored_evidence("E001", "INT_001"));
        state.propositions.push(stored_proposition("P001", &["E001"], &[]));
        state.counters.evidence = 1;
        state.counters.proposition = 1;
        state.counters.interview = 1;

        let analysis = AnalysisDiff {
            evidence: vec![extracted("e1", "The venue was freezing and I couldn't think")],
            new_propositions: vec![ProposedProposition {
                symbol: "p1".to_string(),
                factor: "cold environment".to_string(),
                mechanism: "physical discomfort".to_string(),
                outcome: "reduced cognition".to_string(),
                supporting_refs: vec!["e1".to_string()],
                contradicting_refs: vec![],
            }],
            ..AnalysisDiff::default()
        };

        let mut counters = state.counters;
        let outcome = reconcile(
            &state,
            &analysis,
            interview("INT_002", "User: The venue was freezing and I couldn't think"),
            &mut counters,
            &EngineConfig::default(),
        );

        assert_eq!(outcome.diff.new_propositions.len(), 1);
        let born = &outcome.diff.new_propositions[0];
        assert_eq!(born.id, "P002");
        assert_eq!(born.first_seen_interview.as_deref(), Some("INT_002"));
        assert!((born.confidence - 0.8).abs() < 1e-9);
        assert_eq!(born.status, PropositionStatus::Exploring);
        // Every extracted item spawned a proposition.
        assert!((outcome.metrics.novelty_rate - 1.0).abs() < 1e-9);
    }

    #[test]
    fn retroactive_scan_recovers_prior_evidence() {
        let mut state = base_state();
        state.evidence.push(stored_evidence("E001", "INT_001"));
        state.counters.evidence = 1;

        let analysis = AnalysisDiff {
            evidence: vec![extracted("e1", "deadlines kept us sharp")],
            new_propositions: vec![ProposedProposition {
                symbol: "p1".to_string(),
                factor: "deadline pressure".to_string(),
                mechanism: "urgency".to_string(),
                outcome: "sharper focus".to_string(),
                supporting_refs: vec!["e1".to_string()],
                contradicting_refs: vec![],
            }],
            retro_mappings: vec![RetroMapping {
                evidence_id: "E001".to_string(),
                proposition_symbol: "p1".to_string(),
                relation: Relation::Supports,
            }],
            ..AnalysisDiff::default()
        };

        let mut counters = state.counters;
        let outcome = reconcile(
            &state,
            &analysis,
            interview("INT_002", "User: deadlines kept us sharp"),
            &mut counters,
            &EngineConfig::default(),
        );

        let born = &outcome.diff.new_propositions[0];
        assert_eq!(born.supporting_evidence.len(), 2);
        assert!(born.supporting_evidence.contains("E001"));
        // Two supporting items from two interviews: no penalty, confirmed.
        assert!((born.confidence - 1.0).abs() < 1e-9);
        assert_eq!(born.status, PropositionStatus::Confirmed);
    }

    #[test]
    fn merge_unifies_sources_at_threshold() {
        let mut state = base_state();
        for (id, interview_id) in [
            ("E004", "INT_001"),
            ("E007", "INT_001"),
            ("E009", "INT_002"),
            ("E011", "INT_002"),
            ("E013", "INT_003"),
        ] {
            state.evidence.push(stored_evidence(id, interview_id));
        }
        state
            .propositions
            .push(stored_proposition("P001", &["E004", "E007", "E011", "E013"], &[]));
        state
            .propositions
            .push(stored_proposition("P002", &["E004", "E009", "E011", "E013"], &[]));
        state.counters.evidence = 13;
        state.counters.proposition = 2;

        let analysis = AnalysisDiff {
            evidence: vec![extracted("e1", "discomfort broke my concentration")],
            merges: vec![MergeProposal {
                source_ids: vec!["P001".to_string(), "P002".to_string()],
                factor: "ambient discomfort".to_string(),
                mechanism: "distraction".to_string(),
                outcome: "reduced focus".to_string(),
            }],
            ..AnalysisDiff::default()
        };

        let mut counters = state.counters;
        let outcome = reconcile(
            &state,
            &analysis,
            interview("INT_004", "User: discomfort broke my concentration"),
            &mut counters,
            &EngineConfig::default(),
        );

        assert!(outcome.rejections.is_empty());
        let merged_product = outcome
            .diff
            .new_propositions
            .iter()
            .find(|p| p.factor == "ambient discomfort")
            .expect("merge product committed");
        assert_eq!(merged_product.id, "P003");
        assert_eq!(merged_product.supporting_evidence.len(), 5);

        for source in ["P001", "P002"] {
            let updated = outcome
                .diff
                .updated_propositions
                .iter()
                .find(|p| p.id == source)
                .expect("source updated");
            assert_eq!(updated.status, PropositionStatus::Merged);
            assert_eq!(updated.merged_into.as_deref(), Some("P003"));
        }
        assert!(outcome
            .events
            .iter()
            .any(|e| matches!(e, ProjectEvent::PropositionMerged { id, merged_into }
                if id == "P001" && merged_into == "P003")));
    }

    #[test]
    fn merge_below_threshold_is_rejected() {
        let mut state = base_state();
        for (id, interview_id) in [("E004", "INT_001"), ("E007", "INT_001"), ("E009", "INT_002")] {
            state.evidence.push(stored_evidence(id, interview_id));
        }
        state.propositions.push(stored_proposition("P001", &["E004", "E007"], &[]));
        state.propositions.push(stored_proposition("P002", &["E004", "E009"], &[]));

        let analysis = AnalysisDiff {
            evidence: vec![extracted("e1", "it was cold")],
            merges: vec![MergeProposal {
                source_ids: vec!["P001".to_string(), "P002".to_string()],
                factor: "x".to_string(),
                mechanism: "y".to_string(),
                outcome: "z".to_string(),
            }],
            ..AnalysisDiff::default()
        };

        let mut counters = state.counters;
        let outcome = reconcile(
            &state,
            &analysis,
            interview("INT_003", "User: it was cold"),
            &mut counters,
            &EngineConfig::default(),
        );

        // Jaccard 1/3 < 0.6: proposal dropped, nothing merged.
        assert!(!outcome.rejections.is_empty());
        assert!(outcome.diff.new_propositions.is_empty());
        assert!(outcome
            .events
            .iter()
            .any(|e| matches!(e, ProjectEvent::AnalysisFailed { .. })));
    }

    #[test]
    fn repeating_a_committed_merge_has_no_effect() {
        let mut state = base_state();
        state.evidence.push(stored_evidence("E001", "INT_001"));
        let mut a = stored_proposition("P001", &["E001"], &[]);
        a.status = PropositionStatus::Merged;
        a.merged_into = Some("P003".to_string());
        let mut b = stored_proposition("P002", &["E001"], &[]);
        b.status = PropositionStatus::Merged;
        b.merged_into = Some("P003".to_string());
        state.propositions.push(a);
        state.propositions.push(b);
        state.propositions.push(stored_proposition("P003", &["E001"], &[]));
        state.counters.proposition = 3;

        let analysis = AnalysisDiff {
            evidence: vec![extracted("e1", "again")],
            merges: vec![MergeProposal {
                source_ids: vec!["P001".to_string(), "P002".to_string()],
                factor: "x".to_string(),
                mechanism: "y".to_string(),
                outcome: "z".to_string(),
            }],
            ..AnalysisDiff::default()
        };

        let mut counters = state.counters;
        let outcome = reconcile(
            &state,
            &analysis,
            interview("INT_002", "User: again"),
            &mut counters,
            &EngineConfig::default(),
        );

        assert!(outcome.diff.new_propositions.is_empty());
        assert!(outcome
            .rejections
            .iter()
            .any(|r| r.contains("must exist and be live")));
    }

    #[test]
    fn merge_chains_collapse_transitively() {
        let mut state = base_state();
        for id in ["E001", "E002", "E003"] {
            state.evidence.push(stored_evidence(id, "INT_001"));
        }
        // P003 subsumes into P001 while P001 merges into the new product.
        state.propositions.push(stored_proposition("P001", &["E001", "E002"], &[]));
        state.propositions.push(stored_proposition("P002", &["E001", "E002"], &[]));
        state.propositions.push(stored_proposition("P003", &["E003"], &[]));
        state.counters.proposition = 3;

        let analysis = AnalysisDiff {
            evidence: vec![extracted("e1", "whatever was said")],
            subsumes: vec![SubsumeProposal {
                specific_id: "P003".to_string(),
                general_id: "P001".to_string(),
            }],
            merges: vec![MergeProposal {
                source_ids: vec!["P001".to_string(), "P002".to_string()],
                factor: "unified".to_string(),
                mechanism: "m".to_string(),
                outcome: "o".to_string(),
            }],
            ..AnalysisDiff::default()
        };

        let mut counters = state.counters;
        let outcome = reconcile(
            &state,
            &analysis,
            interview("INT_002", "User: whatever was said"),
            &mut counters,
            &EngineConfig::default(),
        );

        let p3 = outcome
            .diff
            .updated_propositions
            .iter()
            .find(|p| p.id == "P003")
            .expect("P003 updated");
        assert_eq!(p3.status, PropositionStatus::Merged);
        // Not P001 (itself merged) but the terminal product.
        assert_eq!(p3.merged_into.as_deref(), Some("P004"));
    }

    #[test]
    fn stale_low_confidence_proposition_is_pruned() {
        let mut state = base_state();
        state.evidence.push(stored_evidence("E001", "INT_001"));
        let mut p = stored_proposition("P001", &["E001"], &[]);
        p.confidence = 0.1;
        p.interviews_without_new_evidence = 3;
        state.propositions.push(p);

        let analysis = AnalysisDiff {
            evidence: vec![extracted("e1", "nothing related")],
            ..AnalysisDiff::default()
        };

        let mut counters = state.counters;
        let outcome = reconcile(
            &state,
            &analysis,
            interview("INT_005", "User: nothing related"),
            &mut counters,
            &EngineConfig::default(),
        );

        let updated = outcome
            .diff
            .updated_propositions
            .iter()
            .find(|p| p.id == "P001")
            .expect("P001 updated");
        assert_eq!(updated.status, PropositionStatus::Weak);
        assert_eq!(updated.interviews_without_new_evidence, 4);
        assert!(outcome
            .events
            .iter()
            .any(|e| matches!(e, ProjectEvent::PropositionPruned { id } if id == "P001")));
    }

    #[test]
    fn staleness_counter_resets_on_touch_and_grows_otherwise() {
        let mut state = base_state();
        state.evidence.push(stored_evidence("E001", "INT_001"));
        let mut touched = stored_proposition("P001", &["E001"], &[]);
        touched.interviews_without_new_evidence = 2;
        let mut untouched = stored_proposition("P002", &["E001"], &[]);
        untouched.interviews_without_new_evidence = 1;
        state.propositions.push(touched);
        state.propositions.push(untouched);

        let analysis = AnalysisDiff {
            evidence: vec![extracted("e1", "pressure again")],
            mappings: vec![supports("e1", "P001")],
            ..AnalysisDiff::default()
        };

        let mut counters = state.counters;
        let outcome = reconcile(
            &state,
            &analysis,
            interview("INT_004", "User: pressure again"),
            &mut counters,
            &EngineConfig::default(),
        );

        let p1 = outcome
            .diff
            .updated_propositions
            .iter()
            .find(|p| p.id == "P001")
            .unwrap();
        assert_eq!(p1.interviews_without_new_evidence, 0);
        assert_eq!(p1.last_updated_interview.as_deref(), Some("INT_004"));
        let p2 = outcome
            .diff
            .updated_propositions
            .iter()
            .find(|p| p.id == "P002")
            .unwrap();
        assert_eq!(p2.interviews_without_new_evidence, 2);
        assert_eq!(p2.last_updated_interview.as_deref(), Some("INT_001"));
    }

    #[test]
    fn evidence_cannot_both_support_and_contradict() {
        let mut state = base_state();
        state.propositions.push(stored_proposition("P001", &[], &[]));

        let analysis = AnalysisDiff {
            evidence: vec![extracted("e1", "both ways")],
            mappings: vec![
                supports("e1", "P001"),
                EvidenceMapping {
                    evidence_symbol: "e1".to_string(),
                    proposition_id: "P001".to_string(),
                    relation: Relation::Contradicts,
                },
            ],
            ..AnalysisDiff::default()
        };

        let mut counters = state.counters;
        let outcome = reconcile(
            &state,
            &analysis,
            interview("INT_001", "User: both ways"),
            &mut counters,
            &EngineConfig::default(),
        );

        let updated = &outcome.diff.updated_propositions[0];
        assert!(updated.supporting_evidence.contains("E001"));
        assert!(updated.contradicting_evidence.is_empty());
        assert!(outcome
            .rejections
            .iter()
            .any(|r| r.contains("both support and contradict")));
    }

    #[test]
    fn merged_propositions_never_gain_evidence() {
        let mut state = base_state();
        let mut merged = stored_proposition("P001", &[], &[]);
        merged.status = PropositionStatus::Merged;
        merged.merged_into = Some("P002".to_string());
        state.propositions.push(merged);
        state.propositions.push(stored_proposition("P002", &[], &[]));

        let analysis = AnalysisDiff {
            evidence: vec![extracted("e1", "something relevant")],
            mappings: vec![supports("e1", "P001")],
            ..AnalysisDiff::default()
        };

        let mut counters = state.counters;
        let outcome = reconcile(
            &state,
            &analysis,
            interview("INT_002", "User: something relevant"),
            &mut counters,
            &EngineConfig::default(),
        );

        assert!(outcome
            .rejections
            .iter()
            .any(|r| r.contains("targets P001")));
        let p1 = outcome.diff.updated_propositions.iter().find(|p| p.id == "P001");
        assert!(p1.is_none(), "merged proposition must stay frozen");
    }

    #[test]
    fn invalid_parts_are_dropped_but_evidence_survives() {
        let state = base_state();

        let analysis = AnalysisDiff {
            evidence: vec![extracted("e1", "worth keeping")],
            mappings: vec![supports("e1", "P099")],
            ..AnalysisDiff::default()
        };

        let mut counters = state.counters;
        let outcome = reconcile(
            &state,
            &analysis,
            interview("INT_001", "User: worth keeping"),
            &mut counters,
            &EngineConfig::default(),
        );

        assert_eq!(outcome.diff.new_evidence.len(), 1);
        assert!(outcome.diff.updated_propositions.is_empty());
        assert!(matches!(
            outcome.events.last(),
            Some(ProjectEvent::AnalysisFailed { .. })
        ));
    }

    #[test]
    fn fabricated_quotes_are_dropped() {
        let state = base_state();
        let analysis = AnalysisDiff {
            evidence: vec![
                extracted("e1", "I loved the mentors"),
                extracted("e2", "this sentence never happened"),
            ],
            ..AnalysisDiff::default()
        };

        let mut counters = state.counters;
        let outcome = reconcile(
            &state,
            &analysis,
            interview("INT_001", "User: I loved the mentors"),
            &mut counters,
            &EngineConfig::default(),
        );

        assert_eq!(outcome.diff.new_evidence.len(), 1);
        assert!(outcome
            .rejections
            .iter()
            .any(|r| r.contains("not found in any respondent turn")));
    }

    #[test]
    fn interviewer_turns_are_not_quotable_as_evidence() {
        let state = base_state();
        let analysis = AnalysisDiff {
            evidence: vec![
                // Echoes the interviewer's own question — present verbatim
                // in the transcript, but not respondent speech.
                extracted("e1", "Did time pressure help you focus?"),
                extracted("e2", "the deadline forced us to cut scope"),
            ],
            ..AnalysisDiff::default()
        };

        let mut counters = state.counters;
        let outcome = reconcile(
            &state,
            &analysis,
            interview(
                "INT_001",
                "Interviewer: Did time pressure help you focus?\n\
                 User: Yes, the deadline forced us to cut scope",
            ),
            &mut counters,
            &EngineConfig::default(),
        );

        assert_eq!(outcome.diff.new_evidence.len(), 1);
        assert_eq!(
            outcome.diff.new_evidence[0].quote,
            "the deadline forced us to cut scope"
        );
        assert!(outcome
            .rejections
            .iter()
            .any(|r| r.contains("e1") && r.contains("respondent turn")));
    }

    #[test]
    fn confirmed_proposition_saturates_after_quiet_interviews() {
        let mut state = base_state();
        state.evidence.push(stored_evidence("E001", "INT_001"));
        state.evidence.push(stored_evidence("E002", "INT_002"));
        let mut p = stored_proposition("P001", &["E001", "E002"], &[]);
        p.status = PropositionStatus::Confirmed;
        p.confidence = 1.0;
        p.interviews_without_new_evidence = 1;
        state.propositions.push(p);

        let analysis = AnalysisDiff {
            evidence: vec![extracted("e1", "unrelated remark")],
            ..AnalysisDiff::default()
        };

        let mut counters = state.counters;
        let outcome = reconcile(
            &state,
            &analysis,
            interview("INT_003", "User: unrelated remark"),
            &mut counters,
            &EngineConfig::default(),
        );

        let updated = outcome
            .diff
            .updated_propositions
            .iter()
            .find(|p| p.id == "P001")
            .unwrap();
        assert_eq!(updated.status, PropositionStatus::Saturated);
    }

    #[test]
    fn confidence_is_zero_for_empty_sets() {
        let p = stored_proposition("P001", &[], &[]);
        assert_eq!(compute_confidence(&p, &Default::default()), 0.0);
    }

    #[test]
    fn convergence_gate_is_inclusive_on_both_thresholds() {
        use super::convergence_metrics;

        let mut props = Vec::new();
        for i in 0..3 {
            let mut p = stored_proposition(&format!("P00{i}"), &[], &[]);
            p.status = PropositionStatus::Confirmed;
            props.push(p);
        }
        for i in 3..5 {
            props.push(stored_proposition(&format!("P00{i}"), &[], &[]));
        }

        // Score exactly 3/5 = 0.6, novelty exactly 3/20 = 0.15 — convergent.
        let metrics = convergence_metrics(props.iter(), 3, 20, &EngineConfig::default());
        assert!((metrics.convergence_score - 0.6).abs() < 1e-9);
        assert!((metrics.novelty_rate - 0.15).abs() < 1e-9);
        assert_eq!(metrics.mode, ScriptMode::Convergent);

        // One more novel item tips the gate back to divergent.
        let metrics = convergence_metrics(props.iter(), 4, 20, &EngineConfig::default());
        assert_eq!(metrics.mode, ScriptMode::Divergent);
    }

    #[test]
    fn metrics_are_zero_on_empty_denominators() {
        use super::convergence_metrics;
        let metrics = convergence_metrics(std::iter::empty(), 0, 0, &EngineConfig::default());
        assert_eq!(metrics.convergence_score, 0.0);
        assert_eq!(metrics.novelty_rate, 0.0);
        assert_eq!(metrics.mode, ScriptMode::Divergent);
    }

    fn script_with_sections(sections: Vec<ScriptSection>) -> InterviewScript {
        InterviewScript {
            version: 2,
            generated_after_interview: Some("INT_001".to_string()),
            research_question: "q".to_string(),
            opening_question: "o".to_string(),
            sections,
            closing_question: "c".to_string(),
            wildcard: "w".to_string(),
            mode: ScriptMode::Divergent,
            convergence_score: 0.0,
            novelty_rate: 0.0,
            changes_summary: None,
        }
    }

    fn section(proposition_id: &str) -> ScriptSection {
        ScriptSection {
            proposition_id: proposition_id.to_string(),
            priority: Priority::Medium,
            instruction: Instruction::Verify,
            main_question: "q".to_string(),
            probes: vec![],
            context: String::new(),
        }
    }

    #[test]
    fn script_validation_rejects_cap_duplicates_and_dead_targets() {
        let mut state = base_state();
        state.propositions.push(stored_proposition("P001", &[], &[]));
        let mut weak = stored_proposition("P002", &[], &[]);
        weak.status = PropositionStatus::Weak;
        state.propositions.push(weak);

        let ok = script_with_sections(vec![section("P001")]);
        assert!(validate_script(&state, &ok, 8).is_ok());

        let over_cap = script_with_sections(vec![section("P001")]);
        assert!(validate_script(&state, &over_cap, 0).is_err());

        let duplicate = script_with_sections(vec![section("P001"), section("P001")]);
        assert!(validate_script(&state, &duplicate, 8).is_err());

        let dead = script_with_sections(vec![section("P002")]);
        assert!(validate_script(&state, &dead, 8).is_err());

        let unknown = script_with_sections(vec![section("P099")]);
        assert!(validate_script(&state, &unknown, 8).is_err());
    }
}
