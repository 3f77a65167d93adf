//! Ingestion orchestration.
//!
//! One ingestion drives the full cycle under the per-project lock: snapshot
//! → Analyst → Reconciler commit → Designer → publication.  Projects are
//! independent; within a project the lock gives script versions a total
//! order.  Nothing here is fatal — every failure path leaves the store
//! consistent and the process ready for the next webhook.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use eidetic_agents::{Analyst, AnalystError, Designer, build_interviewer_prompt};
use eidetic_config::AppConfig;
use eidetic_llm::{LlmError, Oracle};
use eidetic_store::{
    Interview, InterviewScript, Project, ProjectState, ProjectStore, ScriptMode, StoreDiff,
    StoreError,
};
use eidetic_voice::{PublishError, TranscriptDelivery, VoiceClient};

use crate::bus::EventBus;
use crate::events::ProjectEvent;
use crate::reconciler::{reconcile, validate_script};

/// Outbound publication seam.  The production implementation is
/// [`VoiceClient`]; tests substitute a recorder.
#[async_trait]
pub trait ScriptPublisher: Send + Sync {
    async fn publish_script(&self, agent_id: &str, prompt_text: &str)
    -> Result<(), PublishError>;
}

#[async_trait]
impl ScriptPublisher for VoiceClient {
    async fn publish_script(
        &self,
        agent_id: &str,
        prompt_text: &str,
    ) -> Result<(), PublishError> {
        VoiceClient::publish_script(self, agent_id, prompt_text).await
    }
}

/// What one ingestion did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The conversation was already processed; nothing changed.
    Duplicate,
    /// Analysis could not produce a usable diff; the transcript was kept.
    AnalysisFailed {
        interview_id: String,
        detail: String,
    },
    /// Knowledge committed.  `script_version` is `None` when script
    /// generation failed and the previous version stays active.
    Committed {
        interview_id: String,
        script_version: Option<u32>,
        published: bool,
    },
}

/// Transport-level analyst attempts within one ingestion.
const TRANSPORT_RETRIES: u32 = 3;

pub struct Pipeline {
    store: ProjectStore,
    analyst: Analyst,
    designer: Designer,
    publisher: Arc<dyn ScriptPublisher>,
    bus: Arc<EventBus>,
    config: AppConfig,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    transport_backoff: Duration,
}

impl Pipeline {
    pub fn new(
        store: ProjectStore,
        oracle: Oracle,
        publisher: Arc<dyn ScriptPublisher>,
        bus: Arc<EventBus>,
        config: AppConfig,
    ) -> Self {
        let analyst = Analyst::new(oracle.clone(), config.llm.analyst.clone());
        let designer = Designer::new(oracle, config.llm.designer.clone());
        Self {
            store,
            analyst,
            designer,
            publisher,
            bus,
            config,
            locks: Mutex::new(HashMap::new()),
            transport_backoff: Duration::from_secs(2),
        }
    }

    /// Shrink the transport backoff (tests exercise the retry path without
    /// waiting out real backoff windows).
    pub fn with_transport_backoff(mut self, backoff: Duration) -> Self {
        self.transport_backoff = backoff;
        self
    }

    pub fn store(&self) -> &ProjectStore {
        &self.store
    }

    async fn lock_for(&self, project_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Create a project, seed it with initial propositions and script v1,
    /// and publish the first interviewer prompt.
    pub async fn create_project(
        &self,
        project_id: &str,
        research_question: &str,
        seed_angles: Vec<String>,
        voice_agent_id: &str,
    ) -> Result<ProjectState> {
        let lock = self.lock_for(project_id).await;
        let _guard = lock.lock().await;

        let state = self
            .store
            .create(Project {
                id: project_id.to_string(),
                research_question: research_question.to_string(),
                seed_angles: seed_angles.clone(),
                created_at: Utc::now(),
                voice_agent_id: voice_agent_id.to_string(),
                current_script_version: 0,
            })
            .await?;

        let mut counters = state.counters;
        let (propositions, script) = self
            .designer
            .generate_initial(
                research_question,
                &seed_angles,
                &mut counters,
                self.config.engine.max_propositions_in_script,
            )
            .await?;

        let diff = StoreDiff {
            new_propositions: propositions,
            script: Some(script.clone()),
            counters: Some(counters),
            ..StoreDiff::default()
        };
        let state = self.store.commit(project_id, diff).await?;

        for p in &state.propositions {
            self.bus.emit(
                project_id,
                ProjectEvent::NewProposition {
                    id: p.id.clone(),
                    statement: p.statement(),
                    status: p.status,
                    confidence: p.confidence,
                },
            );
        }
        self.emit_script_updated(project_id, &script);
        self.publish(&state, &script).await;

        info!(
            project = %project_id,
            propositions = state.propositions.len(),
            "project created with script v1"
        );
        Ok(state)
    }

    /// Process one delivered transcript end to end.
    pub async fn ingest(
        &self,
        project_id: &str,
        conversation_id: &str,
        transcript: &str,
        language: &str,
    ) -> Result<IngestOutcome> {
        let lock = self.lock_for(project_id).await;
        let _guard = lock.lock().await;

        let state = self.store.load(project_id).await?;
        if state.has_conversation(conversation_id) {
            info!(
                project = %project_id,
                conversation = %conversation_id,
                "duplicate webhook — already processed"
            );
            return Ok(IngestOutcome::Duplicate);
        }

        let mut counters = state.counters;
        let interview_id = counters.next_interview();
        let interview = Interview {
            id: interview_id.clone(),
            conversation_id: conversation_id.to_string(),
            transcript: transcript.to_string(),
            received_at: Utc::now(),
            script_version_used: (state.project.current_script_version > 0)
                .then_some(state.project.current_script_version),
            language: language.to_string(),
            error: None,
        };
        let mode = state
            .current_script()
            .map(|s| s.mode)
            .unwrap_or(ScriptMode::Divergent);

        let analysis = match self
            .analyze_with_retry(transcript, &interview_id, language, &state, mode)
            .await
        {
            Ok(analysis) => analysis,
            Err(detail) => {
                // Keep the transcript; record the failure on the interview.
                let mut failed = interview;
                failed.error = Some(detail.clone());
                self.store
                    .commit(
                        project_id,
                        StoreDiff {
                            interview: Some(failed),
                            counters: Some(counters),
                            ..StoreDiff::default()
                        },
                    )
                    .await?;
                self.bus.emit(
                    project_id,
                    ProjectEvent::AnalysisFailed {
                        interview_id: Some(interview_id.clone()),
                        detail: detail.clone(),
                    },
                );
                warn!(
                    project = %project_id,
                    interview = %interview_id,
                    %detail,
                    "analysis failed — transcript kept, no knowledge committed"
                );
                return Ok(IngestOutcome::AnalysisFailed {
                    interview_id,
                    detail,
                });
            }
        };

        let outcome = reconcile(
            &state,
            &analysis,
            interview,
            &mut counters,
            &self.config.engine,
        );
        let state = self.store.commit(project_id, outcome.diff).await?;
        for event in outcome.events {
            self.bus.emit(project_id, event);
        }

        // Script regeneration: a failure here never blocks the ingestion —
        // the previous script stays active for the next conversation.
        let mut script_version = None;
        let mut published = false;
        let mut counters = state.counters;
        match self
            .designer
            .update_script(
                &state,
                outcome.metrics,
                &mut counters,
                &interview_id,
                self.config.engine.max_propositions_in_script,
            )
            .await
        {
            Ok(script) => {
                if let Err(detail) =
                    validate_script(&state, &script, self.config.engine.max_propositions_in_script)
                {
                    warn!(project = %project_id, %detail, "generated script failed validation");
                    self.bus
                        .emit(project_id, ProjectEvent::ScriptGenerationFailed { detail });
                } else {
                    let state = self
                        .store
                        .commit(
                            project_id,
                            StoreDiff {
                                script: Some(script.clone()),
                                counters: Some(counters),
                                ..StoreDiff::default()
                            },
                        )
                        .await?;
                    self.emit_script_updated(project_id, &script);
                    script_version = Some(script.version);
                    published = self.publish(&state, &script).await;
                }
            }
            Err(err) => {
                warn!(
                    project = %project_id,
                    error = %err,
                    "script generation failed — previous script stays active"
                );
                self.bus.emit(
                    project_id,
                    ProjectEvent::ScriptGenerationFailed {
                        detail: err.to_string(),
                    },
                );
            }
        }

        Ok(IngestOutcome::Committed {
            interview_id,
            script_version,
            published,
        })
    }

    /// Webhook entry: route a validated delivery to its owning project.
    pub async fn ingest_delivery(&self, delivery: TranscriptDelivery) -> Result<IngestOutcome> {
        let Some(project_id) = self.store.find_by_agent(&delivery.agent_id).await? else {
            return Err(StoreError::UnknownProject(delivery.agent_id).into());
        };
        self.ingest(
            &project_id,
            &delivery.conversation_id,
            &delivery.transcript,
            &delivery.language,
        )
        .await
    }

    /// Push the current script again, e.g. after a publish failure.
    pub async fn republish(&self, project_id: &str) -> Result<bool> {
        let lock = self.lock_for(project_id).await;
        let _guard = lock.lock().await;

        let state = self.store.load(project_id).await?;
        let Some(script) = state.current_script().cloned() else {
            anyhow::bail!("project {project_id} has no script to publish");
        };
        Ok(self.publish(&state, &script).await)
    }

    pub async fn delete_project(&self, project_id: &str) -> Result<()> {
        let lock = self.lock_for(project_id).await;
        let _guard = lock.lock().await;
        self.store.delete(project_id).await?;
        self.bus.remove_project(project_id);
        Ok(())
    }

    async fn analyze_with_retry(
        &self,
        transcript: &str,
        interview_id: &str,
        language: &str,
        state: &ProjectState,
        mode: ScriptMode,
    ) -> Result<eidetic_agents::AnalysisDiff, String> {
        let mut last_detail = String::new();
        for attempt in 1..=TRANSPORT_RETRIES {
            match self
                .analyst
                .analyze(
                    transcript,
                    interview_id,
                    language,
                    state,
                    mode,
                    self.config.engine.merge_overlap_threshold,
                )
                .await
            {
                Ok(analysis) => return Ok(analysis),
                Err(AnalystError::Llm(LlmError::Unavailable(detail))) => {
                    warn!(attempt, %detail, "analyst transport failure — backing off");
                    last_detail = format!("LLM unavailable: {detail}");
                    if attempt < TRANSPORT_RETRIES {
                        tokio::time::sleep(self.transport_backoff * attempt).await;
                    }
                }
                // Format and shape failures already burned the oracle's
                // in-call retries; resending won't help.
                Err(err) => return Err(err.to_string()),
            }
        }
        Err(last_detail)
    }

    async fn publish(&self, state: &ProjectState, script: &InterviewScript) -> bool {
        let prompt = build_interviewer_prompt(
            script,
            self.config.engine.max_interview_duration_minutes,
        );
        match self
            .publisher
            .publish_script(&state.project.voice_agent_id, &prompt)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    project = %state.project.id,
                    version = script.version,
                    error = %err,
                    "script publication failed — previous prompt remains active in the runtime"
                );
                self.bus.emit(
                    &state.project.id,
                    ProjectEvent::PublishFailed {
                        script_version: script.version,
                        detail: err.to_string(),
                    },
                );
                false
            }
        }
    }

    fn emit_script_updated(&self, project_id: &str, script: &InterviewScript) {
        self.bus.emit(
            project_id,
            ProjectEvent::ScriptUpdated {
                version: script.version,
                mode: script.mode,
                convergence_score: script.convergence_score,
                novelty_rate: script.novelty_rate,
            },
        );
    }
}
