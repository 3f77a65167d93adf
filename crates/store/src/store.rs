use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::diff::StoreDiff;
use crate::ids::IdCounters;
use crate::schema::{Evidence, Interview, InterviewScript, Project, Proposition};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown project: {0}")]
    UnknownProject(String),
    #[error("project already exists: {0}")]
    ProjectExists(String),
    #[error("corrupt state file {path} (original preserved in .corrupt sidecar): {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("id {0} already exists in project")]
    DuplicateId(String),
    #[error("update references unknown proposition {0}")]
    UnknownProposition(String),
    #[error("interview with conversation {0} already recorded")]
    DuplicateConversation(String),
    #[error("script version {got} does not extend current version {have}")]
    ScriptVersionGap { have: u32, got: u32 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// One project's complete state: metadata, the four collections, and the id
/// counters.  Loaded and committed as a unit so readers never observe a torn
/// cross-collection snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectState {
    pub project: Project,
    pub evidence: Vec<Evidence>,
    pub propositions: Vec<Proposition>,
    pub interviews: Vec<Interview>,
    pub scripts: Vec<InterviewScript>,
    pub counters: IdCounters,
}

impl ProjectState {
    pub fn new(project: Project) -> Self {
        Self {
            project,
            evidence: Vec::new(),
            propositions: Vec::new(),
            interviews: Vec::new(),
            scripts: Vec::new(),
            counters: IdCounters::default(),
        }
    }

    pub fn evidence_by_id(&self, id: &str) -> Option<&Evidence> {
        self.evidence.iter().find(|e| e.id == id)
    }

    pub fn proposition(&self, id: &str) -> Option<&Proposition> {
        self.propositions.iter().find(|p| p.id == id)
    }

    pub fn live_propositions(&self) -> Vec<&Proposition> {
        self.propositions.iter().filter(|p| p.is_live()).collect()
    }

    pub fn has_conversation(&self, conversation_id: &str) -> bool {
        self.interviews
            .iter()
            .any(|i| i.conversation_id == conversation_id)
    }

    pub fn current_script(&self) -> Option<&InterviewScript> {
        self.scripts.last()
    }

    /// Apply a validated diff in place.  Enforces the append-mostly contract:
    /// evidence and interviews only grow, proposition updates must target
    /// existing ids, script versions extend without gaps, counters never
    /// move backwards.
    pub fn apply(&mut self, diff: StoreDiff) -> Result<(), StoreError> {
        let mut evidence_ids: HashSet<&str> =
            self.evidence.iter().map(|e| e.id.as_str()).collect();
        for item in &diff.new_evidence {
            if !evidence_ids.insert(&item.id) {
                return Err(StoreError::DuplicateId(item.id.clone()));
            }
        }
        let mut proposition_ids: HashSet<&str> =
            self.propositions.iter().map(|p| p.id.as_str()).collect();
        for item in &diff.new_propositions {
            if !proposition_ids.insert(&item.id) {
                return Err(StoreError::DuplicateId(item.id.clone()));
            }
        }
        if let Some(interview) = &diff.interview {
            if self.has_conversation(&interview.conversation_id) {
                return Err(StoreError::DuplicateConversation(
                    interview.conversation_id.clone(),
                ));
            }
        }
        if let Some(script) = &diff.script {
            let have = self.scripts.last().map(|s| s.version).unwrap_or(0);
            if script.version != have + 1 {
                return Err(StoreError::ScriptVersionGap {
                    have,
                    got: script.version,
                });
            }
        }
        for update in &diff.updated_propositions {
            if !self.propositions.iter().any(|p| p.id == update.id) {
                return Err(StoreError::UnknownProposition(update.id.clone()));
            }
        }

        self.evidence.extend(diff.new_evidence);
        for update in diff.updated_propositions {
            let slot = self
                .propositions
                .iter_mut()
                .find(|p| p.id == update.id)
                .expect("existence checked above");
            *slot = update;
        }
        self.propositions.extend(diff.new_propositions);
        if let Some(interview) = diff.interview {
            self.interviews.push(interview);
        }
        if let Some(script) = diff.script {
            self.project.current_script_version = script.version;
            self.scripts.push(script);
        }
        if let Some(counters) = diff.counters {
            self.counters.evidence = self.counters.evidence.max(counters.evidence);
            self.counters.proposition = self.counters.proposition.max(counters.proposition);
            self.counters.interview = self.counters.interview.max(counters.interview);
            self.counters.script = self.counters.script.max(counters.script);
        }

        Ok(())
    }
}

/// Key-addressable durable storage: one `state.json` per project, replaced
/// atomically on commit (tmp sibling + fsync + rename).  A crash between
/// commits leaves the previous consistent snapshot on disk.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    root: PathBuf,
}

impl ProjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn project_dir(&self, project_id: &str) -> PathBuf {
        self.root.join("projects").join(project_id)
    }

    fn state_path(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("state.json")
    }

    pub async fn create(&self, project: Project) -> Result<ProjectState, StoreError> {
        let path = self.state_path(&project.id);
        if tokio::fs::try_exists(&path).await? {
            return Err(StoreError::ProjectExists(project.id));
        }

        let state = ProjectState::new(project);
        write_state_atomic(&path, &state).await?;
        info!(project = %state.project.id, "project created");
        Ok(state)
    }

    /// Read one consistent snapshot.  A file that no longer parses is copied
    /// to a `.corrupt` sidecar and the load fails cleanly; no partial state
    /// ever escapes.
    pub async fn load(&self, project_id: &str) -> Result<ProjectState, StoreError> {
        let path = self.state_path(project_id);
        if !tokio::fs::try_exists(&path).await? {
            return Err(StoreError::UnknownProject(project_id.to_string()));
        }

        let raw = tokio::fs::read_to_string(&path).await?;
        match serde_json::from_str(&raw) {
            Ok(state) => Ok(state),
            Err(source) => {
                let sidecar = path.with_extension("json.corrupt");
                if let Err(err) = tokio::fs::copy(&path, &sidecar).await {
                    warn!(path = %path.display(), error = %err, "failed to write .corrupt sidecar");
                }
                Err(StoreError::Corrupt { path, source })
            }
        }
    }

    /// Apply a diff and durably replace the state file.  Atomic with respect
    /// to readers: a concurrent [`Self::load`] sees either the pre- or the
    /// post-commit snapshot.
    pub async fn commit(
        &self,
        project_id: &str,
        diff: StoreDiff,
    ) -> Result<ProjectState, StoreError> {
        let mut state = self.load(project_id).await?;
        state.apply(diff)?;
        write_state_atomic(&self.state_path(project_id), &state).await?;
        Ok(state)
    }

    pub async fn delete(&self, project_id: &str) -> Result<(), StoreError> {
        let dir = self.project_dir(project_id);
        if !tokio::fs::try_exists(&dir).await? {
            return Err(StoreError::UnknownProject(project_id.to_string()));
        }
        tokio::fs::remove_dir_all(&dir).await?;
        info!(project = %project_id, "project deleted");
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.root.join("projects");
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                ids.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Locate the project owning an external voice-runtime agent id.
    /// Unreadable projects are skipped with a warning rather than failing
    /// webhook routing for everyone.
    pub async fn find_by_agent(&self, agent_id: &str) -> Result<Option<String>, StoreError> {
        for project_id in self.list().await? {
            match self.load(&project_id).await {
                Ok(state) if state.project.voice_agent_id == agent_id => {
                    return Ok(Some(project_id));
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(project = %project_id, error = %err, "skipping unreadable project during agent lookup");
                }
            }
        }
        Ok(None)
    }
}

/// Write the serialized state to a `.tmp` sibling, fsync, then rename over
/// the original.  A crash before the rename leaves the previous file
/// untouched; a crash after leaves the new one fully consistent.  The `.tmp`
/// file is cleaned up on error paths.
async fn write_state_atomic(path: &Path, state: &ProjectState) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp_path = path.with_extension("json.tmp");
    let rendered = serde_json::to_string_pretty(state)?;

    let write_result: Result<(), StoreError> = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;
        file.write_all(rendered.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
    .await;

    if let Err(err) = write_result {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err);
    }

    if let Err(err) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err.into());
    }

    Ok(())
}
