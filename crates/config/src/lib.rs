use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Knowledge-maintenance thresholds and script limits.
///
/// Every value has a sensible default; a config file only needs to name the
/// keys it wants to change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fraction of live propositions that must be confirmed or saturated
    /// before the project is eligible for convergent mode.
    pub convergence_score_threshold: f64,
    /// Maximum novelty rate (share of an interview's evidence spawning new
    /// propositions) allowed in convergent mode.
    pub novelty_rate_threshold: f64,
    /// Jaccard similarity on supporting-evidence sets at which two
    /// propositions are merged.
    pub merge_overlap_threshold: f64,
    pub prune_confidence_threshold: f64,
    pub prune_min_interviews: u32,
    pub max_propositions_in_script: usize,
    /// Advisory only; surfaced inside the interviewer prompt.
    pub max_interview_duration_minutes: u32,
    pub data_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            convergence_score_threshold: 0.6,
            novelty_rate_threshold: 0.15,
            merge_overlap_threshold: 0.6,
            prune_confidence_threshold: 0.15,
            prune_min_interviews: 3,
            max_propositions_in_script: 8,
            max_interview_duration_minutes: 10,
            data_dir: ".eidetic".to_string(),
        }
    }
}

/// Model selection and sampling temperature for one agent role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentModelConfig {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for AgentModelConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.3,
            max_tokens: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// OpenAI-compatible chat-completions endpoint base.
    pub base_url: String,
    /// Name of the environment variable holding the API key.  The key itself
    /// never lives in the config file.
    pub api_key_env: String,
    pub request_timeout_secs: u64,
    /// Attempts per call before a malformed reply becomes a format error.
    pub format_retries: u32,
    pub designer: AgentModelConfig,
    pub analyst: AgentModelConfig,
    pub synthesizer: AgentModelConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "EIDETIC_API_KEY".to_string(),
            request_timeout_secs: 90,
            format_retries: 3,
            designer: AgentModelConfig::default(),
            analyst: AgentModelConfig {
                temperature: 0.2,
                ..AgentModelConfig::default()
            },
            synthesizer: AgentModelConfig {
                temperature: 0.5,
                ..AgentModelConfig::default()
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Voice-runtime API base; prompt updates are pushed here.
    pub base_url: String,
    pub api_key_env: String,
    pub publish_max_retries: u32,
    pub publish_backoff_secs: u64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.voice.example.com/v1".to_string(),
            api_key_env: "VOICE_API_KEY".to_string(),
            publish_max_retries: 3,
            publish_backoff_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub llm: LlmConfig,
    pub voice: VoiceConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("EIDETIC_DATA_DIR") {
            if !value.is_empty() {
                config.engine.data_dir = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::AppConfig;

    #[test]
    fn defaults_match_documented_thresholds() {
        let config = AppConfig::default();
        assert_eq!(config.engine.convergence_score_threshold, 0.6);
        assert_eq!(config.engine.novelty_rate_threshold, 0.15);
        assert_eq!(config.engine.merge_overlap_threshold, 0.6);
        assert_eq!(config.engine.prune_confidence_threshold, 0.15);
        assert_eq!(config.engine.prune_min_interviews, 3);
        assert_eq!(config.engine.max_propositions_in_script, 8);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = AppConfig::load_from("/nonexistent/eidetic.toml").unwrap();
        assert_eq!(config.llm.format_retries, 3);
        assert_eq!(config.telemetry.log_level, "info");
    }

    #[test]
    fn partial_toml_keeps_defaults_for_omitted_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eidetic.toml");
        std::fs::write(
            &path,
            "[engine]\nmerge_overlap_threshold = 0.8\n\n[llm.analyst]\nmodel = \"local-7b\"\n",
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.engine.merge_overlap_threshold, 0.8);
        assert_eq!(config.engine.prune_min_interviews, 3);
        assert_eq!(config.llm.analyst.model, "local-7b");
        assert_eq!(config.llm.designer.model, "gpt-4o-mini");
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/eidetic.toml");

        let mut config = AppConfig::default();
        config.engine.max_propositions_in_script = 6;
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.engine.max_propositions_in_script, 6);
    }
}
