use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use eidetic_agents::Synthesizer;
use eidetic_config::AppConfig;
use eidetic_llm::{HttpBackend, Oracle};
use eidetic_runtime::{EventBus, IngestOutcome, Pipeline};
use eidetic_store::ProjectStore;
use eidetic_voice::VoiceClient;

#[derive(Debug, Parser)]
#[command(
    name = "eidetic",
    version,
    about = "Autonomous qualitative-research engine: interviews in, causal knowledge out"
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "eidetic.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a project, seed initial propositions, publish script v1.
    Init {
        /// Project identifier.
        project: String,
        /// The research question driving the project.
        #[arg(long)]
        question: String,
        /// Seed angle for the Designer (repeatable).
        #[arg(long = "angle")]
        angles: Vec<String>,
        /// External voice-runtime agent id owned by this project.
        #[arg(long)]
        agent_id: String,
    },
    /// Ingest one finished interview transcript (from --file or stdin).
    Ingest {
        project: String,
        /// External conversation id (the idempotency key).
        #[arg(long)]
        conversation: String,
        #[arg(long)]
        file: Option<PathBuf>,
        /// ISO language code of the interview.
        #[arg(long, default_value = "en")]
        language: String,
    },
    /// Show store counts and the proposition table.
    Status { project: String },
    /// Write the research report to stdout.
    Report { project: String },
    /// Push the current script to the voice runtime again.
    Republish { project: String },
    /// List projects.
    Projects,
    /// Delete a project and all data it owns.
    Delete {
        project: String,
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.telemetry.log_level.clone())),
        )
        .init();

    let store = ProjectStore::new(&config.engine.data_dir);
    let oracle = build_oracle(&config)?;
    let voice = VoiceClient::new(
        config.voice.base_url.clone(),
        std::env::var(&config.voice.api_key_env).ok(),
        config.voice.publish_max_retries,
        Duration::from_secs(config.voice.publish_backoff_secs),
    );
    let bus = Arc::new(EventBus::new());
    let pipeline = Pipeline::new(
        store.clone(),
        oracle.clone(),
        Arc::new(voice),
        bus,
        config.clone(),
    );

    match cli.command {
        Commands::Init {
            project,
            question,
            angles,
            agent_id,
        } => {
            let state = pipeline
                .create_project(&project, &question, angles, &agent_id)
                .await?;
            println!(
                "created project '{project}' with {} propositions, script v1 published",
                state.propositions.len()
            );
        }
        Commands::Ingest {
            project,
            conversation,
            file,
            language,
        } => {
            let transcript = read_transcript(file)?;
            let outcome = pipeline
                .ingest(&project, &conversation, &transcript, &language)
                .await?;
            match outcome {
                IngestOutcome::Duplicate => {
                    println!("conversation '{conversation}' was already processed — nothing to do");
                }
                IngestOutcome::AnalysisFailed {
                    interview_id,
                    detail,
                } => {
                    println!("analysis failed for {interview_id} (transcript kept): {detail}");
                }
                IngestOutcome::Committed {
                    interview_id,
                    script_version,
                    published,
                } => {
                    match script_version {
                        Some(version) => println!(
                            "{interview_id} processed; script v{version} {}",
                            if published { "published" } else { "persisted (publish failed)" }
                        ),
                        None => println!(
                            "{interview_id} processed; previous script stays active"
                        ),
                    }
                }
            }
        }
        Commands::Status { project } => {
            print_status(&store, &project).await?;
        }
        Commands::Report { project } => {
            let state = store.load(&project).await?;
            let synthesizer = Synthesizer::new(oracle, config.llm.synthesizer.clone());
            println!("{}", synthesizer.write_report(&state).await);
        }
        Commands::Republish { project } => {
            if pipeline.republish(&project).await? {
                println!("script republished");
            } else {
                println!("republish failed — see logs");
            }
        }
        Commands::Projects => {
            let ids = store.list().await?;
            if ids.is_empty() {
                println!("no projects yet — run `eidetic init`");
            }
            for id in ids {
                let state = store.load(&id).await?;
                println!(
                    "{id}: \"{}\" — {} interviews, script v{}",
                    state.project.research_question,
                    state.interviews.len(),
                    state.project.current_script_version,
                );
            }
        }
        Commands::Delete { project, yes } => {
            if !yes {
                bail!("refusing to delete '{project}' without --yes");
            }
            pipeline.delete_project(&project).await?;
            println!("deleted project '{project}' and all owned data");
        }
    }

    Ok(())
}

fn build_oracle(config: &AppConfig) -> Result<Oracle> {
    let api_key = std::env::var(&config.llm.api_key_env).ok();
    let backend = HttpBackend::new(
        config.llm.base_url.clone(),
        api_key,
        Duration::from_secs(config.llm.request_timeout_secs),
    )
    .map_err(|err| anyhow::anyhow!("building LLM backend: {err}"))?;
    Ok(Oracle::new(Arc::new(backend), config.llm.format_retries))
}

fn read_transcript(file: Option<PathBuf>) -> Result<String> {
    let transcript = match file {
        Some(path) => fs::read_to_string(&path)
            .with_context(|| format!("reading transcript from {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("reading transcript from stdin")?;
            buffer
        }
    };
    if transcript.trim().is_empty() {
        bail!("transcript is empty");
    }
    Ok(transcript)
}

async fn print_status(store: &ProjectStore, project: &str) -> Result<()> {
    let state = store.load(project).await?;
    println!("project: {project}");
    println!("question: {}", state.project.research_question);
    println!(
        "interviews: {}  evidence: {}  propositions: {}  script: v{}",
        state.interviews.len(),
        state.evidence.len(),
        state.propositions.len(),
        state.project.current_script_version,
    );
    if let Some(script) = state.current_script() {
        println!(
            "mode: {:?}  convergence: {:.2}  novelty: {:.2}",
            script.mode, script.convergence_score, script.novelty_rate,
        );
    }

    println!();
    for p in &state.propositions {
        let merged_note = p
            .merged_into
            .as_deref()
            .map(|target| format!(" → {target}"))
            .unwrap_or_default();
        println!(
            "{} [{:?}{}] conf {:.2} (+{} −{}) {}",
            p.id,
            p.status,
            merged_note,
            p.confidence,
            p.supporting_evidence.len(),
            p.contradicting_evidence.len(),
            p.statement(),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Commands};

    #[test]
    fn parses_init_with_repeated_angles() {
        let cli = Cli::try_parse_from([
            "eidetic", "init", "hackathon",
            "--question", "What is your experience with this hackathon?",
            "--angle", "organization",
            "--angle", "time pressure",
            "--agent-id", "agent_7",
        ])
        .unwrap();
        match cli.command {
            Commands::Init {
                project, angles, ..
            } => {
                assert_eq!(project, "hackathon");
                assert_eq!(angles, vec!["organization", "time pressure"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn delete_requires_explicit_yes_flag() {
        let cli = Cli::try_parse_from(["eidetic", "delete", "p"]).unwrap();
        match cli.command {
            Commands::Delete { yes, .. } => assert!(!yes),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
