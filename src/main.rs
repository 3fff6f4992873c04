//! storyforge CLI: create and drive story jobs, submit checkpoint
//! feedback, and run the health sweeper.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use storyforge::config::StoryConfig;
use storyforge::model::AnthropicApi;
use storyforge::store::models::{
    CharacterSignal, Checkpoint, CheckpointFeedback, PacingSignal, ReaderProfile, ToneSignal,
};
use storyforge::StoryEngine;

#[derive(Parser)]
#[command(name = "storyforge", about = "Durable twelve-chapter story orchestrator")]
struct Cli {
    /// SQLite database path.
    #[arg(long, default_value = "storyforge.db", global = true)]
    db: PathBuf,

    /// Configuration file path.
    #[arg(long, default_value = "storyforge.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a job from a selected premise and run the initial chapters.
    Create {
        #[arg(long)]
        owner: String,
        /// Reference to the selected premise.
        #[arg(long)]
        premise: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        genre: Option<String>,
        /// Reader profile as a JSON file.
        #[arg(long)]
        profile: Option<PathBuf>,
    },
    /// Resume an existing job's pipeline from its recorded progress.
    Resume {
        job_id: i64,
    },
    /// Record checkpoint feedback and generate the next batch.
    Feedback {
        job_id: i64,
        #[arg(long, value_enum)]
        checkpoint: CheckpointArg,
        #[arg(long, value_enum, default_value = "hooked")]
        pacing: PacingArg,
        #[arg(long, value_enum, default_value = "right")]
        tone: ToneArg,
        #[arg(long, value_enum, default_value = "love")]
        character: CharacterArg,
        /// Verbatim reader quotes (repeatable).
        #[arg(long = "quote")]
        quotes: Vec<String>,
    },
    /// Run one health-sweeper pass and exit.
    Sweep,
    /// Run the periodic health sweeper until interrupted.
    Serve,
    /// Show a job's progress and spend.
    Status {
        job_id: i64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum CheckpointArg {
    Chapter2,
    Chapter5,
    Chapter8,
}

impl From<CheckpointArg> for Checkpoint {
    fn from(value: CheckpointArg) -> Self {
        match value {
            CheckpointArg::Chapter2 => Checkpoint::Chapter2,
            CheckpointArg::Chapter5 => Checkpoint::Chapter5,
            CheckpointArg::Chapter8 => Checkpoint::Chapter8,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PacingArg {
    Hooked,
    Slow,
    Fast,
}

impl From<PacingArg> for PacingSignal {
    fn from(value: PacingArg) -> Self {
        match value {
            PacingArg::Hooked => PacingSignal::Hooked,
            PacingArg::Slow => PacingSignal::Slow,
            PacingArg::Fast => PacingSignal::Fast,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ToneArg {
    Right,
    Serious,
    Light,
}

impl From<ToneArg> for ToneSignal {
    fn from(value: ToneArg) -> Self {
        match value {
            ToneArg::Right => ToneSignal::Right,
            ToneArg::Serious => ToneSignal::Serious,
            ToneArg::Light => ToneSignal::Light,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum CharacterArg {
    Love,
    Warming,
    NotClicking,
}

impl From<CharacterArg> for CharacterSignal {
    fn from(value: CharacterArg) -> Self {
        match value {
            CharacterArg::Love => CharacterSignal::Love,
            CharacterArg::Warming => CharacterSignal::Warming,
            CharacterArg::NotClicking => CharacterSignal::NotClicking,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("storyforge=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = StoryConfig::load(&cli.config)?;
    let api = Arc::new(AnthropicApi::from_env().map_err(|e| anyhow::anyhow!("{}", e))?);
    let mut engine = StoryEngine::open(&cli.db, api, config)?;

    match cli.command {
        Command::Create {
            owner,
            premise,
            title,
            genre,
            profile,
        } => {
            let profile = match profile {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read profile: {}", path.display()))?;
                    serde_json::from_str(&raw).context("Failed to parse reader profile JSON")?
                }
                None => ReaderProfile::default(),
            };
            let job = engine.create_job(&owner, &premise, &title, genre.as_deref(), &profile)?;
            println!("created job {}", job.id);
            engine.run_pipeline(job.id).await?;
            println!("{}", engine.status_line(job.id)?);
        }
        Command::Resume { job_id } => {
            engine.run_pipeline(job_id).await?;
            println!("{}", engine.status_line(job_id)?);
        }
        Command::Feedback {
            job_id,
            checkpoint,
            pacing,
            tone,
            character,
            quotes,
        } => {
            engine
                .submit_feedback(&CheckpointFeedback {
                    id: 0,
                    job_id,
                    checkpoint: checkpoint.into(),
                    pacing: pacing.into(),
                    tone: tone.into(),
                    character: character.into(),
                    reader_quotes: quotes,
                    transcript: None,
                    created_at: String::new(),
                })
                .await?;
            println!("{}", engine.status_line(job_id)?);
        }
        Command::Sweep => {
            let stats = engine.sweep_once().await?;
            println!(
                "examined {} | recovered {} | drift corrected {} | quarantined {} | locked {}",
                stats.examined,
                stats.recovered,
                stats.drift_corrected,
                stats.quarantined,
                stats.skipped_locked
            );
        }
        Command::Serve => {
            engine.start_sweeper();
            println!("health sweeper running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("Failed to wait for ctrl-c")?;
            engine.shutdown();
        }
        Command::Status { job_id } => {
            println!("{}", engine.status_line(job_id)?);
        }
    }

    Ok(())
}
