//! The orchestrator object: owns the store handle, the model client, the
//! per-job log buffers, and every background task, with an explicit
//! teardown so timers never hold the process open.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::StoryConfig;
use crate::cover;
use crate::health::{HealthSweeper, SweepStats};
use crate::logbuf::LogBuffers;
use crate::model::{ModelApi, ModelClient};
use crate::pipeline;
use crate::stages::StageCtx;
use crate::store::models::{CheckpointFeedback, CostSummary, Job, ReaderProfile};
use crate::store::{self, StoryDb};

pub struct StoryEngine {
    ctx: StageCtx,
    purger: tokio::task::JoinHandle<()>,
    sweeper: Option<tokio::task::JoinHandle<()>>,
}

impl StoryEngine {
    /// Wire up the engine against a SQLite file and a model API.
    pub fn open(db_path: &Path, api: Arc<dyn ModelApi>, config: StoryConfig) -> Result<Self> {
        let db = store::shared(StoryDb::new(db_path)?);
        Ok(Self::from_parts(db, api, config))
    }

    pub fn from_parts(
        db: store::SharedDb,
        api: Arc<dyn ModelApi>,
        config: StoryConfig,
    ) -> Self {
        let logs = LogBuffers::new();
        let client = Arc::new(ModelClient::new(api, db.clone(), logs.clone(), &config));
        let ctx = StageCtx::new(db, client, logs.clone(), config);
        let purger = logs.spawn_purger();
        Self {
            ctx,
            purger,
            sweeper: None,
        }
    }

    pub fn ctx(&self) -> &StageCtx {
        &self.ctx
    }

    /// Create the job row the moment the premise is selected — before the
    /// first model call, so a duplicate selection can't race in.
    pub fn create_job(
        &self,
        owner: &str,
        premise_ref: &str,
        title: &str,
        genre: Option<&str>,
        profile: &ReaderProfile,
    ) -> Result<Job> {
        self.ctx
            .db()
            .create_job(owner, premise_ref, title, genre, profile)
    }

    /// Drive the bible → arc → chapters 1-3 chain for a job.
    pub async fn run_pipeline(&self, job_id: i64) -> Result<()> {
        pipeline::run(&self.ctx, job_id).await
    }

    /// Persist reader feedback and trigger the next batch.
    pub async fn submit_feedback(&self, feedback: &CheckpointFeedback) -> Result<()> {
        let stored = self.ctx.db().insert_feedback(feedback)?;
        pipeline::handle_checkpoint(&self.ctx, stored.job_id, stored.checkpoint).await
    }

    /// One health-sweeper pass, on demand.
    pub async fn sweep_once(&self) -> Result<SweepStats> {
        HealthSweeper::new(self.ctx.clone()).run_once().await
    }

    /// Start the periodic sweeper (first pass immediately).
    pub fn start_sweeper(&mut self) {
        if self.sweeper.is_none() {
            self.sweeper = Some(HealthSweeper::new(self.ctx.clone()).spawn());
        }
    }

    pub fn job(&self, job_id: i64) -> Result<Option<Job>> {
        self.ctx.db().get_job(job_id)
    }

    pub fn cost_summary(&self, job_id: i64) -> Result<CostSummary> {
        self.ctx.db().cost_summary(job_id)
    }

    /// Cancel every background task: the purge timer, the sweeper loop,
    /// and any in-flight cover generation.
    pub fn shutdown(&mut self) {
        self.purger.abort();
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
        cover::abort_all(&self.ctx.covers);
    }
}

impl Drop for StoryEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl StoryEngine {
    /// Convenience for operators: load a job and render a one-screen
    /// status summary.
    pub fn status_line(&self, job_id: i64) -> Result<String> {
        let job = self
            .ctx
            .db()
            .get_job(job_id)?
            .context("job not found")?;
        let costs = self.cost_summary(job_id)?;
        let mut out = format!(
            "#{} \"{}\" [{}] step={} chapters={}/12",
            job.id,
            job.title,
            job.status.as_str(),
            job.progress.current_step,
            job.progress.chapters_generated,
        );
        if let Some(ref err) = job.progress.last_error {
            out.push_str(&format!("\n  last error: {}", err));
        }
        if !job.progress.error_logs.is_empty() {
            out.push_str(&format!(
                "\n  error log tail ({} lines):",
                job.progress.error_logs.len()
            ));
            for line in job.progress.error_logs.iter().rev().take(5).rev() {
                out.push_str(&format!("\n    {}", line));
            }
        }
        out.push_str(&format!(
            "\n  spend: ${:.4} over {} calls ({} in / {} out tokens)",
            costs.total_cost, costs.calls, costs.total_input_tokens, costs.total_output_tokens
        ));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testing::ScriptedApi;
    use crate::stages::review::CRITERIA;
    use crate::store::models::{
        CharacterSignal, Checkpoint, JobStatus, PacingSignal, ToneSignal,
    };
    use crate::store::{ProgressPatch, Step};
    use crate::store::testutil::{sample_arc, sample_bible, sample_draft};

    fn engine() -> (StoryEngine, Arc<ScriptedApi>) {
        let api = Arc::new(ScriptedApi::new());
        let db = store::shared(StoryDb::new_in_memory().unwrap());
        let mut config = StoryConfig::for_tests();
        config.features.character_ledger = false;
        config.features.entity_validation = false;
        config.features.voice_review = false;
        let engine = StoryEngine::from_parts(db, api.clone(), config);
        (engine, api)
    }

    fn review_response(score: f64) -> String {
        let mut obj = serde_json::Map::new();
        for (name, _) in CRITERIA {
            obj.insert(name.to_string(), serde_json::json!({"score": score, "evidence": "q"}));
        }
        serde_json::Value::Object(obj).to_string()
    }

    fn chapter_response(n: u8) -> String {
        serde_json::json!({
            "chapter": {
                "title": format!("Chapter {}", n),
                "content": "Prose.",
                "opening_hook": "in",
                "closing_hook": "out",
                "key_events": ["event"],
                "character_development": "growth"
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_create_job_precedes_model_calls() {
        let (engine, api) = engine();
        let job = engine
            .create_job("reader", "premise-1", "T", None, &ReaderProfile::default())
            .unwrap();
        assert!(job.id > 0);
        assert_eq!(api.calls(), 0);
        assert_eq!(job.progress.current_step, Step::GeneratingBible);
    }

    #[tokio::test]
    async fn test_end_to_end_initial_leg_then_feedback_batch() {
        let (engine, api) = engine();
        let job = engine
            .create_job("reader", "premise-1", "T", None, &ReaderProfile::default())
            .unwrap();

        api.push_ok(&serde_json::to_string(&sample_bible()).unwrap());
        api.push_ok(&serde_json::to_string(&sample_arc(12)).unwrap());
        for n in 1..=3 {
            api.push_ok(&chapter_response(n));
            api.push_ok(&review_response(8.0));
        }
        engine.run_pipeline(job.id).await.unwrap();

        for n in 4..=6 {
            api.push_ok(&chapter_response(n));
            api.push_ok(&review_response(8.0));
        }
        engine
            .submit_feedback(&CheckpointFeedback {
                id: 0,
                job_id: job.id,
                checkpoint: Checkpoint::Chapter2,
                pacing: PacingSignal::Hooked,
                tone: ToneSignal::Right,
                character: CharacterSignal::Love,
                reader_quotes: vec![],
                transcript: None,
                created_at: String::new(),
            })
            .await
            .unwrap();

        let reloaded = engine.job(job.id).unwrap().unwrap();
        assert_eq!(reloaded.progress.chapters_generated, 6);
        assert_eq!(
            reloaded.progress.current_step,
            Step::AwaitingFeedback(Checkpoint::Chapter5)
        );
        let costs = engine.cost_summary(job.id).unwrap();
        assert_eq!(costs.calls as usize, api.calls());
    }

    #[tokio::test]
    async fn test_status_line_shows_error_tail() {
        let (engine, _api) = engine();
        let job = engine
            .create_job("reader", "p", "T", None, &ReaderProfile::default())
            .unwrap();
        engine.ctx().db().set_job_status(job.id, JobStatus::Error).unwrap();
        engine
            .ctx()
            .db()
            .update_progress(
                job.id,
                &ProgressPatch::new()
                    .error("it broke")
                    .error_logs(vec!["line one".into(), "line two".into()]),
            )
            .unwrap();

        let line = engine.status_line(job.id).unwrap();
        assert!(line.contains("[error]"));
        assert!(line.contains("it broke"));
        assert!(line.contains("line two"));
    }

    #[tokio::test]
    async fn test_shutdown_aborts_background_tasks() {
        let (mut engine, _api) = engine();
        engine.start_sweeper();
        let job = engine
            .create_job("o", "p", "T", None, &ReaderProfile::default())
            .unwrap();
        engine.ctx().db().insert_bible(job.id, &sample_bible()).unwrap();
        engine.shutdown();
        assert!(engine.sweeper.is_none());
    }

    #[tokio::test]
    async fn test_drift_visible_through_engine_sweep() {
        let (engine, api) = engine();
        let job = engine
            .create_job("reader", "p", "T", None, &ReaderProfile::default())
            .unwrap();
        {
            let db = engine.ctx().db();
            db.insert_bible(job.id, &sample_bible()).unwrap();
            let arc = db.insert_arc(job.id, 1, &sample_arc(12)).unwrap();
            for n in 1..=6 {
                db.insert_chapter(job.id, arc.id, &sample_draft(n)).unwrap();
            }
            db.set_job_status(job.id, JobStatus::Error).unwrap();
            db.update_progress(
                job.id,
                &ProgressPatch::new()
                    .bible_complete(true)
                    .arc_complete(true)
                    .chapters_generated(5)
                    .step(Step::GeneratingChapter(6))
                    .error("crash"),
            )
            .unwrap();
        }

        let stats = engine.sweep_once().await.unwrap();
        assert_eq!(stats.drift_corrected, 1);
        assert_eq!(api.calls(), 0);
    }
}
