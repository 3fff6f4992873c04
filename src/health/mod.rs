//! Self-healing health sweeper.
//!
//! A periodic pass over active-but-stale and errored jobs. Transient
//! upstream failures retry forever; anything else gets two sweeper retries
//! before quarantine. The recovery lock (a lease timestamp in progress)
//! keeps two passes from reviving the same job, and state drift between
//! persisted chapters and the progress record is corrected before any
//! generation is considered. Passes run strictly one at a time.

use anyhow::{Context, Result};
use chrono::Utc;

use crate::logbuf::tags;
use crate::model::is_transient_message;
use crate::pipeline::{self, checkpoint};
use crate::stages::StageCtx;
use crate::store::models::{Checkpoint, Job, JobStatus, TOTAL_CHAPTERS};
use crate::store::{ProgressPatch, Step};

/// Outcome counters for one sweep, for logs and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepStats {
    pub examined: usize,
    pub recovered: usize,
    pub drift_corrected: usize,
    pub quarantined: usize,
    pub skipped_locked: usize,
}

pub struct HealthSweeper {
    ctx: StageCtx,
}

impl HealthSweeper {
    pub fn new(ctx: StageCtx) -> Self {
        Self { ctx }
    }

    /// Spawn the periodic loop: one pass immediately, then one per
    /// configured interval. Passes never overlap — the next tick waits for
    /// the previous pass to finish.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        let interval_secs = self.ctx.config.health_check.interval_secs;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
            loop {
                interval.tick().await;
                match self.run_once().await {
                    Ok(stats) if stats.examined > 0 => {
                        tracing::info!(
                            examined = stats.examined,
                            recovered = stats.recovered,
                            drift_corrected = stats.drift_corrected,
                            quarantined = stats.quarantined,
                            "health sweep complete"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "health sweep failed"),
                }
            }
        })
    }

    /// One serial pass over every sweepable job.
    pub async fn run_once(&self) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        let now = Utc::now();
        let candidates = self.ctx.db().sweep_candidates()?;

        for job in candidates {
            stats.examined += 1;
            if let Err(e) = self.sweep_job(job, now, &mut stats).await {
                tracing::error!(error = %e, "sweeping job failed");
            }
        }
        Ok(stats)
    }

    async fn sweep_job(
        &self,
        mut job: Job,
        now: chrono::DateTime<Utc>,
        stats: &mut SweepStats,
    ) -> Result<()> {
        let health = &self.ctx.config.health_check;

        // Orphan repair: rewrite legacy chapter_N_complete tags left by
        // older writers before judging anything else.
        if let Step::ChapterComplete(n) = job.progress.current_step {
            let step = if n >= TOTAL_CHAPTERS {
                Step::Completed
            } else {
                match Checkpoint::after_chapters(n) {
                    Some(cp) => Step::AwaitingFeedback(cp),
                    None => Step::GeneratingChapter(n + 1),
                }
            };
            let progress = self
                .ctx
                .db()
                .update_progress(job.id, &ProgressPatch::new().step(step))?;
            if step == Step::Completed {
                self.ctx.db().set_job_status(job.id, JobStatus::Completed)?;
                return Ok(());
            }
            job.progress = progress;
        }

        // Terminal states are absorbing.
        if job.progress.current_step.is_terminal() {
            return Ok(());
        }

        // Eligibility: errored, or active and stale.
        let stalled = job.progress.staleness_secs(now) > health.stall_threshold_secs;
        if job.status == JobStatus::Active {
            if !stalled {
                return Ok(());
            }
            if !job.progress.current_step.is_recoverable() {
                return Ok(());
            }
        }

        // Lock check: someone is already on it.
        if job.progress.lock_held(now, health.lock_duration_secs) {
            stats.skipped_locked += 1;
            return Ok(());
        }

        // Retry gate: transient errors retry forever; code bugs are capped.
        if let Some(ref last_error) = job.progress.last_error {
            if !is_transient_message(last_error)
                && job.progress.health_check_retries >= health.code_error_retry_cap
            {
                self.ctx.logs.log(
                    job.id,
                    &job.title,
                    tags::HEALTH,
                    &format!(
                        "non-transient error hit retry cap ({}), quarantining: {}",
                        health.code_error_retry_cap, last_error
                    ),
                );
                self.ctx
                    .db()
                    .update_progress(job.id, &ProgressPatch::new().step(Step::PermanentlyFailed))?;
                stats.quarantined += 1;
                return Ok(());
            }
        }

        // State-drift correction before any recovery: trust the chapter
        // rows, never regenerate what already exists.
        let actual = self.ctx.db().chapter_count(job.id)?;
        if actual > job.progress.chapters_generated {
            let mut patch = ProgressPatch::new()
                .chapters_generated(actual)
                .health_check_retries(0)
                .release_lock();
            let parked = if actual >= TOTAL_CHAPTERS {
                patch = patch.step(Step::Completed);
                self.ctx.db().set_job_status(job.id, JobStatus::Completed)?;
                true
            } else if let Some(cp) = Checkpoint::after_chapters(actual) {
                patch = patch.step(Step::AwaitingFeedback(cp));
                true
            } else {
                false
            };
            let progress = self.ctx.db().update_progress(job.id, &patch)?;
            self.ctx.logs.log(
                job.id,
                &job.title,
                tags::HEALTH,
                &format!(
                    "progress drift corrected: {} chapter rows on disk",
                    actual
                ),
            );
            stats.drift_corrected += 1;
            if parked {
                if job.status != JobStatus::Active && actual < TOTAL_CHAPTERS {
                    self.ctx.db().set_job_status(job.id, JobStatus::Active)?;
                }
                return Ok(());
            }
            job.progress = progress;
        }

        // Acquire the lease, count the recovery, reset visible error state.
        let retries = job.progress.health_check_retries + 1;
        self.ctx.db().update_progress(
            job.id,
            &ProgressPatch::new()
                .acquire_lock(now)
                .health_check_retries(retries)
                .clear_error(),
        )?;
        self.ctx.db().set_job_status(job.id, JobStatus::Active)?;
        self.ctx.logs.log(
            job.id,
            &job.title,
            tags::HEALTH,
            &format!(
                "recovering from '{}' [sweep retry {}]",
                job.progress.current_step, retries
            ),
        );

        self.dispatch(&job).await?;
        stats.recovered += 1;
        Ok(())
    }

    /// Route the job back into the right entry point. Dispatched work
    /// releases the recovery lock on its own exit path, success or failure.
    async fn dispatch(&self, job: &Job) -> Result<()> {
        let (has_bible, has_arc, chapters) = {
            let db = self.ctx.db();
            (
                db.get_bible(job.id)?.is_some(),
                db.latest_arc(job.id)?.is_some(),
                db.chapter_count(job.id)?,
            )
        };

        if !has_bible || !has_arc || chapters < 3 {
            let _ = pipeline::run(&self.ctx, job.id).await;
            return Ok(());
        }

        if let Some((start, end)) = job.progress.batch() {
            self.resume_batch(job.id, start, end).await;
            return Ok(());
        }

        if matches!(chapters, 3 | 6 | 9) {
            // Race-condition guard: this is either a finished batch whose
            // awaiting state never landed, or feedback arrived mid-crash.
            let checkpoint_due =
                Checkpoint::after_chapters(chapters).context("boundary chapter count")?;
            if self.ctx.db().has_feedback(job.id, checkpoint_due)? {
                let _ = checkpoint::handle_checkpoint(&self.ctx, job.id, checkpoint_due).await;
            } else {
                self.ctx.db().update_progress(
                    job.id,
                    &ProgressPatch::new()
                        .step(Step::AwaitingFeedback(checkpoint_due))
                        .release_lock(),
                )?;
                self.ctx.logs.log(
                    job.id,
                    &job.title,
                    tags::HEALTH,
                    "batch already finished, parking at its checkpoint",
                );
            }
            return Ok(());
        }

        if chapters >= TOTAL_CHAPTERS {
            self.ctx.db().update_progress(
                job.id,
                &ProgressPatch::new().step(Step::Completed).release_lock(),
            )?;
            self.ctx.db().set_job_status(job.id, JobStatus::Completed)?;
            return Ok(());
        }

        // Mid-batch crash with markers lost: infer the batch from the
        // chapter count and resume it without a brief.
        let start = (chapters / 3) * 3 + 1;
        let end = start + 2;
        self.ctx
            .db()
            .update_progress(job.id, &ProgressPatch::new().batch(start, end))?;
        self.resume_batch(job.id, start, end).await;
        Ok(())
    }

    /// Re-enter a half-finished batch, owning the lock's exit path.
    async fn resume_batch(&self, job_id: i64, start: u8, end: u8) {
        let fresh = match self.ctx.db().get_job(job_id) {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(job_id, error = %e, "failed to reload job for batch resume");
                return;
            }
        };
        match checkpoint::run_batch(&self.ctx, &fresh, start, end, None).await {
            Ok(()) => {
                if let Err(e) = self.ctx.db().clear_recovery_lock(job_id) {
                    tracing::error!(job_id, error = %e, "failed to release recovery lock");
                }
            }
            Err(e) => pipeline::mark_failure(&self.ctx, job_id, &e),
        }
    }
}
