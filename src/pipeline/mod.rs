//! Linear pipeline: bible → arc → chapters 1-3, resumable from progress.
//!
//! `run` is re-entrant: it reloads progress, corrects it against what's
//! actually persisted (the stages' idempotence guards do the artifact-level
//! checks), and only generates what's missing. The error scope at the top
//! owns status transitions; stages below it raise.

pub mod checkpoint;

use anyhow::{Context, Result};

use crate::cover;
use crate::logbuf::tags;
use crate::retry::{DEFAULT_MAX_RETRIES, retry_step};
use crate::stages::{self, StageCtx};
use crate::store::models::{Checkpoint, Job, JobStatus};
use crate::store::{ProgressPatch, Step};

pub use checkpoint::handle_checkpoint;

/// Run the initial chain for a job, resuming wherever progress left off.
pub async fn run(ctx: &StageCtx, job_id: i64) -> Result<()> {
    let result = run_inner(ctx, job_id).await;
    match result {
        Ok(()) => {
            ctx.db().clear_recovery_lock(job_id)?;
            Ok(())
        }
        Err(err) => {
            mark_failure(ctx, job_id, &err);
            Err(err)
        }
    }
}

/// Shared failure scope for pipeline-shaped work: set error status once,
/// freeze the log tail, and always release the recovery lock.
pub(crate) fn mark_failure(ctx: &StageCtx, job_id: i64, err: &anyhow::Error) {
    let apply = || -> Result<()> {
        let db = ctx.db();
        let job = db.get_job(job_id)?.context("job vanished in failure scope")?;
        if job.status != JobStatus::Error {
            db.set_job_status(job_id, JobStatus::Error)?;
            db.update_progress(
                job_id,
                &ProgressPatch::new()
                    .step(Step::GenerationFailed)
                    .error(format!("{:#}", err))
                    .error_logs(ctx.logs.snapshot(job_id)),
            )?;
        }
        db.clear_recovery_lock(job_id)?;
        Ok(())
    };
    if let Err(scope_err) = apply() {
        tracing::error!(job_id, error = %scope_err, "failed to persist pipeline failure state");
    }
}

async fn run_inner(ctx: &StageCtx, job_id: i64) -> Result<()> {
    let job = ctx.db().get_job(job_id)?.context("job not found")?;

    if !job.progress.bible_complete {
        run_stage_with_retry(ctx, &job, "bible", |ctx, job| async move {
            stages::run_bible_stage(&ctx, &job).await.map(|_| ())
        })
        .await?;
    }

    // A bible exists from here on; the cover task can use it.
    let job = ctx.db().get_job(job_id)?.context("job not found")?;
    cover::maybe_spawn(ctx, &job);

    if !job.progress.arc_complete {
        ctx.db()
            .update_progress(job_id, &ProgressPatch::new().step(Step::GeneratingArc))?;
        run_stage_with_retry(ctx, &job, "arc", |ctx, job| async move {
            stages::run_arc_stage(&ctx, &job).await.map(|_| ())
        })
        .await?;
    }

    let job = ctx.db().get_job(job_id)?.context("job not found")?;
    let start = job.progress.chapters_generated + 1;
    for n in start..=3 {
        ctx.db()
            .update_progress(job_id, &ProgressPatch::new().step(Step::GeneratingChapter(n)))?;
        run_stage_with_retry(ctx, &job, &format!("chapter_{}", n), move |ctx, job| async move {
            stages::run_chapter_stage(&ctx, &job, n, None).await.map(|_| ())
        })
        .await?;
        if n < 3 {
            let delay = ctx.config.chapter.inter_chapter_delay_ms;
            if delay > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }
        }
    }

    // Only the initial leg parks at the first checkpoint; a job resumed
    // past chapter 3 keeps whatever step its batch logic set.
    let progress = ctx.db().get_job(job_id)?.context("job not found")?.progress;
    if progress.chapters_generated == 3 {
        ctx.db().update_progress(
            job_id,
            &ProgressPatch::new().step(Step::AwaitingFeedback(Checkpoint::Chapter2)),
        )?;
        ctx.db().set_job_status(job_id, JobStatus::Active)?;
        ctx.logs.log(
            job_id,
            &job.title,
            tags::DONE,
            "initial chapters complete, awaiting chapter 2 feedback",
        );
        ctx.logs.free(job_id);
    }
    Ok(())
}

/// Route a stage through the step-retry wrapper with this job's identity.
async fn run_stage_with_retry<F, Fut>(
    ctx: &StageCtx,
    job: &Job,
    name: &str,
    stage: F,
) -> Result<()>
where
    F: Fn(StageCtx, Job) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let backoff = ctx.config.step_backoff_secs;
    retry_step(
        &ctx.db,
        &ctx.logs,
        backoff,
        name,
        job.id,
        &job.title,
        DEFAULT_MAX_RETRIES,
        |_attempt| stage(ctx.clone(), job.clone()),
    )
    .await
}
