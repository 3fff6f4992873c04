//! Checkpoint handler: reader feedback in, the next three-chapter batch out.
//!
//! Feedback at chapter 2/5/8 maps to batch 4-6/7-9/10-12. Batch markers go
//! into progress before any generation so the health sweeper can resume a
//! half-finished batch, and are cleared when the batch parks at the next
//! checkpoint (or completes the book).

use anyhow::{Context, Result};

use crate::editor;
use crate::logbuf::tags;
use crate::retry::{DEFAULT_MAX_RETRIES, retry_step};
use crate::stages::{self, StageCtx};
use crate::store::models::{Checkpoint, ChapterOutline, EditorBrief, Job, JobStatus, TOTAL_CHAPTERS};
use crate::store::{ProgressPatch, Step};

use super::mark_failure;

/// React to persisted feedback at a checkpoint: build an editor brief (may
/// be `None`) and generate the unlocked batch.
pub async fn handle_checkpoint(ctx: &StageCtx, job_id: i64, checkpoint: Checkpoint) -> Result<()> {
    let result = run_batch_for_checkpoint(ctx, job_id, checkpoint).await;
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

async fn run_batch_for_checkpoint(
    ctx: &StageCtx,
    job_id: i64,
    checkpoint: Checkpoint,
) -> Result<()> {
    let job = ctx.db().get_job(job_id)?.context("job not found")?;
    let (start, end) = checkpoint.batch();

    ctx.logs.log(
        job_id,
        &job.title,
        tags::EDITOR,
        &format!(
            "feedback received at {}, generating chapters {}-{}",
            checkpoint.as_str(),
            start,
            end
        ),
    );

    let feedback_history = ctx.db().feedback_for_job(job_id)?;
    let arc = ctx
        .db()
        .latest_arc(job_id)?
        .context("checkpoint handling requires an arc")?;
    let next_outlines: Vec<ChapterOutline> = (start..=end)
        .filter_map(|n| arc.arc.outline(n).cloned())
        .collect();

    let brief = match editor::build_editor_brief(ctx, &job, &feedback_history, &next_outlines).await
    {
        Ok(brief) => brief,
        Err(e) => {
            // The brief is an enhancement; the batch proceeds unrevised.
            tracing::warn!(job_id, error = %e, "editor brief failed, using original outlines");
            None
        }
    };

    ctx.db()
        .update_progress(job_id, &ProgressPatch::new().batch(start, end))?;

    run_batch(ctx, &job, start, end, brief.as_ref()).await
}

/// Generate chapters `start..=end`, then park at the next checkpoint or
/// complete the book. Also the sweeper's re-entry point for a batch whose
/// markers are still set.
pub async fn run_batch(
    ctx: &StageCtx,
    job: &Job,
    start: u8,
    end: u8,
    brief: Option<&EditorBrief>,
) -> Result<()> {
    let first = ctx.db().get_job(job.id)?.context("job not found")?.progress.chapters_generated + 1;
    for n in first.max(start)..=end {
        ctx.db()
            .update_progress(job.id, &ProgressPatch::new().step(Step::GeneratingChapter(n)))?;
        let backoff = ctx.config.step_backoff_secs;
        retry_step(
            &ctx.db,
            &ctx.logs,
            backoff,
            &format!("chapter_{}", n),
            job.id,
            &job.title,
            DEFAULT_MAX_RETRIES,
            |_attempt| {
                let ctx = ctx.clone();
                let job = job.clone();
                async move {
                    stages::run_chapter_stage(&ctx, &job, n, brief)
                        .await
                        .map(|_| ())
                }
            },
        )
        .await?;
        if n < end {
            let delay = ctx.config.chapter.inter_chapter_delay_ms;
            if delay > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }
        }
    }

    match Checkpoint::after_chapters(end) {
        Some(next) => {
            ctx.db().update_progress(
                job.id,
                &ProgressPatch::new()
                    .step(Step::AwaitingFeedback(next))
                    .clear_batch(),
            )?;
            ctx.db().set_job_status(job.id, JobStatus::Active)?;
            ctx.logs.log(
                job.id,
                &job.title,
                tags::DONE,
                &format!("chapters {}-{} complete, awaiting {} feedback", start, end, next.as_str()),
            );
        }
        None => {
            debug_assert_eq!(end, TOTAL_CHAPTERS);
            ctx.db().update_progress(
                job.id,
                &ProgressPatch::new().step(Step::Completed).clear_batch(),
            )?;
            ctx.db().set_job_status(job.id, JobStatus::Completed)?;
            ctx.logs.log(job.id, &job.title, tags::DONE, "all twelve chapters complete");
            ctx.logs.free(job.id);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::review::CRITERIA;
    use crate::stages::testctx::{make_job, scripted};
    use crate::store::models::{CharacterSignal, CheckpointFeedback, PacingSignal, ToneSignal};
    use crate::store::testutil::{sample_arc, sample_bible, sample_draft};

    fn chapter_response(n: u8) -> String {
        serde_json::json!({
            "chapter": {
                "title": format!("Chapter {}", n),
                "content": "Clean prose, onward.",
                "opening_hook": "in",
                "closing_hook": "out",
                "key_events": ["event"],
                "character_development": "growth"
            }
        })
        .to_string()
    }

    fn review_response(score: f64) -> String {
        let mut obj = serde_json::Map::new();
        for (name, _) in CRITERIA {
            obj.insert(name.to_string(), serde_json::json!({"score": score, "evidence": "q"}));
        }
        serde_json::Value::Object(obj).to_string()
    }

    fn quiet_ctx(ctx: &StageCtx) -> StageCtx {
        let mut config = ctx.config.clone();
        config.features.character_ledger = false;
        config.features.entity_validation = false;
        config.features.voice_review = false;
        StageCtx::new(ctx.db.clone(), ctx.client.clone(), ctx.logs.clone(), config)
    }

    fn seed_through_chapter(ctx: &StageCtx, job_id: i64, chapters: u8) {
        let db = ctx.db();
        db.insert_bible(job_id, &sample_bible()).unwrap();
        let arc = db.insert_arc(job_id, 1, &sample_arc(12)).unwrap();
        for n in 1..=chapters {
            db.insert_chapter(job_id, arc.id, &sample_draft(n)).unwrap();
        }
        db.update_progress(
            job_id,
            &ProgressPatch::new()
                .bible_complete(true)
                .arc_complete(true)
                .chapters_generated(chapters),
        )
        .unwrap();
    }

    fn neutral_feedback(job_id: i64, checkpoint: Checkpoint) -> CheckpointFeedback {
        CheckpointFeedback {
            id: 0,
            job_id,
            checkpoint,
            pacing: PacingSignal::Hooked,
            tone: ToneSignal::Right,
            character: CharacterSignal::Love,
            reader_quotes: vec![],
            transcript: None,
            created_at: String::new(),
        }
    }

    #[tokio::test]
    async fn test_chapter_2_feedback_generates_batch_and_parks_at_next() {
        let (ctx, api) = scripted();
        let ctx = quiet_ctx(&ctx);
        let job = make_job(&ctx);
        seed_through_chapter(&ctx, job.id, 3);
        ctx.db()
            .insert_feedback(&neutral_feedback(job.id, Checkpoint::Chapter2))
            .unwrap();

        // Neutral feedback: no editor call; three chapters, each with review.
        for n in 4..=6 {
            api.push_ok(&chapter_response(n));
            api.push_ok(&review_response(8.0));
        }

        handle_checkpoint(&ctx, job.id, Checkpoint::Chapter2).await.unwrap();

        let reloaded = ctx.db().get_job(job.id).unwrap().unwrap();
        assert_eq!(reloaded.progress.chapters_generated, 6);
        assert_eq!(
            reloaded.progress.current_step,
            Step::AwaitingFeedback(Checkpoint::Chapter5)
        );
        assert_eq!(reloaded.progress.batch(), None);
        assert_eq!(ctx.db().chapter_count(job.id).unwrap(), 6);
    }

    #[tokio::test]
    async fn test_chapter_8_feedback_completes_the_book() {
        let (ctx, api) = scripted();
        let ctx = quiet_ctx(&ctx);
        let job = make_job(&ctx);
        seed_through_chapter(&ctx, job.id, 9);
        ctx.db()
            .insert_feedback(&neutral_feedback(job.id, Checkpoint::Chapter8))
            .unwrap();

        for n in 10..=12 {
            api.push_ok(&chapter_response(n));
            api.push_ok(&review_response(8.0));
        }

        handle_checkpoint(&ctx, job.id, Checkpoint::Chapter8).await.unwrap();

        let reloaded = ctx.db().get_job(job.id).unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Completed);
        assert_eq!(reloaded.progress.current_step, Step::Completed);
        assert_eq!(reloaded.progress.chapters_generated, 12);
        assert!(ctx.logs.snapshot(job.id).is_empty());
    }

    #[tokio::test]
    async fn test_editor_brief_failure_falls_back_to_original_outlines() {
        let (ctx, api) = scripted();
        let ctx = quiet_ctx(&ctx);
        let job = make_job(&ctx);
        seed_through_chapter(&ctx, job.id, 3);
        let mut fb = neutral_feedback(job.id, Checkpoint::Chapter2);
        fb.pacing = PacingSignal::Slow;
        ctx.db().insert_feedback(&fb).unwrap();

        // Editor call fails hard; batch proceeds unrevised.
        api.push_err(crate::errors::ModelError::permanent("editor down"));
        for n in 4..=6 {
            api.push_ok(&chapter_response(n));
            api.push_ok(&review_response(8.0));
        }

        handle_checkpoint(&ctx, job.id, Checkpoint::Chapter2).await.unwrap();
        assert_eq!(ctx.db().chapter_count(job.id).unwrap(), 6);
    }

    #[tokio::test]
    async fn test_batch_resume_skips_already_generated_chapters() {
        let (ctx, api) = scripted();
        let ctx = quiet_ctx(&ctx);
        let job = make_job(&ctx);
        // Crashed mid-batch: chapters 4 and 5 exist, markers still set.
        seed_through_chapter(&ctx, job.id, 5);
        ctx.db()
            .update_progress(job.id, &ProgressPatch::new().batch(4, 6))
            .unwrap();
        let job = ctx.db().get_job(job.id).unwrap().unwrap();

        api.push_ok(&chapter_response(6));
        api.push_ok(&review_response(8.0));

        run_batch(&ctx, &job, 4, 6, None).await.unwrap();
        assert_eq!(api.calls(), 2);

        let reloaded = ctx.db().get_job(job.id).unwrap().unwrap();
        assert_eq!(reloaded.progress.chapters_generated, 6);
        assert_eq!(
            reloaded.progress.current_step,
            Step::AwaitingFeedback(Checkpoint::Chapter5)
        );
    }

    #[tokio::test]
    async fn test_batch_failure_keeps_markers_for_sweeper() {
        let (ctx, api) = scripted();
        let ctx = quiet_ctx(&ctx);
        let job = make_job(&ctx);
        seed_through_chapter(&ctx, job.id, 3);
        ctx.db()
            .insert_feedback(&neutral_feedback(job.id, Checkpoint::Chapter2))
            .unwrap();

        // Chapter 4 fails all attempts with distinct errors.
        for i in 0..3 {
            api.push_err(crate::errors::ModelError::permanent(format!("failure {}", i)));
        }

        let err = handle_checkpoint(&ctx, job.id, Checkpoint::Chapter2).await.unwrap_err();
        assert!(err.to_string().contains("failure"));

        let reloaded = ctx.db().get_job(job.id).unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Error);
        assert_eq!(reloaded.progress.batch(), Some((4, 6)));
        assert!(reloaded.progress.recovery_started.is_none());
    }
}
