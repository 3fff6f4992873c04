//! Arc stage: bible in, twelve ordered chapter outlines out.

use anyhow::{Context, Result, bail};

use crate::gate;
use crate::logbuf::tags;
use crate::model::{CallMeta, ChatMessage};
use crate::prompts;
use crate::store::models::{ArcRecord, Job, StoryArc, TOTAL_CHAPTERS};
use crate::store::{ProgressPatch, Step};

use super::StageCtx;

const ARC_MAX_TOKENS: u32 = 8192;
const ARC_REQUIRED_FIELDS: &[&str] = &["chapters", "pacing_notes", "subplot_threads"];

/// Generate and persist the job's twelve-chapter arc. Idempotent on
/// (job, arc number 1): an existing arc advances progress and is returned
/// without a model call.
pub async fn run_arc_stage(ctx: &StageCtx, job: &Job) -> Result<ArcRecord> {
    let existing_arc = ctx.db().latest_arc(job.id)?;
    if let Some(existing) = existing_arc {
        ctx.logs.log(
            job.id,
            &job.title,
            tags::ARC,
            "arc already exists, advancing progress",
        );
        ctx.db()
            .update_progress(job.id, &ProgressPatch::new().arc_complete(true).step(Step::ArcCreated))?;
        return Ok(existing);
    }

    let bible = ctx
        .db()
        .get_bible(job.id)?
        .context("arc stage requires a bible")?;

    ctx.logs
        .log(job.id, &job.title, tags::ARC, "outlining twelve chapters");

    let prompt = prompts::arc_prompt(&job.title, &bible.bible, &job.reader_profile);
    let meta = CallMeta::new(job.id, &job.title, "arc");
    let response = ctx
        .client
        .call(
            Some(prompts::STORYTELLER_SYSTEM.to_string()),
            vec![ChatMessage::user(prompt)],
            ARC_MAX_TOKENS,
            &meta,
        )
        .await?;

    let value = gate::parse(&response.text, ARC_REQUIRED_FIELDS)?;
    let arc: StoryArc =
        serde_json::from_value(value).context("arc response did not match the expected shape")?;
    validate_arc(&arc)?;

    let record = ctx.db().insert_arc(job.id, 1, &arc)?;
    ctx.db()
        .update_progress(job.id, &ProgressPatch::new().arc_complete(true).step(Step::ArcCreated).clear_error())?;

    ctx.logs.log(
        job.id,
        &job.title,
        tags::ARC,
        &format!("arc created [{} subplot threads]", record.arc.subplot_threads.len()),
    );
    Ok(record)
}

/// The response must contain exactly twelve outlines numbered 1..12 in
/// order, with pacing notes and at least one subplot thread.
fn validate_arc(arc: &StoryArc) -> Result<()> {
    if arc.chapters.len() != TOTAL_CHAPTERS as usize {
        bail!(
            "arc must contain exactly {} chapter outlines, got {}",
            TOTAL_CHAPTERS,
            arc.chapters.len()
        );
    }
    for (i, outline) in arc.chapters.iter().enumerate() {
        let expected = (i + 1) as u8;
        if outline.chapter_number != expected {
            bail!(
                "arc chapter outlines out of order: position {} holds chapter {}",
                i + 1,
                outline.chapter_number
            );
        }
    }
    if arc.pacing_notes.trim().is_empty() {
        bail!("arc is missing pacing notes");
    }
    if arc.subplot_threads.is_empty() {
        bail!("arc is missing subplot threads");
    }
    Ok(())
}
