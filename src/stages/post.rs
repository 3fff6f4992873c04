//! Best-effort post-processing after a chapter persists.
//!
//! Three independently guarded passes, each behind its own feature flag:
//! character-ledger extraction, entity/continuity validation (with optional
//! surgical rewrite), and a voice review that may rewrite the text once.
//! None of them can fail the chapter — errors are logged and the pipeline
//! moves on.

use anyhow::{Context, Result};

use crate::gate;
use crate::logbuf::tags;
use crate::model::{CallMeta, ChatMessage};
use crate::prompts;
use crate::store::models::{Bible, Chapter, Job};

use super::StageCtx;

const POST_MAX_TOKENS: u32 = 8192;

/// Run every enabled pass. Within a job, this completes before the next
/// chapter begins so the ledger is current for continuity context.
pub async fn run_all(ctx: &StageCtx, job: &Job, chapter: &Chapter, bible: &Bible) {
    if ctx.config.features.character_ledger {
        if let Err(e) = extract_ledger(ctx, job, chapter, bible).await {
            tracing::warn!(job_id = job.id, chapter = chapter.chapter_number, error = %e,
                "ledger extraction failed");
        }
    }
    if ctx.config.features.entity_validation {
        if let Err(e) = validate_entities(ctx, job, chapter.chapter_number, bible).await {
            tracing::warn!(job_id = job.id, chapter = chapter.chapter_number, error = %e,
                "entity validation failed");
        }
    }
    if ctx.config.features.voice_review {
        if let Err(e) = review_voice(ctx, job, chapter.chapter_number, bible).await {
            tracing::warn!(job_id = job.id, chapter = chapter.chapter_number, error = %e,
                "voice review failed");
        }
    }
}

/// Extract a voice/state ledger for the cast and stash it in the chapter's
/// metadata for the next chapter's continuity block.
async fn extract_ledger(ctx: &StageCtx, job: &Job, chapter: &Chapter, bible: &Bible) -> Result<()> {
    let names = bible.character_names();
    let prompt = prompts::ledger_prompt(chapter.chapter_number, &chapter.content, &names);
    let meta = CallMeta::new(job.id, &job.title, "character_ledger");
    let response = ctx
        .client
        .call(
            Some(prompts::STORYTELLER_SYSTEM.to_string()),
            vec![ChatMessage::user(prompt)],
            2048,
            &meta,
        )
        .await?;
    let value = gate::parse(&response.text, &["ledger"])?;

    let mut metadata = chapter.metadata.clone();
    metadata
        .extras
        .insert("character_ledger".to_string(), value["ledger"].clone());
    ctx.db()
        .update_chapter_metadata(job.id, chapter.chapter_number, &metadata)?;
    ctx.logs.log(
        job.id,
        &job.title,
        tags::REVIEW,
        &format!("chapter {} ledger updated", chapter.chapter_number),
    );
    Ok(())
}

/// Continuity check against the bible's cast and locations; applies a
/// surgical rewrite when the model supplies one.
async fn validate_entities(ctx: &StageCtx, job: &Job, n: u8, bible: &Bible) -> Result<()> {
    let content = ctx
        .db()
        .get_chapter(job.id, n)?
        .context("chapter missing for entity validation")?
        .content;
    let names = bible.character_names();
    let prompt = prompts::entity_validation_prompt(&content, &names, &bible.key_locations);
    let meta = CallMeta::new(job.id, &job.title, "entity_validation");
    let response = ctx
        .client
        .call(
            Some(prompts::STORYTELLER_SYSTEM.to_string()),
            vec![ChatMessage::user(prompt)],
            POST_MAX_TOKENS,
            &meta,
        )
        .await?;
    let value = gate::parse(&response.text, &["issues"])?;

    let issues = value["issues"].as_array().map(|a| a.len()).unwrap_or(0);
    if let Some(corrected) = value["corrected_content"].as_str() {
        ctx.db().update_chapter_content(job.id, n, corrected)?;
        ctx.logs.log(
            job.id,
            &job.title,
            tags::REVIEW,
            &format!("chapter {} continuity fix applied [{} issues]", n, issues),
        );
    } else if issues > 0 {
        ctx.logs.log(
            job.id,
            &job.title,
            tags::REVIEW,
            &format!("chapter {} continuity issues noted [{}]", n, issues),
        );
    }
    Ok(())
}

/// One-shot voice pass: rewrite the chapter if narration drifts from the
/// protagonist's voice notes.
async fn review_voice(ctx: &StageCtx, job: &Job, n: u8, bible: &Bible) -> Result<()> {
    let content = ctx
        .db()
        .get_chapter(job.id, n)?
        .context("chapter missing for voice review")?
        .content;
    let prompt = prompts::voice_review_prompt(&content, &bible.protagonist.voice_notes);
    let meta = CallMeta::new(job.id, &job.title, "voice_review");
    let response = ctx
        .client
        .call(
            Some(prompts::STORYTELLER_SYSTEM.to_string()),
            vec![ChatMessage::user(prompt)],
            POST_MAX_TOKENS,
            &meta,
        )
        .await?;
    let value = gate::parse(&response.text, &["drifted"])?;

    if value["drifted"].as_bool().unwrap_or(false) {
        if let Some(revised) = value["revised_content"].as_str() {
            ctx.db().update_chapter_content(job.id, n, revised)?;
            ctx.logs.log(
                job.id,
                &job.title,
                tags::REVIEW,
                &format!("chapter {} voice rewrite applied", n),
            );
        }
    }
    Ok(())
}
