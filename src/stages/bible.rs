//! Bible stage: premise + reader profile in, story bible out.

use anyhow::{Context, Result};

use crate::gate;
use crate::logbuf::tags;
use crate::model::{CallMeta, ChatMessage};
use crate::prompts;
use crate::store::models::{Bible, BIBLE_REQUIRED_FIELDS, BibleRecord, Job};
use crate::store::{ProgressPatch, Step};

use super::StageCtx;

const BIBLE_MAX_TOKENS: u32 = 4096;

/// Generate and persist the job's bible. Re-entry with an existing bible
/// corrects progress and returns the stored row without a model call.
pub async fn run_bible_stage(ctx: &StageCtx, job: &Job) -> Result<BibleRecord> {
    let existing_bible = ctx.db().get_bible(job.id)?;
    if let Some(existing) = existing_bible {
        ctx.logs.log(
            job.id,
            &job.title,
            tags::BIBLE,
            "bible already exists, advancing progress",
        );
        ctx.db().update_progress(
            job.id,
            &ProgressPatch::new()
                .bible_complete(true)
                .step(Step::BibleCreated),
        )?;
        return Ok(existing);
    }

    ctx.logs
        .log(job.id, &job.title, tags::BIBLE, "generating story bible");

    let prompt = prompts::bible_prompt(
        &job.title,
        &job.premise_ref,
        job.genre.as_deref(),
        &job.reader_profile,
    );
    let meta = CallMeta::new(job.id, &job.title, "bible");
    let response = ctx
        .client
        .call(
            Some(prompts::STORYTELLER_SYSTEM.to_string()),
            vec![ChatMessage::user(prompt)],
            BIBLE_MAX_TOKENS,
            &meta,
        )
        .await?;

    let value = gate::parse(&response.text, BIBLE_REQUIRED_FIELDS)?;
    let bible: Bible =
        serde_json::from_value(value).context("bible response did not match the expected shape")?;

    let record = ctx.db().insert_bible(job.id, &bible)?;
    ctx.db().set_bible_ref(job.id, record.id)?;
    ctx.db().update_progress(
        job.id,
        &ProgressPatch::new()
            .bible_complete(true)
            .step(Step::BibleCreated)
            .clear_error(),
    )?;

    ctx.logs.log(
        job.id,
        &job.title,
        tags::BIBLE,
        &format!(
            "bible created [{} characters, {} locations]",
            record.bible.supporting_characters.len() + 2,
            record.bible.key_locations.len()
        ),
    );
    Ok(record)
}
