//! Fire-and-forget cover concept generation.
//!
//! Kicked off once per job, in parallel with the chapter chain. The handle
//! is kept only so teardown can cancel it; the pipeline never awaits it and
//! its failure never blocks the chain.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use crate::gate;
use crate::logbuf::tags;
use crate::model::{CallMeta, ChatMessage};
use crate::prompts;
use crate::stages::StageCtx;
use crate::store::models::Job;

/// Registry of in-flight cover tasks, keyed by job id.
pub type CoverTasks = Arc<Mutex<HashMap<i64, JoinHandle<()>>>>;

pub fn new_registry() -> CoverTasks {
    Arc::new(Mutex::new(HashMap::new()))
}

/// Spawn the cover task if the job qualifies: no cover yet, reader's
/// display name confirmed, and not already in flight.
pub fn maybe_spawn(ctx: &StageCtx, job: &Job) {
    if job.cover_ref.is_some() || !job.reader_profile.display_name_confirmed {
        return;
    }
    {
        let mut tasks = ctx.covers.lock().unwrap_or_else(|e| e.into_inner());
        if tasks.contains_key(&job.id) {
            return;
        }
        let ctx_clone = ctx.clone();
        let job_id = job.id;
        let title = job.title.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = generate(&ctx_clone, job_id, &title).await {
                tracing::warn!(job_id, error = %e, "cover generation failed");
            }
            let mut tasks = ctx_clone.covers.lock().unwrap_or_else(|e| e.into_inner());
            tasks.remove(&job_id);
        });
        tasks.insert(job.id, handle);
    }
}

/// Cancel every in-flight cover task (process teardown).
pub fn abort_all(tasks: &CoverTasks) {
    let mut tasks = tasks.lock().unwrap_or_else(|e| e.into_inner());
    for (_, handle) in tasks.drain() {
        handle.abort();
    }
}

async fn generate(ctx: &StageCtx, job_id: i64, title: &str) -> Result<()> {
    let bible = ctx
        .db()
        .get_bible(job_id)?
        .context("cover generation requires a bible")?;
    let prompt = prompts::cover_prompt(title, &bible.bible);
    let meta = CallMeta::new(job_id, title, "cover");
    let response = ctx
        .client
        .call(
            Some(prompts::STORYTELLER_SYSTEM.to_string()),
            vec![ChatMessage::user(prompt)],
            1024,
            &meta,
        )
        .await?;
    let value = gate::parse(&response.text, &["image_description"])?;
    let description = value["image_description"]
        .as_str()
        .context("cover response missing image description")?;
    ctx.db().set_cover_ref(job_id, description)?;
    ctx.logs.log(job_id, title, tags::COVER, "cover concept stored");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testctx::scripted;
    use crate::store::models::ReaderProfile;
    use crate::store::testutil::sample_bible;

    fn confirmed_profile() -> ReaderProfile {
        ReaderProfile {
            display_name: Some("Sam".to_string()),
            display_name_confirmed: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_cover_stores_reference() {
        let (ctx, api) = scripted();
        let job = ctx
            .db()
            .create_job("o", "p", "The Moon-Bell", None, &confirmed_profile())
            .unwrap();
        ctx.db().insert_bible(job.id, &sample_bible()).unwrap();
        api.push_ok(r#"{"image_description": "a cracked bell over dark water", "palette": "slate and brass"}"#);

        maybe_spawn(&ctx, &job);
        // Wait for the spawned task to drain.
        for _ in 0..50 {
            if ctx.covers.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let reloaded = ctx.db().get_job(job.id).unwrap().unwrap();
        assert_eq!(
            reloaded.cover_ref.as_deref(),
            Some("a cracked bell over dark water")
        );
    }

    #[tokio::test]
    async fn test_no_spawn_without_confirmed_name() {
        let (ctx, api) = scripted();
        let job = ctx
            .db()
            .create_job("o", "p", "T", None, &ReaderProfile::default())
            .unwrap();
        maybe_spawn(&ctx, &job);
        assert!(ctx.covers.lock().unwrap().is_empty());
        assert_eq!(api.calls(), 0);
    }

    #[tokio::test]
    async fn test_no_spawn_when_cover_exists() {
        let (ctx, api) = scripted();
        let job = ctx
            .db()
            .create_job("o", "p", "T", None, &confirmed_profile())
            .unwrap();
        ctx.db().set_cover_ref(job.id, "existing").unwrap();
        let job = ctx.db().get_job(job.id).unwrap().unwrap();

        maybe_spawn(&ctx, &job);
        assert!(ctx.covers.lock().unwrap().is_empty());
        assert_eq!(api.calls(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_swallowed() {
        let (ctx, api) = scripted();
        let job = ctx
            .db()
            .create_job("o", "p", "T", None, &confirmed_profile())
            .unwrap();
        ctx.db().insert_bible(job.id, &sample_bible()).unwrap();
        api.push_err(crate::errors::ModelError::permanent("no cover today"));

        maybe_spawn(&ctx, &job);
        for _ in 0..50 {
            if ctx.covers.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let reloaded = ctx.db().get_job(job.id).unwrap().unwrap();
        assert!(reloaded.cover_ref.is_none());
    }
}
