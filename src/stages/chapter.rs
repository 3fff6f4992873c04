//! Chapter stage: generate → prose scan → weighted review → regeneration
//! loop → persist, with best-effort post-processing afterwards.
//!
//! The attempt budget covers both failure kinds: the first two prose-scan
//! failures regenerate with the violations as priority fixes; a third
//! proceeds to the rubric with the violations surfaced in the stored
//! review. The rubric itself is advisory — on the final attempt the chapter
//! persists with whatever review it earned.

use anyhow::{Context, Result};
use serde_json::Value;

use crate::gate;
use crate::logbuf::tags;
use crate::model::{CallMeta, ChatMessage};
use crate::prompts::{self, ChapterPromptInput};
use crate::store::models::{
    Chapter, ChapterDraft, ChapterMeta, ChapterOutline, EditorBrief, Job, QualityReview,
    RevisedOutline,
};
use crate::store::ProgressPatch;

use super::{StageCtx, post, prose, review};

const CHAPTER_MAX_TOKENS: u32 = 8192;
const REVIEW_MAX_TOKENS: u32 = 2048;
const CONTEXT_WINDOW: u8 = 3;

/// Generate, review, and persist chapter `n`. A chapter already stored
/// under this number is returned unchanged.
pub async fn run_chapter_stage(
    ctx: &StageCtx,
    job: &Job,
    n: u8,
    brief: Option<&EditorBrief>,
) -> Result<Chapter> {
    if let Some(existing) = ctx.db().get_chapter(job.id, n)? {
        ctx.logs.log(
            job.id,
            &job.title,
            tags::CHAPTER,
            &format!("chapter {} already exists, skipping", n),
        );
        return Ok(existing);
    }

    let bible = ctx
        .db()
        .get_bible(job.id)?
        .context("chapter stage requires a bible")?;
    let arc = ctx
        .db()
        .latest_arc(job.id)?
        .context("chapter stage requires an arc")?;
    let previous = ctx.db().previous_chapters(job.id, n, CONTEXT_WINDOW)?;

    let mut outline = arc
        .arc
        .outline(n)
        .with_context(|| format!("arc has no outline for chapter {}", n))?
        .clone();
    let mut editor_notes: Vec<String> = Vec::new();
    let mut style_example: Option<String> = None;
    if let Some(brief) = brief {
        if let Some(revised) = brief.outline_for(n) {
            overlay_outline(&mut outline, revised);
            editor_notes = revised.editor_notes.clone();
            if !brief.style_example.is_empty() {
                style_example = Some(brief.style_example.clone());
            }
        }
    }

    let preferences_block = if ctx.config.features.adaptive_preferences {
        learned_preferences_block(&job.reader_profile.extras)
    } else {
        None
    };
    let ledger_block = if ctx.config.features.character_ledger {
        continuity_ledger_block(&previous)
    } else {
        None
    };

    let base_prompt = prompts::chapter_prompt(&ChapterPromptInput {
        title: &job.title,
        bible: &bible.bible,
        outline: &outline,
        previous: &previous,
        editor_notes: &editor_notes,
        style_example: style_example.as_deref(),
        preferences_block: preferences_block.as_deref(),
        ledger_block: ledger_block.as_deref(),
    });

    let max_attempts = ctx.config.chapter.max_regenerations.max(1);
    let threshold = ctx.config.chapter.quality_threshold;
    let mut messages = vec![ChatMessage::user(base_prompt)];
    let mut prose_failures: u32 = 0;
    let mut surfaced_violations: Vec<String> = Vec::new();

    ctx.logs.log(
        job.id,
        &job.title,
        tags::CHAPTER,
        &format!("generating chapter {} ({})", n, outline.title),
    );

    for attempt in 1..=max_attempts {
        let meta = CallMeta::new(job.id, &job.title, "chapter");
        let response = ctx
            .client
            .call(
                Some(prompts::STORYTELLER_SYSTEM.to_string()),
                messages.clone(),
                CHAPTER_MAX_TOKENS,
                &meta,
            )
            .await?;

        let value = gate::parse(&response.text, &["chapter"])?;
        let payload = &value["chapter"];
        let content = payload["content"]
            .as_str()
            .context("chapter response missing content")?
            .to_string();
        let title = payload["title"].as_str().unwrap_or(&outline.title).to_string();

        let violations = prose::scan(&content);
        if !violations.is_empty() && prose_failures < 2 && attempt < max_attempts {
            prose_failures += 1;
            let synth = review::from_violations(&violations);
            ctx.logs.log(
                job.id,
                &job.title,
                tags::REVIEW,
                &format!(
                    "chapter {} prose violations, regenerating [attempt {}/{}]: {}",
                    n,
                    attempt,
                    max_attempts,
                    violations.join("; ")
                ),
            );
            messages.push(ChatMessage::assistant(response.text.clone()));
            messages.push(ChatMessage::user(prompts::revision_prompt(
                &synth.priority_fixes,
                None,
            )));
            continue;
        }
        if !violations.is_empty() {
            surfaced_violations = violations;
        }

        let mut chapter_review = match quality_review(ctx, job, n, &content, &outline).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(job_id = job.id, chapter = n, error = %e, "quality review unavailable");
                review::unavailable()
            }
        };
        chapter_review.prose_violations = surfaced_violations.clone();

        ctx.logs.log(
            job.id,
            &job.title,
            tags::REVIEW,
            &format!(
                "chapter {} scored {:.1}/10 [attempt {}/{}]",
                n, chapter_review.weighted_score, attempt, max_attempts
            ),
        );

        if chapter_review.weighted_score >= threshold || attempt == max_attempts {
            let chapter = persist_chapter(
                ctx,
                job,
                arc.id,
                n,
                title,
                content,
                chapter_review,
                attempt - 1,
                payload,
            )?;
            post::run_all(ctx, job, &chapter, &bible.bible).await;
            // Post-processing may have rewritten the stored text.
            return ctx
                .db()
                .get_chapter(job.id, n)?
                .context("chapter disappeared after post-processing");
        }

        let fixes = chapter_review.priority_fixes.clone();
        messages.push(ChatMessage::assistant(response.text));
        messages.push(ChatMessage::user(prompts::revision_prompt(
            &fixes,
            Some(chapter_review.weighted_score),
        )));
    }

    unreachable!("chapter loop persists on its final attempt")
}

#[allow(clippy::too_many_arguments)]
fn persist_chapter(
    ctx: &StageCtx,
    job: &Job,
    arc_id: i64,
    n: u8,
    title: String,
    content: String,
    chapter_review: QualityReview,
    regeneration_count: u32,
    payload: &Value,
) -> Result<Chapter> {
    let metadata = ChapterMeta {
        opening_hook: payload["opening_hook"].as_str().unwrap_or_default().to_string(),
        closing_hook: payload["closing_hook"].as_str().unwrap_or_default().to_string(),
        key_events: payload["key_events"]
            .as_array()
            .map(|events| {
                events
                    .iter()
                    .filter_map(|e| e.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
        character_development: payload["character_development"].as_str().map(str::to_string),
        extras: serde_json::Map::new(),
    };
    let draft = ChapterDraft {
        chapter_number: n,
        title,
        content,
        quality_score: (chapter_review.weighted_score * 10.0).round() / 10.0,
        quality_review: Some(chapter_review),
        regeneration_count,
        metadata,
    };
    let chapter = ctx.db().insert_chapter(job.id, arc_id, &draft)?;
    ctx.db().update_progress(
        job.id,
        &ProgressPatch::new().chapters_generated(n).clear_error(),
    )?;
    ctx.logs.log(
        job.id,
        &job.title,
        tags::DONE,
        &format!(
            "chapter {} persisted [{} words, score {:.1}, {} regenerations]",
            n, chapter.word_count, chapter.quality_score, chapter.regeneration_count
        ),
    );
    Ok(chapter)
}

/// Second model call: score the chapter against the weighted rubric.
async fn quality_review(
    ctx: &StageCtx,
    job: &Job,
    n: u8,
    content: &str,
    outline: &ChapterOutline,
) -> Result<QualityReview> {
    let prompt = prompts::review_prompt(n, content, outline, &job.reader_profile);
    let meta = CallMeta::new(job.id, &job.title, "quality_review");
    let response = ctx
        .client
        .call(
            Some(prompts::STORYTELLER_SYSTEM.to_string()),
            vec![ChatMessage::user(prompt)],
            REVIEW_MAX_TOKENS,
            &meta,
        )
        .await?;
    let required = review::required_fields();
    let value = gate::parse(&response.text, &required)?;
    Ok(review::from_json(&value, ctx.config.chapter.quality_threshold))
}

/// Layer a revised outline's fields onto the baseline.
fn overlay_outline(outline: &mut ChapterOutline, revised: &RevisedOutline) {
    if let Some(ref title) = revised.title {
        outline.title = title.clone();
    }
    if let Some(ref events) = revised.events {
        outline.events = events.clone();
    }
    if let Some(ref focus) = revised.character_focus {
        outline.character_focus = focus.clone();
    }
    if let Some(ref hook) = revised.chapter_hook {
        outline.chapter_hook = hook.clone();
    }
}

/// The learned-preferences block, only when the analysis collaborator has
/// enough signal: at least two completed works at confidence >= 0.5.
fn learned_preferences_block(extras: &serde_json::Map<String, Value>) -> Option<String> {
    let prefs = extras.get("learned_preferences")?;
    let completed = prefs["completed_works"].as_u64().unwrap_or(0);
    let confidence = prefs["confidence"].as_f64().unwrap_or(0.0);
    if completed < 2 || confidence < 0.5 {
        return None;
    }
    let guidance = prefs["guidance"].as_array()?;
    let lines: Vec<String> = guidance
        .iter()
        .filter_map(|g| g.as_str().map(|s| format!("- {}", s)))
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Voice/state ledger from the most recent prior chapter that carries one.
fn continuity_ledger_block(previous: &[Chapter]) -> Option<String> {
    previous
        .iter()
        .rev()
        .find_map(|c| c.metadata.extras.get("character_ledger"))
        .map(|ledger| serde_json::to_string_pretty(ledger).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testctx::{make_job, scripted};
    use crate::store::testutil::{sample_arc, sample_bible};

    fn chapter_response(content: &str) -> String {
        serde_json::json!({
            "chapter": {
                "title": "The Bell Cracks",
                "content": content,
                "opening_hook": "the bell tolls at dawn",
                "closing_hook": "the water does not stop",
                "key_events": ["the crack is found"],
                "character_development": "Isla admits she needs help"
            }
        })
        .to_string()
    }

    fn review_response(score: f64) -> String {
        let mut obj = serde_json::Map::new();
        for (name, _) in review::CRITERIA {
            obj.insert(
                name.to_string(),
                serde_json::json!({"score": score, "evidence": "quote", "fix": "do better"}),
            );
        }
        serde_json::Value::Object(obj).to_string()
    }

    fn seed_story(ctx: &StageCtx, job_id: i64, chapters: u8) {
        let db = ctx.db();
        db.insert_bible(job_id, &sample_bible()).unwrap();
        let arc = db.insert_arc(job_id, 1, &sample_arc(12)).unwrap();
        for n in 1..=chapters {
            db.insert_chapter(job_id, arc.id, &crate::store::testutil::sample_draft(n))
                .unwrap();
        }
        drop(db);
        if chapters > 0 {
            ctx.db()
                .update_progress(
                    job_id,
                    &ProgressPatch::new().chapters_generated(chapters),
                )
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_happy_path_chapter_three() {
        let (ctx, api) = scripted();
        let mut config = ctx.config.clone();
        config.features = crate::config::FeatureFlags {
            adaptive_preferences: false,
            character_ledger: false,
            entity_validation: false,
            voice_review: false,
        };
        let ctx = StageCtx::new(ctx.db.clone(), ctx.client.clone(), ctx.logs.clone(), config);
        let job = make_job(&ctx);
        seed_story(&ctx, job.id, 2);
        api.push_ok(&chapter_response("Clean prose about the bell and the tide."));
        api.push_ok(&review_response(8.0));

        let chapter = run_chapter_stage(&ctx, &job, 3, None).await.unwrap();
        assert_eq!(chapter.chapter_number, 3);
        assert_eq!(chapter.regeneration_count, 0);
        assert_eq!(chapter.quality_score, 8.0);
        assert_eq!(api.calls(), 2);

        let reloaded = ctx.db().get_job(job.id).unwrap().unwrap();
        assert_eq!(reloaded.progress.chapters_generated, 3);
        assert_eq!(ctx.db().chapter_count(job.id).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_idempotence_guard_returns_existing() {
        let (ctx, api) = scripted();
        let job = make_job(&ctx);
        seed_story(&ctx, job.id, 3);

        let chapter = run_chapter_stage(&ctx, &job, 2, None).await.unwrap();
        assert_eq!(chapter.chapter_number, 2);
        assert_eq!(api.calls(), 0);
    }

    #[tokio::test]
    async fn test_prose_violations_trigger_regeneration() {
        let (ctx, api) = scripted();
        let mut config = ctx.config.clone();
        config.features.character_ledger = false;
        config.features.entity_validation = false;
        config.features.voice_review = false;
        let ctx = StageCtx::new(ctx.db.clone(), ctx.client.clone(), ctx.logs.clone(), config);
        let job = make_job(&ctx);
        seed_story(&ctx, job.id, 0);

        let dashed = "word — ".repeat(20);
        api.push_ok(&chapter_response(&dashed));
        api.push_ok(&chapter_response("Clean prose this time."));
        api.push_ok(&review_response(8.0));

        let chapter = run_chapter_stage(&ctx, &job, 1, None).await.unwrap();
        assert_eq!(chapter.regeneration_count, 1);
        assert_eq!(api.calls(), 3);

        // The corrective turn carried the violation as a priority fix.
        let requests = api.requests();
        let second = &requests[1];
        let last_user = second.messages.last().unwrap();
        assert!(last_user.content.contains("em dash used 20 times (max 15)"));
    }

    #[tokio::test]
    async fn test_third_prose_failure_surfaces_violations_in_review() {
        let (ctx, api) = scripted();
        let mut config = ctx.config.clone();
        config.features.character_ledger = false;
        config.features.entity_validation = false;
        config.features.voice_review = false;
        let ctx = StageCtx::new(ctx.db.clone(), ctx.client.clone(), ctx.logs.clone(), config);
        let job = make_job(&ctx);
        seed_story(&ctx, job.id, 0);

        let dashed = "word — ".repeat(20);
        api.push_ok(&chapter_response(&dashed));
        api.push_ok(&chapter_response(&dashed));
        api.push_ok(&chapter_response(&dashed));
        api.push_ok(&review_response(8.0));

        let chapter = run_chapter_stage(&ctx, &job, 1, None).await.unwrap();
        assert_eq!(chapter.regeneration_count, 2);
        let review = chapter.quality_review.unwrap();
        assert!(
            review
                .prose_violations
                .iter()
                .any(|v| v.contains("em dash")),
            "violations should surface in the stored review"
        );
    }

    #[tokio::test]
    async fn test_failing_rubric_regenerates_then_persists_advisory() {
        let (ctx, api) = scripted();
        let mut config = ctx.config.clone();
        config.features.character_ledger = false;
        config.features.entity_validation = false;
        config.features.voice_review = false;
        let ctx = StageCtx::new(ctx.db.clone(), ctx.client.clone(), ctx.logs.clone(), config);
        let job = make_job(&ctx);
        seed_story(&ctx, job.id, 0);

        for _ in 0..3 {
            api.push_ok(&chapter_response("Clean but flat prose."));
            api.push_ok(&review_response(6.0));
        }

        let chapter = run_chapter_stage(&ctx, &job, 1, None).await.unwrap();
        assert_eq!(chapter.regeneration_count, 2);
        assert_eq!(chapter.quality_score, 6.0);
        let review = chapter.quality_review.unwrap();
        assert!(!review.passed);
        assert_eq!(api.calls(), 6);
    }

    #[tokio::test]
    async fn test_editor_brief_overlays_outline_and_notes() {
        let (ctx, api) = scripted();
        let mut config = ctx.config.clone();
        config.features.character_ledger = false;
        config.features.entity_validation = false;
        config.features.voice_review = false;
        let ctx = StageCtx::new(ctx.db.clone(), ctx.client.clone(), ctx.logs.clone(), config);
        let job = make_job(&ctx);
        seed_story(&ctx, job.id, 3);

        let brief = EditorBrief {
            revised_outlines: vec![RevisedOutline {
                chapter_number: 4,
                title: Some("A Sharper Turn".to_string()),
                events: Some("Isla confronts the warden early".to_string()),
                character_focus: None,
                chapter_hook: None,
                editor_notes: vec!["open mid-argument".to_string()],
            }],
            style_example: "Short. Wet. Cold. The bell again.".to_string(),
        };

        api.push_ok(&chapter_response("Prose that follows the brief."));
        api.push_ok(&review_response(8.5));

        run_chapter_stage(&ctx, &job, 4, Some(&brief)).await.unwrap();

        let requests = api.requests();
        let prompt = &requests[0].messages[0].content;
        assert!(prompt.contains("A Sharper Turn"));
        assert!(prompt.contains("open mid-argument"));
        assert!(prompt.contains("Short. Wet. Cold."));
    }

    #[tokio::test]
    async fn test_review_call_failure_is_advisory() {
        let (ctx, api) = scripted();
        let mut config = ctx.config.clone();
        config.features.character_ledger = false;
        config.features.entity_validation = false;
        config.features.voice_review = false;
        let ctx = StageCtx::new(ctx.db.clone(), ctx.client.clone(), ctx.logs.clone(), config);
        let job = make_job(&ctx);
        seed_story(&ctx, job.id, 0);

        api.push_ok(&chapter_response("Fine prose."));
        api.push_err(crate::errors::ModelError::permanent("review endpoint down"));
        // Attempt 2 also fails its review; attempt 3 persists regardless.
        api.push_ok(&chapter_response("Fine prose again."));
        api.push_err(crate::errors::ModelError::permanent("review endpoint down"));
        api.push_ok(&chapter_response("Fine prose, third time."));
        api.push_err(crate::errors::ModelError::permanent("review endpoint down"));

        let chapter = run_chapter_stage(&ctx, &job, 1, None).await.unwrap();
        assert_eq!(chapter.quality_score, 5.0);
        let review = chapter.quality_review.unwrap();
        assert!(review.priority_fixes[0].contains("quality review unavailable"));
    }

    #[test]
    fn test_learned_preferences_gate() {
        let mut extras = serde_json::Map::new();
        extras.insert(
            "learned_preferences".to_string(),
            serde_json::json!({
                "completed_works": 3,
                "confidence": 0.8,
                "guidance": ["loves banter", "short chapters land well"]
            }),
        );
        let block = learned_preferences_block(&extras).unwrap();
        assert!(block.contains("loves banter"));

        extras.insert(
            "learned_preferences".to_string(),
            serde_json::json!({"completed_works": 1, "confidence": 0.9, "guidance": ["x"]}),
        );
        assert!(learned_preferences_block(&extras).is_none());

        extras.insert(
            "learned_preferences".to_string(),
            serde_json::json!({"completed_works": 5, "confidence": 0.4, "guidance": ["x"]}),
        );
        assert!(learned_preferences_block(&extras).is_none());
    }
}
