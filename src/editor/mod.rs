//! Reader-feedback course correction: checkpoint signals in, an editor
//! brief out.
//!
//! The editor pass asks for XML rather than JSON — revised outlines carry
//! long free-form prose, and element boundaries survive where JSON string
//! quoting breaks in the wild. A permissive element-regex parser is enough;
//! zero parsed outlines means the caller falls back to the unrevised
//! outlines.

use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;

use crate::logbuf::tags;
use crate::model::{CallMeta, ChatMessage};
use crate::prompts;
use crate::stages::StageCtx;
use crate::store::models::{
    ChapterOutline, CheckpointFeedback, EditorBrief, Job, RevisedOutline,
};

const EDITOR_MAX_TOKENS: u32 = 4096;

static REVISED_OUTLINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<revised_outline\s+chapter="(\d+)"\s*>(.*?)</revised_outline>"#).unwrap()
});

static STYLE_EXAMPLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<style_example>(.*?)</style_example>").unwrap());

/// Build an editor brief from the feedback history and the next outlines.
/// Returns `None` when the latest feedback is all-neutral or the editor
/// response yields no parseable outlines.
pub async fn build_editor_brief(
    ctx: &StageCtx,
    job: &Job,
    feedback_history: &[CheckpointFeedback],
    next_outlines: &[ChapterOutline],
) -> Result<Option<EditorBrief>> {
    let Some(latest) = feedback_history.last() else {
        return Ok(None);
    };
    if latest.is_all_neutral() {
        ctx.logs.log(
            job.id,
            &job.title,
            tags::EDITOR,
            "feedback all positive, no course correction needed",
        );
        return Ok(None);
    }

    let bible = match ctx.db().get_bible(job.id)? {
        Some(b) => b,
        None => return Ok(None),
    };
    let generated = ctx.db().chapter_count(job.id)?;
    let recent = ctx.db().previous_chapters(job.id, generated + 1, 2)?;
    let summaries: Vec<(u8, String)> = ctx
        .db()
        .previous_chapters(job.id, generated + 1, generated)?
        .iter()
        .map(|c| {
            let summary = if c.metadata.key_events.is_empty() {
                prompts::excerpt(&c.content, 200).to_string()
            } else {
                c.metadata.key_events.join("; ")
            };
            (c.chapter_number, summary)
        })
        .collect();

    ctx.logs.log(
        job.id,
        &job.title,
        tags::EDITOR,
        &format!(
            "building editor brief from {} feedback record(s)",
            feedback_history.len()
        ),
    );

    let prompt = prompts::editor_prompt(
        &job.title,
        &bible,
        &recent,
        &summaries,
        feedback_history,
        next_outlines,
    );
    let meta = CallMeta::new(job.id, &job.title, "editor_brief");
    let response = ctx
        .client
        .call(
            Some(prompts::EDITOR_SYSTEM.to_string()),
            vec![ChatMessage::user(prompt)],
            EDITOR_MAX_TOKENS,
            &meta,
        )
        .await?;

    let brief = parse_editor_xml(&response.text);
    match brief {
        Some(ref b) => ctx.logs.log(
            job.id,
            &job.title,
            tags::EDITOR,
            &format!("editor brief ready [{} revised outlines]", b.revised_outlines.len()),
        ),
        None => ctx.logs.log(
            job.id,
            &job.title,
            tags::EDITOR,
            "editor response yielded no outlines, using originals",
        ),
    }
    Ok(brief)
}

/// Permissive XML extraction by element boundaries.
pub fn parse_editor_xml(text: &str) -> Option<EditorBrief> {
    let mut outlines = Vec::new();
    for captures in REVISED_OUTLINE.captures_iter(text) {
        let chapter_number: u8 = match captures[1].parse() {
            Ok(n) => n,
            Err(_) => continue,
        };
        let body = &captures[2];
        outlines.push(RevisedOutline {
            chapter_number,
            title: element(body, "title"),
            events: element(body, "events"),
            character_focus: element(body, "character_focus"),
            chapter_hook: element(body, "chapter_hook"),
            editor_notes: notes(body),
        });
    }
    if outlines.is_empty() {
        return None;
    }

    let style_example = STYLE_EXAMPLE
        .captures(text)
        .map(|c| c[1].trim().to_string())
        .unwrap_or_default();

    Some(EditorBrief {
        revised_outlines: outlines,
        style_example,
    })
}

fn element(body: &str, name: &str) -> Option<String> {
    let pattern = format!(r"(?s)<{}>(.*?)</{}>", name, name);
    let re = Regex::new(&pattern).ok()?;
    re.captures(body)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty())
}

fn notes(body: &str) -> Vec<String> {
    element(body, "editor_notes")
        .map(|block| {
            block
                .lines()
                .map(|l| l.trim().trim_start_matches("- ").trim().to_string())
                .filter(|l| !l.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testctx::{make_job, scripted};
    use crate::store::models::{CharacterSignal, Checkpoint, PacingSignal, ToneSignal};
    use crate::store::testutil::{sample_arc, sample_bible};

    const EDITOR_XML: &str = r#"
Here are the revisions.
<revised_outline chapter="4">
  <title>A Sharper Turn</title>
  <events>Isla confronts the warden before the festival.</events>
  <character_focus>Isla and Finch</character_focus>
  <chapter_hook>The bell answers her.</chapter_hook>
  <editor_notes>
    - open mid-argument, no scene-setting
    - give Finch one line that lands the humour
    - end on the bell's reply
  </editor_notes>
</revised_outline>
<revised_outline chapter="5">
  <title>Low Water</title>
  <events>The mudflats give up a secret.</events>
  <editor_notes>
    - cut the travel scene entirely
    - let the discovery happen on the page
  </editor_notes>
</revised_outline>
<style_example>The bell spoke once, flat and wrong. Isla didn't flinch. Finch did, and covered it with a grin that fooled nobody, least of all Warden Prell.</style_example>
"#;

    fn feedback(pacing: PacingSignal) -> CheckpointFeedback {
        CheckpointFeedback {
            id: 1,
            job_id: 1,
            checkpoint: Checkpoint::Chapter2,
            pacing,
            tone: ToneSignal::Right,
            character: CharacterSignal::Love,
            reader_quotes: vec![],
            transcript: None,
            created_at: String::new(),
        }
    }

    #[test]
    fn test_parse_editor_xml_full() {
        let brief = parse_editor_xml(EDITOR_XML).unwrap();
        assert_eq!(brief.revised_outlines.len(), 2);

        let first = &brief.revised_outlines[0];
        assert_eq!(first.chapter_number, 4);
        assert_eq!(first.title.as_deref(), Some("A Sharper Turn"));
        assert_eq!(first.editor_notes.len(), 3);
        assert_eq!(first.editor_notes[0], "open mid-argument, no scene-setting");

        let second = &brief.revised_outlines[1];
        assert_eq!(second.chapter_number, 5);
        assert!(second.character_focus.is_none());
        assert_eq!(second.editor_notes.len(), 2);

        assert!(brief.style_example.contains("Warden Prell"));
    }

    #[test]
    fn test_parse_editor_xml_zero_outlines_is_none() {
        assert!(parse_editor_xml("Sorry, I can't help with outlines today.").is_none());
        assert!(parse_editor_xml("<style_example>just style</style_example>").is_none());
    }

    #[test]
    fn test_parse_editor_xml_missing_style_example() {
        let xml = r#"<revised_outline chapter="7"><title>T</title></revised_outline>"#;
        let brief = parse_editor_xml(xml).unwrap();
        assert_eq!(brief.revised_outlines.len(), 1);
        assert!(brief.style_example.is_empty());
    }

    #[tokio::test]
    async fn test_all_neutral_feedback_returns_none_without_model_call() {
        let (ctx, api) = scripted();
        let job = make_job(&ctx);
        let history = vec![feedback(PacingSignal::Hooked)];
        let arc = sample_arc(12);

        let brief = build_editor_brief(&ctx, &job, &history, &arc.chapters[3..6])
            .await
            .unwrap();
        assert!(brief.is_none());
        assert_eq!(api.calls(), 0);
    }

    #[tokio::test]
    async fn test_non_neutral_feedback_builds_brief() {
        let (ctx, api) = scripted();
        let job = make_job(&ctx);
        ctx.db().insert_bible(job.id, &sample_bible()).unwrap();
        let arc = ctx.db().insert_arc(job.id, 1, &sample_arc(12)).unwrap();
        for n in 1..=3 {
            ctx.db()
                .insert_chapter(job.id, arc.id, &crate::store::testutil::sample_draft(n))
                .unwrap();
        }
        api.push_ok(EDITOR_XML);

        let history = vec![feedback(PacingSignal::Slow)];
        let brief = build_editor_brief(&ctx, &job, &history, &arc.arc.chapters[3..6])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(brief.revised_outlines.len(), 2);
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn test_unparseable_editor_response_falls_back_to_none() {
        let (ctx, api) = scripted();
        let job = make_job(&ctx);
        ctx.db().insert_bible(job.id, &sample_bible()).unwrap();
        api.push_ok("I rewrote everything as free prose, no tags.");

        let history = vec![feedback(PacingSignal::Fast)];
        let arc = sample_arc(12);
        let brief = build_editor_brief(&ctx, &job, &history, &arc.chapters[3..6])
            .await
            .unwrap();
        assert!(brief.is_none());
    }
}
