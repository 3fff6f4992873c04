//! Prompt templates for every model-facing operation.
//!
//! Templates are plain functions that assemble markdown-sectioned prompts
//! from typed inputs. The caller owns message ordering; these functions own
//! wording and structure. Response-shape instructions (JSON with named
//! fields, or XML for the editor pass) live here next to the prose that
//! asks for them.

use crate::store::models::{
    Bible, BibleRecord, Chapter, ChapterOutline, CheckpointFeedback, CharacterSignal,
    PacingSignal, ReaderProfile, ToneSignal,
};

/// System prompt shared by the generation operations.
pub const STORYTELLER_SYSTEM: &str = "You are a master storyteller writing a twelve-chapter book \
for one specific reader. You always answer with exactly the JSON document requested, with no \
commentary before or after it.";

/// System prompt for the editor pass, which answers in XML.
pub const EDITOR_SYSTEM: &str = "You are a sharp, practical story editor. You always answer with \
exactly the XML document requested, with no commentary before or after it.";

fn profile_section(profile: &ReaderProfile) -> String {
    let mut out = String::from("## Reader\n\n");
    if !profile.genres.is_empty() {
        out.push_str(&format!("- Favourite genres: {}\n", profile.genres.join(", ")));
    }
    if !profile.themes.is_empty() {
        out.push_str(&format!("- Themes they respond to: {}\n", profile.themes.join(", ")));
    }
    if let Some(ref age) = profile.age_band {
        out.push_str(&format!("- Age band: {}\n", age));
    }
    if let Some(ref level) = profile.reading_level {
        out.push_str(&format!("- Reading level: {}\n", level));
    }
    if !profile.beloved_titles.is_empty() {
        out.push_str(&format!("- Books they love: {}\n", profile.beloved_titles.join(", ")));
    }
    if let Some(ref request) = profile.explicit_request {
        out.push_str(&format!("- They explicitly asked for: {}\n", request));
    }
    out.push('\n');
    out
}

/// Prompt for the bible stage: premise in, structured story bible out.
pub fn bible_prompt(title: &str, premise_ref: &str, genre: Option<&str>, profile: &ReaderProfile) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("# Story Bible: {}\n\n", title));
    prompt.push_str(&format!("Selected premise: {}\n", premise_ref));
    if let Some(genre) = genre {
        prompt.push_str(&format!("Genre: {}\n", genre));
    }
    prompt.push('\n');
    prompt.push_str(&profile_section(profile));
    prompt.push_str(
        "Build the complete story bible for this book. The protagonist needs a real internal \
         contradiction and a false belief the story will test; the antagonist needs one genuinely \
         sympathetic element.\n\n\
         Respond with a single JSON object with these top-level fields:\n\
         `world_rules` (array of strings), `protagonist` (object with `name`, `psychology`, \
         `internal_contradiction`, `false_belief`, `voice_notes`), `antagonist` (object with \
         `name`, `description`, `sympathetic_element`), `supporting_characters` (array of objects \
         with `name`, `role`, `description`), `central_conflict` (string), `stakes` (string), \
         `themes` (array of strings), `key_locations` (array of strings), `timeline` (string).\n",
    );
    prompt
}

/// Prompt for the arc stage: bible in, twelve ordered chapter outlines out.
pub fn arc_prompt(title: &str, bible: &Bible, profile: &ReaderProfile) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("# Chapter Arc: {}\n\n", title));
    prompt.push_str("## Story bible\n\n");
    prompt.push_str(&serde_json::to_string_pretty(bible).unwrap_or_default());
    prompt.push_str("\n\n");
    if profile.age_band.is_some() || profile.reading_level.is_some() {
        prompt.push_str(&profile_section(profile));
    }
    prompt.push_str(
        "Plan the full book as exactly twelve chapters, numbered 1 through 12 in order. Every \
         chapter earns its place: rising tension, a hook at each end, and a clear emotional \
         journey for the reader.\n\n\
         Respond with a single JSON object with these top-level fields:\n\
         `chapters` (array of exactly 12 objects, each with `chapter_number`, `title`, `events`, \
         `character_focus`, `tension_level` (1-10), `emotional_arc` (object with `start` and \
         `end`, the reader's feeling entering and leaving), `key_dialogue_moment`, \
         `chapter_hook`, `key_revelations` (array), `word_count_target`), `pacing_notes` \
         (string), `subplot_threads` (array of strings), `growth_milestones` (array of strings).\n",
    );
    prompt
}

/// Inputs assembled by the chapter stage for one generation call.
pub struct ChapterPromptInput<'a> {
    pub title: &'a str,
    pub bible: &'a Bible,
    pub outline: &'a ChapterOutline,
    pub previous: &'a [Chapter],
    pub editor_notes: &'a [String],
    pub style_example: Option<&'a str>,
    pub preferences_block: Option<&'a str>,
    pub ledger_block: Option<&'a str>,
}

/// Prompt for one chapter generation attempt.
pub fn chapter_prompt(input: &ChapterPromptInput<'_>) -> String {
    let outline = input.outline;
    let mut prompt = String::new();
    prompt.push_str(&format!(
        "# Chapter {} of \"{}\": {}\n\n",
        outline.chapter_number, input.title, outline.title
    ));

    prompt.push_str("## Story bible\n\n");
    prompt.push_str(&serde_json::to_string_pretty(input.bible).unwrap_or_default());
    prompt.push_str("\n\n");

    if !input.previous.is_empty() {
        prompt.push_str("## The story so far (most recent chapters)\n\n");
        for chapter in input.previous {
            prompt.push_str(&format!(
                "### Chapter {}: {}\n\n{}\n\n",
                chapter.chapter_number,
                chapter.title,
                excerpt(&chapter.content, 1500)
            ));
        }
    }

    prompt.push_str("## Outline for this chapter\n\n");
    prompt.push_str(&serde_json::to_string_pretty(outline).unwrap_or_default());
    prompt.push_str("\n\n");

    if !input.editor_notes.is_empty() {
        prompt.push_str("## Editor notes (from reader feedback — follow these)\n\n");
        for note in input.editor_notes {
            prompt.push_str(&format!("- {}\n", note));
        }
        prompt.push('\n');
    }

    if let Some(example) = input.style_example {
        prompt.push_str("## Target style\n\nMatch the feel of this passage:\n\n");
        prompt.push_str(example);
        prompt.push_str("\n\n");
    }

    if let Some(block) = input.preferences_block {
        prompt.push_str("## What this reader has loved before\n\n");
        prompt.push_str(block);
        prompt.push_str("\n\n");
    }

    if let Some(block) = input.ledger_block {
        prompt.push_str("## Character continuity ledger\n\n");
        prompt.push_str(block);
        prompt.push_str("\n\n");
    }

    prompt.push_str(&format!(
        "Write the full chapter, about {} words. Open on the hook, end on the hook.\n\n\
         Respond with a single JSON object with one top-level field `chapter`, an object with: \
         `title`, `content` (the full prose), `opening_hook`, `closing_hook`, `key_events` \
         (array of strings), `character_development` (string).\n",
        outline.word_count_target
    ));
    prompt
}

/// Corrective turn fed back into the chapter conversation after a failed
/// review.
pub fn revision_prompt(priority_fixes: &[String], weighted_score: Option<f64>) -> String {
    let mut prompt = String::new();
    match weighted_score {
        Some(score) => prompt.push_str(&format!(
            "That draft scored {:.1}/10 against the quality rubric. Rewrite the chapter, fixing \
             these specific problems:\n\n",
            score
        )),
        None => prompt.push_str(
            "That draft breaks the house prose rules. Rewrite the chapter, fixing these specific \
             problems:\n\n",
        ),
    }
    for fix in priority_fixes {
        prompt.push_str(&format!("- {}\n", fix));
    }
    prompt.push_str(
        "\nKeep everything that already works. Respond with the same JSON shape as before \
         (single top-level `chapter` object).\n",
    );
    prompt
}

/// Prompt for the weighted quality review of a generated chapter.
pub fn review_prompt(chapter_number: u8, content: &str, outline: &ChapterOutline, profile: &ReaderProfile) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("# Quality review: chapter {}\n\n", chapter_number));
    if let Some(ref age) = profile.age_band {
        prompt.push_str(&format!("Intended reader age band: {}\n\n", age));
    }
    prompt.push_str("## Outline it was written against\n\n");
    prompt.push_str(&serde_json::to_string_pretty(outline).unwrap_or_default());
    prompt.push_str("\n\n## Chapter text\n\n");
    prompt.push_str(content);
    prompt.push_str(
        "\n\nScore this chapter 1-10 on each criterion, quoting evidence from the text. Where a \
         score is below 7, give one concrete fix.\n\n\
         Respond with a single JSON object whose top-level fields are exactly: `show_dont_tell`, \
         `dialogue`, `pacing`, `age_appropriateness`, `character_consistency`, `prose_quality` — \
         each an object with `score` (number), `evidence` (string), and optional `fix` (string).\n",
    );
    prompt
}

fn pacing_adjustment(signal: PacingSignal) -> &'static str {
    match signal {
        PacingSignal::Hooked => "Pacing is landing — keep the current rhythm.",
        PacingSignal::Slow => {
            "The reader finds it slow. Cut setup, start scenes later, end them earlier, and put \
             something at stake in every scene."
        }
        PacingSignal::Fast => {
            "The reader finds it rushed. Let big moments breathe; add reaction beats after \
             revelations."
        }
    }
}

fn tone_adjustment(signal: ToneSignal) -> &'static str {
    match signal {
        ToneSignal::Right => "Tone is right — hold it.",
        ToneSignal::Serious => {
            "The reader wants it more serious. Trim quips, raise real consequences, let the \
             danger be felt."
        }
        ToneSignal::Light => {
            "The reader wants it lighter. More warmth and humour between the tense beats."
        }
    }
}

fn character_adjustment(signal: CharacterSignal) -> &'static str {
    match signal {
        CharacterSignal::Love => "The reader loves the cast — deepen what's there.",
        CharacterSignal::Warming => {
            "The reader is warming up but not attached yet. Give the protagonist more interiority \
             and one disarming private moment per chapter."
        }
        CharacterSignal::NotClicking => {
            "The characters are not clicking. Sharpen wants and flaws, make choices costly, and \
             give each main character one scene that shows who they are under pressure."
        }
    }
}

/// Prompt for the editor pass. Asks for XML because long free-form prose in
/// attribute-less elements survives where JSON string quoting breaks.
pub fn editor_prompt(
    title: &str,
    bible: &BibleRecord,
    recent: &[Chapter],
    summaries: &[(u8, String)],
    feedback: &[CheckpointFeedback],
    next_outlines: &[ChapterOutline],
) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("# Editorial course-correction: {}\n\n", title));

    prompt.push_str("## Story context\n\n");
    prompt.push_str(&format!(
        "Protagonist: {}. Antagonist: {}. Central conflict: {}\n\n",
        bible.bible.protagonist.name, bible.bible.antagonist.name, bible.bible.central_conflict
    ));

    if !summaries.is_empty() {
        prompt.push_str("## Chapters so far\n\n");
        for (n, summary) in summaries {
            prompt.push_str(&format!("- Chapter {}: {}\n", n, summary));
        }
        prompt.push('\n');
    }

    if !recent.is_empty() {
        prompt.push_str("## Prose samples (openings of the last two chapters)\n\n");
        for chapter in recent {
            prompt.push_str(&format!(
                "### Chapter {}\n\n{}\n\n",
                chapter.chapter_number,
                excerpt(&chapter.content, 600)
            ));
        }
    }

    prompt.push_str("## Reader feedback\n\n");
    for fb in feedback {
        prompt.push_str(&format!("At {}:\n", fb.checkpoint.as_str()));
        prompt.push_str(&format!("- {}\n", pacing_adjustment(fb.pacing)));
        prompt.push_str(&format!("- {}\n", tone_adjustment(fb.tone)));
        prompt.push_str(&format!("- {}\n", character_adjustment(fb.character)));
        for quote in &fb.reader_quotes {
            prompt.push_str(&format!("- The reader said: \"{}\"\n", quote));
        }
        prompt.push('\n');
    }

    prompt.push_str("## Planned outlines for the next chapters\n\n");
    for outline in next_outlines {
        prompt.push_str(&serde_json::to_string_pretty(outline).unwrap_or_default());
        prompt.push_str("\n\n");
    }

    prompt.push_str(
        "Revise the planned outlines so the next chapters answer this feedback.\n\n\
         Respond in XML only. For each chapter emit:\n\
         <revised_outline chapter=\"N\">\n\
           <title>...</title>\n\
           <events>...</events>\n\
           <character_focus>...</character_focus>\n\
           <chapter_hook>...</chapter_hook>\n\
           <editor_notes>2-3 concrete beats, one per line, each starting with \"- \"</editor_notes>\n\
         </revised_outline>\n\
         Then emit exactly one <style_example>...</style_example>: an 80-120 word passage written \
         in the corrected style, using the story's actual character names.\n",
    );
    prompt
}

/// Prompt for the best-effort cover concept.
pub fn cover_prompt(title: &str, bible: &Bible) -> String {
    format!(
        "# Cover concept: {}\n\nCentral conflict: {}\nKey locations: {}\nThemes: {}\n\n\
         Describe one striking cover image for this book in two sentences, then give a short \
         art-direction palette note.\n\n\
         Respond with a single JSON object with top-level fields `image_description` and \
         `palette`.\n",
        title,
        bible.central_conflict,
        bible.key_locations.join(", "),
        bible.themes.join(", ")
    )
}

/// Prompt for the character-ledger extraction after a chapter is stored.
pub fn ledger_prompt(chapter_number: u8, content: &str, character_names: &[&str]) -> String {
    format!(
        "# Continuity ledger: chapter {}\n\nCast: {}\n\n## Chapter text\n\n{}\n\n\
         For each cast member who appears, record their state at the end of this chapter: \
         location, emotional state, what they know, and one line on their voice in this chapter.\n\n\
         Respond with a single JSON object with one top-level field `ledger`: an object mapping \
         character name to an object with `location`, `emotional_state`, `knows`, `voice`.\n",
        chapter_number,
        character_names.join(", "),
        excerpt(content, 6000)
    )
}

/// Prompt for the entity/continuity validation pass.
pub fn entity_validation_prompt(content: &str, character_names: &[&str], locations: &[String]) -> String {
    format!(
        "# Continuity check\n\nKnown characters: {}\nKnown locations: {}\n\n## Chapter text\n\n{}\n\n\
         Check the text for continuity breaks: misspelled or renamed characters, invented \
         locations that contradict the known ones, or objects that changed state impossibly. If \
         a surgical fix is needed, return the corrected full text; otherwise omit it.\n\n\
         Respond with a single JSON object with top-level fields `issues` (array of strings, \
         empty if clean) and optional `corrected_content` (string).\n",
        character_names.join(", "),
        locations.join(", "),
        excerpt(content, 8000)
    )
}

/// Prompt for the voice-review rewrite pass.
pub fn voice_review_prompt(content: &str, voice_notes: &str) -> String {
    format!(
        "# Voice review\n\nProtagonist voice notes: {}\n\n## Chapter text\n\n{}\n\n\
         If the narration or dialogue drifts from this voice, rewrite the chapter once to fix \
         it; otherwise omit the rewrite.\n\n\
         Respond with a single JSON object with top-level fields `drifted` (boolean) and \
         optional `revised_content` (string).\n",
        voice_notes,
        excerpt(content, 8000)
    )
}

/// First `max` characters of `text`, on a char boundary.
pub fn excerpt(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
