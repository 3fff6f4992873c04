//! Persistent story store: SQLite schema, typed entities, and the progress
//! document that drives resume decisions.
//!
//! `StoryDb` is the narrow facade over the persistent store; everything the
//! orchestrator knows about a job flows through it. The schema is the
//! store's concern — no wire format is owned by the core.

pub mod db;
pub mod models;
pub mod progress;

pub use db::StoryDb;
pub use models::*;
pub use progress::{Progress, ProgressPatch, Step};

use std::sync::{Arc, Mutex};

/// Shared handle to the store. Lock scope is one statement group; the async
/// layers never hold it across an await point.
pub type SharedDb = Arc<Mutex<StoryDb>>;

/// Wrap a freshly opened store in the shared handle.
pub fn shared(db: StoryDb) -> SharedDb {
    Arc::new(Mutex::new(db))
}

/// Shared fixtures for the crate's tests.
#[cfg(test)]
pub(crate) mod testutil {
    use super::models::*;

    pub(crate) fn sample_bible() -> Bible {
        serde_json::from_value(serde_json::json!({
            "world_rules": ["tides obey the moon-bell"],
            "protagonist": {
                "name": "Isla",
                "psychology": "curious, guarded",
                "internal_contradiction": "wants to be seen, hides her work",
                "false_belief": "asking for help is weakness",
                "voice_notes": "dry humour"
            },
            "antagonist": {
                "name": "Warden Prell",
                "description": "keeper of the bell tower",
                "sympathetic_element": "protecting the town from the last flood"
            },
            "supporting_characters": [
                {"name": "Finch", "role": "best friend", "description": "reckless optimist"}
            ],
            "central_conflict": "the moon-bell is cracking",
            "stakes": "the harbour drowns at the next spring tide",
            "themes": ["trust", "repair"],
            "key_locations": ["bell tower", "the mudflats"],
            "timeline": "three weeks before the spring tide"
        }))
        .unwrap()
    }

    pub(crate) fn sample_arc(chapter_count: u8) -> StoryArc {
        let chapters: Vec<serde_json::Value> = (1..=chapter_count)
            .map(|n| {
                serde_json::json!({
                    "chapter_number": n,
                    "title": format!("Chapter {}", n),
                    "events": format!("events of chapter {}", n),
                    "character_focus": "Isla",
                    "tension_level": 5,
                    "emotional_arc": {"start": "uneasy", "end": "resolved"},
                    "key_dialogue_moment": "a hard question",
                    "chapter_hook": "the bell tolls once",
                    "key_revelations": ["a crack widens"],
                    "word_count_target": 1800
                })
            })
            .collect();
        serde_json::from_value(serde_json::json!({
            "chapters": chapters,
            "pacing_notes": "rising water, rising stakes",
            "subplot_threads": ["Finch's debt"],
            "growth_milestones": ["Isla asks for help"]
        }))
        .unwrap()
    }

    pub(crate) fn sample_draft(n: u8) -> ChapterDraft {
        ChapterDraft {
            chapter_number: n,
            title: format!("Chapter {}", n),
            content: "The tide came in early that morning.".to_string(),
            quality_score: 8.2,
            quality_review: None,
            regeneration_count: 0,
            metadata: ChapterMeta::default(),
        }
    }
}
