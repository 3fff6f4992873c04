//! Domain entities persisted by the story store.
//!
//! Model-facing documents (Bible, StoryArc, ChapterOutline, QualityReview)
//! are closed struct types decoded at the JSON-gate boundary; each carries a
//! flattened `extras` bag so unknown keys from newer prompts survive a
//! round-trip instead of being dropped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::progress::Progress;

/// Number of chapters in a finished book.
pub const TOTAL_CHAPTERS: u8 = 12;

// ── Job ───────────────────────────────────────────────────────────────

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Active,
    Error,
    Completed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Error => "error",
            Self::Completed => "completed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "active" => Ok(Self::Active),
            "error" => Ok(Self::Error),
            "completed" => Ok(Self::Completed),
            other => Err(format!("Unknown job status: {}", other)),
        }
    }
}

/// One book-sized generation run bound to a single owner and premise.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub owner: String,
    pub premise_ref: String,
    pub title: String,
    pub genre: Option<String>,
    pub status: JobStatus,
    pub progress: Progress,
    pub bible_ref: Option<i64>,
    pub cover_ref: Option<String>,
    pub reader_profile: ReaderProfile,
    pub created_at: String,
    pub updated_at: String,
}

/// Reader preferences captured at job creation and threaded into prompts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReaderProfile {
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub themes: Vec<String>,
    #[serde(default)]
    pub age_band: Option<String>,
    #[serde(default)]
    pub reading_level: Option<String>,
    #[serde(default)]
    pub beloved_titles: Vec<String>,
    #[serde(default)]
    pub explicit_request: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub display_name_confirmed: bool,
    #[serde(flatten)]
    pub extras: Map<String, Value>,
}

// ── Bible ─────────────────────────────────────────────────────────────

/// Top-level keys a bible response must contain (asserted by the JSON gate
/// before decoding).
pub const BIBLE_REQUIRED_FIELDS: &[&str] = &[
    "world_rules",
    "protagonist",
    "antagonist",
    "supporting_characters",
    "central_conflict",
    "stakes",
    "themes",
    "key_locations",
    "timeline",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Protagonist {
    pub name: String,
    pub psychology: String,
    pub internal_contradiction: String,
    pub false_belief: String,
    #[serde(default)]
    pub voice_notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Antagonist {
    pub name: String,
    pub description: String,
    pub sympathetic_element: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportingCharacter {
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub description: String,
}

/// The structured world + character + stakes document, produced once per job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bible {
    pub world_rules: Vec<String>,
    pub protagonist: Protagonist,
    pub antagonist: Antagonist,
    pub supporting_characters: Vec<SupportingCharacter>,
    pub central_conflict: String,
    pub stakes: String,
    pub themes: Vec<String>,
    pub key_locations: Vec<String>,
    pub timeline: String,
    #[serde(flatten)]
    pub extras: Map<String, Value>,
}

impl Bible {
    /// All character names known to the story, for continuity checks.
    pub fn character_names(&self) -> Vec<&str> {
        let mut names = vec![self.protagonist.name.as_str(), self.antagonist.name.as_str()];
        names.extend(self.supporting_characters.iter().map(|c| c.name.as_str()));
        names
    }
}

/// A persisted bible row.
#[derive(Debug, Clone)]
pub struct BibleRecord {
    pub id: i64,
    pub job_id: i64,
    pub bible: Bible,
    pub created_at: String,
}

// ── Arc ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmotionalArc {
    #[serde(default)]
    pub start: String,
    #[serde(default)]
    pub end: String,
}

/// Outline for a single chapter within the arc.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterOutline {
    pub chapter_number: u8,
    pub title: String,
    pub events: String,
    #[serde(default)]
    pub character_focus: String,
    #[serde(default)]
    pub tension_level: u8,
    #[serde(default)]
    pub emotional_arc: EmotionalArc,
    #[serde(default)]
    pub key_dialogue_moment: String,
    #[serde(default)]
    pub chapter_hook: String,
    #[serde(default)]
    pub key_revelations: Vec<String>,
    #[serde(default = "default_word_count_target")]
    pub word_count_target: u32,
    #[serde(flatten)]
    pub extras: Map<String, Value>,
}

fn default_word_count_target() -> u32 {
    2000
}

/// The twelve-chapter outline derived from the bible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryArc {
    pub chapters: Vec<ChapterOutline>,
    pub pacing_notes: String,
    pub subplot_threads: Vec<String>,
    #[serde(default)]
    pub growth_milestones: Vec<String>,
    #[serde(flatten)]
    pub extras: Map<String, Value>,
}

impl StoryArc {
    /// The outline for chapter `n`, if present.
    pub fn outline(&self, n: u8) -> Option<&ChapterOutline> {
        self.chapters.iter().find(|c| c.chapter_number == n)
    }
}

/// A persisted arc row. `arc_number` is the business key (one active arc
/// per job; duplicate inserts from past recovery are tolerated by always
/// reading the latest).
#[derive(Debug, Clone)]
pub struct ArcRecord {
    pub id: i64,
    pub job_id: i64,
    pub arc_number: u32,
    pub arc: StoryArc,
    pub created_at: String,
}

// ── Chapter ───────────────────────────────────────────────────────────

/// A weighted quality review across the six fixed criteria. Each entry in
/// `criteria` holds the criterion's score, evidence quote, and optional fix.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityReview {
    #[serde(default)]
    pub criteria: Map<String, Value>,
    pub weighted_score: f64,
    #[serde(default)]
    pub passed: bool,
    #[serde(default)]
    pub priority_fixes: Vec<String>,
    #[serde(default)]
    pub prose_violations: Vec<String>,
}

/// Non-prose chapter metadata stored alongside the content.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChapterMeta {
    #[serde(default)]
    pub opening_hook: String,
    #[serde(default)]
    pub closing_hook: String,
    #[serde(default)]
    pub key_events: Vec<String>,
    #[serde(default)]
    pub character_development: Option<String>,
    #[serde(flatten)]
    pub extras: Map<String, Value>,
}

/// A persisted chapter. Unique on (job, chapter number).
#[derive(Debug, Clone)]
pub struct Chapter {
    pub id: i64,
    pub job_id: i64,
    pub arc_id: i64,
    pub chapter_number: u8,
    pub title: String,
    pub content: String,
    pub word_count: u32,
    pub quality_score: f64,
    pub quality_review: Option<QualityReview>,
    pub regeneration_count: u32,
    pub metadata: ChapterMeta,
    pub created_at: String,
}

/// Chapter fields produced by the generation stage, before the store
/// assigns an id and timestamps.
#[derive(Debug, Clone)]
pub struct ChapterDraft {
    pub chapter_number: u8,
    pub title: String,
    pub content: String,
    pub quality_score: f64,
    pub quality_review: Option<QualityReview>,
    pub regeneration_count: u32,
    pub metadata: ChapterMeta,
}

impl ChapterDraft {
    pub fn word_count(&self) -> u32 {
        self.content.split_whitespace().count() as u32
    }
}

// ── Checkpoint feedback ───────────────────────────────────────────────

/// Reader-feedback boundary: after chapters 2, 5, and 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Checkpoint {
    #[serde(rename = "chapter_2")]
    Chapter2,
    #[serde(rename = "chapter_5")]
    Chapter5,
    #[serde(rename = "chapter_8")]
    Chapter8,
}

impl Checkpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chapter2 => "chapter_2",
            Self::Chapter5 => "chapter_5",
            Self::Chapter8 => "chapter_8",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "chapter_2" => Ok(Self::Chapter2),
            "chapter_5" => Ok(Self::Chapter5),
            "chapter_8" => Ok(Self::Chapter8),
            other => Err(format!("Unknown checkpoint: {}", other)),
        }
    }

    /// The three-chapter batch unlocked by feedback at this checkpoint.
    pub fn batch(&self) -> (u8, u8) {
        match self {
            Self::Chapter2 => (4, 6),
            Self::Chapter5 => (7, 9),
            Self::Chapter8 => (10, 12),
        }
    }

    /// The checkpoint a job waits on after generating `count` chapters,
    /// if `count` lands on a batch boundary.
    pub fn after_chapters(count: u8) -> Option<Self> {
        match count {
            3 => Some(Self::Chapter2),
            6 => Some(Self::Chapter5),
            9 => Some(Self::Chapter8),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacingSignal {
    Hooked,
    Slow,
    Fast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToneSignal {
    Right,
    Serious,
    Light,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharacterSignal {
    Love,
    Warming,
    NotClicking,
}

/// Structured reader input at a checkpoint. A free-form interview
/// transcript, when present, has already been reduced to the same three
/// dimensions by the intake collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointFeedback {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub job_id: i64,
    pub checkpoint: Checkpoint,
    pub pacing: PacingSignal,
    pub tone: ToneSignal,
    pub character: CharacterSignal,
    #[serde(default)]
    pub reader_quotes: Vec<String>,
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub created_at: String,
}

impl CheckpointFeedback {
    /// True when every dimension reads as "keep doing what you're doing".
    pub fn is_all_neutral(&self) -> bool {
        self.pacing == PacingSignal::Hooked
            && self.tone == ToneSignal::Right
            && self.character == CharacterSignal::Love
    }
}

// ── Editor brief ──────────────────────────────────────────────────────

/// One revised outline from the editor pass: the baseline outline fields
/// with concrete editor beats layered on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisedOutline {
    pub chapter_number: u8,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub events: Option<String>,
    #[serde(default)]
    pub character_focus: Option<String>,
    #[serde(default)]
    pub chapter_hook: Option<String>,
    #[serde(default)]
    pub editor_notes: Vec<String>,
}

/// Per-chapter annotated outlines plus a target prose sample, produced
/// from checkpoint feedback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditorBrief {
    pub revised_outlines: Vec<RevisedOutline>,
    pub style_example: String,
}

impl EditorBrief {
    pub fn outline_for(&self, n: u8) -> Option<&RevisedOutline> {
        self.revised_outlines.iter().find(|o| o.chapter_number == n)
    }
}

// ── Cost records ──────────────────────────────────────────────────────

/// One metered model call.
#[derive(Debug, Clone)]
pub struct CostRecord {
    pub id: i64,
    pub job_id: i64,
    pub operation: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub created_at: String,
}

/// Aggregate spend for a job.
#[derive(Debug, Clone, Default)]
pub struct CostSummary {
    pub total_cost: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub calls: u64,
}
