//! Progress record and step tags for a job.
//!
//! `Progress` is stored as a JSON document on the job row and is the single
//! source of truth for resume decisions. Steps serialize to the snake_case
//! strings the health sweeper filters on (`generating_*` prefix), including
//! the legacy `chapter_N_complete` form older writers left behind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::models::Checkpoint;

/// Where a job currently sits in the bible → arc → chapters chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    GeneratingBible,
    BibleCreated,
    GeneratingArc,
    ArcCreated,
    GeneratingChapter(u8),
    AwaitingFeedback(Checkpoint),
    Completed,
    GenerationFailed,
    BibleGenerationFailed,
    PermanentlyFailed,
    /// Legacy tag from older writers; rewritten by the sweeper's orphan repair.
    ChapterComplete(u8),
}

impl Step {
    pub fn as_str(&self) -> String {
        match self {
            Self::GeneratingBible => "generating_bible".to_string(),
            Self::BibleCreated => "bible_created".to_string(),
            Self::GeneratingArc => "generating_arc".to_string(),
            Self::ArcCreated => "arc_created".to_string(),
            Self::GeneratingChapter(n) => format!("generating_chapter_{}", n),
            Self::AwaitingFeedback(cp) => format!("awaiting_{}_feedback", cp.as_str()),
            Self::Completed => "completed".to_string(),
            Self::GenerationFailed => "generation_failed".to_string(),
            Self::BibleGenerationFailed => "bible_generation_failed".to_string(),
            Self::PermanentlyFailed => "permanently_failed".to_string(),
            Self::ChapterComplete(n) => format!("chapter_{}_complete", n),
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "generating_bible" => return Ok(Self::GeneratingBible),
            "bible_created" => return Ok(Self::BibleCreated),
            "generating_arc" => return Ok(Self::GeneratingArc),
            "arc_created" => return Ok(Self::ArcCreated),
            "completed" => return Ok(Self::Completed),
            "generation_failed" => return Ok(Self::GenerationFailed),
            "bible_generation_failed" => return Ok(Self::BibleGenerationFailed),
            "permanently_failed" => return Ok(Self::PermanentlyFailed),
            _ => {}
        }
        if let Some(rest) = s.strip_prefix("generating_chapter_") {
            let n: u8 = rest.parse().map_err(|_| format!("Bad step tag: {}", s))?;
            return Ok(Self::GeneratingChapter(n));
        }
        if let Some(rest) = s.strip_prefix("awaiting_") {
            if let Some(cp) = rest.strip_suffix("_feedback") {
                return Ok(Self::AwaitingFeedback(Checkpoint::from_str(cp)?));
            }
        }
        if let Some(rest) = s.strip_prefix("chapter_") {
            if let Some(n) = rest.strip_suffix("_complete") {
                let n: u8 = n.parse().map_err(|_| format!("Bad step tag: {}", s))?;
                return Ok(Self::ChapterComplete(n));
            }
        }
        Err(format!("Unknown step tag: {}", s))
    }

    /// True for any in-flight generation tag (`generating_*`).
    pub fn is_generating(&self) -> bool {
        matches!(
            self,
            Self::GeneratingBible | Self::GeneratingArc | Self::GeneratingChapter(_)
        )
    }

    /// True when a stalled *active* job at this step may be reclaimed: a
    /// mid-pipeline crash can strand any `generating_*` tag or one of the
    /// transitional created/failed tags.
    pub fn is_recoverable(&self) -> bool {
        self.is_generating()
            || matches!(
                self,
                Self::BibleCreated
                    | Self::ArcCreated
                    | Self::BibleGenerationFailed
                    | Self::GenerationFailed
            )
    }

    /// True for states the sweeper never touches.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::PermanentlyFailed)
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for Step {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_str())
    }
}

impl<'de> Deserialize<'de> for Step {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Step::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// The structured progress record attached to a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    #[serde(default)]
    pub bible_complete: bool,
    #[serde(default)]
    pub arc_complete: bool,
    #[serde(default)]
    pub chapters_generated: u8,
    pub current_step: Step,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub health_check_retries: u32,
    #[serde(default)]
    pub repeated_error: bool,
    /// Recovery-lock lease: set while a sweeper-dispatched (or pipeline)
    /// task owns the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_start: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_end: Option<u8>,
    /// Frozen log-buffer snapshot captured on terminal failure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_logs: Vec<String>,
    #[serde(flatten)]
    pub extras: serde_json::Map<String, serde_json::Value>,
}

impl Progress {
    /// Initial progress written the moment a premise is selected.
    pub fn initial() -> Self {
        Self {
            bible_complete: false,
            arc_complete: false,
            chapters_generated: 0,
            current_step: Step::GeneratingBible,
            last_updated: Utc::now(),
            last_error: None,
            last_error_at: None,
            retry_count: 0,
            health_check_retries: 0,
            repeated_error: false,
            recovery_started: None,
            batch_start: None,
            batch_end: None,
            error_logs: Vec::new(),
            extras: serde_json::Map::new(),
        }
    }

    /// Age of the last progress touch, in seconds.
    pub fn staleness_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_updated).num_seconds()
    }

    /// True when the recovery lock was taken within `lock_secs` of `now`.
    pub fn lock_held(&self, now: DateTime<Utc>, lock_secs: i64) -> bool {
        match self.recovery_started {
            Some(started) => (now - started).num_seconds() < lock_secs,
            None => false,
        }
    }

    pub fn batch(&self) -> Option<(u8, u8)> {
        match (self.batch_start, self.batch_end) {
            (Some(start), Some(end)) => Some((start, end)),
            _ => None,
        }
    }
}

/// A partial update merged atomically into a job's progress.
///
/// `None` leaves a field untouched; the `clear_*` flags remove optional
/// fields. `chapters_generated` only ever moves forward (recovery must not
/// regress it).
#[derive(Debug, Clone, Default)]
pub struct ProgressPatch {
    pub bible_complete: Option<bool>,
    pub arc_complete: Option<bool>,
    pub chapters_generated: Option<u8>,
    pub current_step: Option<Step>,
    pub last_error: Option<String>,
    pub clear_last_error: bool,
    pub retry_count: Option<u32>,
    pub health_check_retries: Option<u32>,
    pub repeated_error: Option<bool>,
    pub recovery_started: Option<DateTime<Utc>>,
    pub clear_recovery_lock: bool,
    pub batch: Option<(u8, u8)>,
    pub clear_batch: bool,
    pub error_logs: Option<Vec<String>>,
}

impl ProgressPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(mut self, step: Step) -> Self {
        self.current_step = Some(step);
        self
    }

    pub fn bible_complete(mut self, done: bool) -> Self {
        self.bible_complete = Some(done);
        self
    }

    pub fn arc_complete(mut self, done: bool) -> Self {
        self.arc_complete = Some(done);
        self
    }

    pub fn chapters_generated(mut self, n: u8) -> Self {
        self.chapters_generated = Some(n);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.last_error = Some(message.into());
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.clear_last_error = true;
        self
    }

    pub fn retry_count(mut self, n: u32) -> Self {
        self.retry_count = Some(n);
        self
    }

    pub fn health_check_retries(mut self, n: u32) -> Self {
        self.health_check_retries = Some(n);
        self
    }

    pub fn repeated_error(mut self, v: bool) -> Self {
        self.repeated_error = Some(v);
        self
    }

    pub fn acquire_lock(mut self, at: DateTime<Utc>) -> Self {
        self.recovery_started = Some(at);
        self
    }

    pub fn release_lock(mut self) -> Self {
        self.clear_recovery_lock = true;
        self
    }

    pub fn batch(mut self, start: u8, end: u8) -> Self {
        self.batch = Some((start, end));
        self
    }

    pub fn clear_batch(mut self) -> Self {
        self.clear_batch = true;
        self
    }

    pub fn error_logs(mut self, lines: Vec<String>) -> Self {
        self.error_logs = Some(lines);
        self
    }

    /// Merge into `progress`, bumping `last_updated`.
    pub fn apply(&self, progress: &mut Progress) {
        if let Some(v) = self.bible_complete {
            progress.bible_complete = v;
        }
        if let Some(v) = self.arc_complete {
            progress.arc_complete = v;
        }
        if let Some(v) = self.chapters_generated {
            progress.chapters_generated = progress.chapters_generated.max(v);
        }
        if let Some(step) = self.current_step {
            progress.current_step = step;
        }
        if self.clear_last_error {
            progress.last_error = None;
            progress.last_error_at = None;
        }
        if let Some(ref e) = self.last_error {
            progress.last_error = Some(e.clone());
            progress.last_error_at = Some(Utc::now());
        }
        if let Some(v) = self.retry_count {
            progress.retry_count = v;
        }
        if let Some(v) = self.health_check_retries {
            progress.health_check_retries = v;
        }
        if let Some(v) = self.repeated_error {
            progress.repeated_error = v;
        }
        if self.clear_recovery_lock {
            progress.recovery_started = None;
        }
        if let Some(at) = self.recovery_started {
            progress.recovery_started = Some(at);
        }
        if self.clear_batch {
            progress.batch_start = None;
            progress.batch_end = None;
        }
        if let Some((start, end)) = self.batch {
            progress.batch_start = Some(start);
            progress.batch_end = Some(end);
        }
        if let Some(ref lines) = self.error_logs {
            progress.error_logs = lines.clone();
        }
        progress.last_updated = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_string_round_trip() {
        let steps = [
            Step::GeneratingBible,
            Step::BibleCreated,
            Step::GeneratingArc,
            Step::ArcCreated,
            Step::GeneratingChapter(7),
            Step::AwaitingFeedback(Checkpoint::Chapter5),
            Step::Completed,
            Step::GenerationFailed,
            Step::BibleGenerationFailed,
            Step::PermanentlyFailed,
            Step::ChapterComplete(3),
        ];
        for step in steps {
            assert_eq!(Step::parse(&step.as_str()).unwrap(), step);
        }
    }

    #[test]
    fn test_step_tag_spellings() {
        assert_eq!(Step::GeneratingChapter(3).as_str(), "generating_chapter_3");
        assert_eq!(
            Step::AwaitingFeedback(Checkpoint::Chapter2).as_str(),
            "awaiting_chapter_2_feedback"
        );
        assert_eq!(Step::ChapterComplete(6).as_str(), "chapter_6_complete");
    }

    #[test]
    fn test_step_parse_rejects_garbage() {
        assert!(Step::parse("generating_chapter_x").is_err());
        assert!(Step::parse("awaiting_chapter_3_feedback").is_err());
        assert!(Step::parse("resting").is_err());
    }

    #[test]
    fn test_step_classification() {
        assert!(Step::GeneratingChapter(1).is_generating());
        assert!(!Step::BibleCreated.is_generating());
        assert!(Step::BibleCreated.is_recoverable());
        assert!(Step::GenerationFailed.is_recoverable());
        assert!(!Step::AwaitingFeedback(Checkpoint::Chapter2).is_recoverable());
        assert!(Step::Completed.is_terminal());
        assert!(Step::PermanentlyFailed.is_terminal());
        assert!(!Step::ArcCreated.is_terminal());
    }

    #[test]
    fn test_progress_serde_round_trip() {
        let mut progress = Progress::initial();
        progress.chapters_generated = 4;
        progress.current_step = Step::GeneratingChapter(5);
        progress.batch_start = Some(4);
        progress.batch_end = Some(6);
        let json = serde_json::to_string(&progress).unwrap();
        assert!(json.contains("\"generating_chapter_5\""));
        let back: Progress = serde_json::from_str(&json).unwrap();
        assert_eq!(back.chapters_generated, 4);
        assert_eq!(back.current_step, Step::GeneratingChapter(5));
        assert_eq!(back.batch(), Some((4, 6)));
    }

    #[test]
    fn test_patch_never_regresses_chapter_count() {
        let mut progress = Progress::initial();
        progress.chapters_generated = 6;
        ProgressPatch::new().chapters_generated(3).apply(&mut progress);
        assert_eq!(progress.chapters_generated, 6);
        ProgressPatch::new().chapters_generated(7).apply(&mut progress);
        assert_eq!(progress.chapters_generated, 7);
    }

    #[test]
    fn test_patch_error_sets_timestamp_and_clear_removes_it() {
        let mut progress = Progress::initial();
        ProgressPatch::new().error("boom").apply(&mut progress);
        assert_eq!(progress.last_error.as_deref(), Some("boom"));
        assert!(progress.last_error_at.is_some());

        ProgressPatch::new().clear_error().apply(&mut progress);
        assert!(progress.last_error.is_none());
        assert!(progress.last_error_at.is_none());
    }

    #[test]
    fn test_patch_lock_lifecycle() {
        let mut progress = Progress::initial();
        let now = Utc::now();
        ProgressPatch::new().acquire_lock(now).apply(&mut progress);
        assert!(progress.lock_held(now, 1200));
        assert!(!progress.lock_held(now + chrono::Duration::seconds(1300), 1200));

        ProgressPatch::new().release_lock().apply(&mut progress);
        assert!(!progress.lock_held(now, 1200));
    }

    #[test]
    fn test_patch_batch_markers() {
        let mut progress = Progress::initial();
        ProgressPatch::new().batch(7, 9).apply(&mut progress);
        assert_eq!(progress.batch(), Some((7, 9)));
        ProgressPatch::new().clear_batch().apply(&mut progress);
        assert_eq!(progress.batch(), None);
    }

    #[test]
    fn test_unknown_progress_keys_survive() {
        let json = r#"{
            "current_step": "generating_bible",
            "last_updated": "2026-01-05T00:00:00Z",
            "legacy_field": 42
        }"#;
        let progress: Progress = serde_json::from_str(json).unwrap();
        assert_eq!(progress.extras["legacy_field"], 42);
        let back = serde_json::to_string(&progress).unwrap();
        assert!(back.contains("legacy_field"));
    }
}
