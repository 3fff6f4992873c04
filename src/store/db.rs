//! SQLite-backed story store.
//!
//! `StoryDb` owns the connection and the schema; `Arc<Mutex<StoryDb>>` is the
//! shared handle the async layers clone. Writes hold the lock only for the
//! duration of one statement group, so progress merges are atomic under the
//! single-connection model.
//!
//! Inserts keyed by a business key (bible per job, arc per (job, number),
//! chapter per (job, number)) are idempotent: `ON CONFLICT DO NOTHING`
//! followed by a re-select, so recovery re-entry returns the existing row
//! instead of duplicating work.

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;
use super::progress::{Progress, ProgressPatch};

pub struct StoryDb {
    conn: Connection,
}

impl StoryDb {
    /// Open (or create) the database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    owner TEXT NOT NULL,
                    premise_ref TEXT NOT NULL,
                    title TEXT NOT NULL,
                    genre TEXT,
                    status TEXT NOT NULL DEFAULT 'active',
                    progress TEXT NOT NULL,
                    bible_ref INTEGER,
                    cover_ref TEXT,
                    reader_profile TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS bibles (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id INTEGER NOT NULL UNIQUE REFERENCES jobs(id) ON DELETE CASCADE,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS arcs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    arc_number INTEGER NOT NULL,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(job_id, arc_number)
                );

                CREATE TABLE IF NOT EXISTS chapters (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    arc_id INTEGER NOT NULL,
                    chapter_number INTEGER NOT NULL,
                    title TEXT NOT NULL,
                    content TEXT NOT NULL,
                    word_count INTEGER NOT NULL,
                    quality_score REAL NOT NULL,
                    quality_review TEXT,
                    regeneration_count INTEGER NOT NULL DEFAULT 0,
                    metadata TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(job_id, chapter_number)
                );

                CREATE TABLE IF NOT EXISTS feedback (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    checkpoint TEXT NOT NULL,
                    pacing TEXT NOT NULL,
                    tone TEXT NOT NULL,
                    character TEXT NOT NULL,
                    reader_quotes TEXT NOT NULL DEFAULT '[]',
                    transcript TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS cost_records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    operation TEXT NOT NULL,
                    model TEXT NOT NULL,
                    input_tokens INTEGER NOT NULL,
                    output_tokens INTEGER NOT NULL,
                    cost REAL NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                CREATE INDEX IF NOT EXISTS idx_chapters_job ON chapters(job_id, chapter_number);
                CREATE INDEX IF NOT EXISTS idx_feedback_job ON feedback(job_id);
                CREATE INDEX IF NOT EXISTS idx_cost_records_job ON cost_records(job_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    /// Create the job row the moment a premise is selected, before any
    /// model call, with initial progress `generating_bible`.
    pub fn create_job(
        &self,
        owner: &str,
        premise_ref: &str,
        title: &str,
        genre: Option<&str>,
        profile: &ReaderProfile,
    ) -> Result<Job> {
        let progress =
            serde_json::to_string(&Progress::initial()).context("Failed to encode progress")?;
        let profile_json =
            serde_json::to_string(profile).context("Failed to encode reader profile")?;
        self.conn
            .execute(
                "INSERT INTO jobs (owner, premise_ref, title, genre, status, progress, reader_profile)
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6)",
                params![owner, premise_ref, title, genre, progress, profile_json],
            )
            .context("Failed to insert job")?;
        let id = self.conn.last_insert_rowid();
        self.get_job(id)?.context("Job not found after insert")
    }

    pub fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, owner, premise_ref, title, genre, status, progress, bible_ref,
                        cover_ref, reader_profile, created_at, updated_at
                 FROM jobs WHERE id = ?1",
            )
            .context("Failed to prepare get_job")?;
        let row = stmt
            .query_row(params![id], JobRow::from_row)
            .optional()
            .context("Failed to query job")?;
        match row {
            Some(r) => Ok(Some(r.into_job()?)),
            None => Ok(None),
        }
    }

    pub fn set_job_status(&self, id: i64, status: JobStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE jobs SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update job status")?;
        Ok(())
    }

    pub fn set_bible_ref(&self, id: i64, bible_id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE jobs SET bible_ref = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![bible_id, id],
            )
            .context("Failed to update bible ref")?;
        Ok(())
    }

    pub fn set_cover_ref(&self, id: i64, cover_ref: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE jobs SET cover_ref = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![cover_ref, id],
            )
            .context("Failed to update cover ref")?;
        Ok(())
    }

    /// Merge a patch into the job's progress document and bump its
    /// `last_updated`. Returns the merged progress.
    pub fn update_progress(&self, id: i64, patch: &ProgressPatch) -> Result<Progress> {
        let raw: String = self
            .conn
            .query_row("SELECT progress FROM jobs WHERE id = ?1", params![id], |r| {
                r.get(0)
            })
            .context("Job not found for progress update")?;
        let mut progress: Progress =
            serde_json::from_str(&raw).context("Failed to decode stored progress")?;
        patch.apply(&mut progress);
        let encoded = serde_json::to_string(&progress).context("Failed to encode progress")?;
        self.conn
            .execute(
                "UPDATE jobs SET progress = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![encoded, id],
            )
            .context("Failed to write progress")?;
        Ok(progress)
    }

    /// Overwrite the stored progress document verbatim. Test hook for
    /// simulating stale or drifted state.
    #[cfg(test)]
    pub fn raw_set_progress(&self, id: i64, progress_json: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE jobs SET progress = ?1 WHERE id = ?2",
                params![progress_json, id],
            )
            .context("Failed to write raw progress")?;
        Ok(())
    }

    /// Drop the recovery lease. Runs on both success and failure exit paths.
    pub fn clear_recovery_lock(&self, id: i64) -> Result<()> {
        self.update_progress(id, &ProgressPatch::new().release_lock())?;
        Ok(())
    }

    /// Jobs the health sweeper should look at: anything errored plus every
    /// active job (staleness is judged against the progress document, which
    /// lives inside the JSON column, so that filter happens in the caller).
    pub fn sweep_candidates(&self) -> Result<Vec<Job>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, owner, premise_ref, title, genre, status, progress, bible_ref,
                        cover_ref, reader_profile, created_at, updated_at
                 FROM jobs WHERE status IN ('active', 'error') ORDER BY id",
            )
            .context("Failed to prepare sweep_candidates")?;
        let rows = stmt
            .query_map([], JobRow::from_row)
            .context("Failed to query sweep candidates")?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read job row")?.into_job()?);
        }
        Ok(jobs)
    }

    // ── Bibles ────────────────────────────────────────────────────────

    /// Insert the job's bible; if one already exists, return the existing
    /// row unchanged.
    pub fn insert_bible(&self, job_id: i64, bible: &Bible) -> Result<BibleRecord> {
        let content = serde_json::to_string(bible).context("Failed to encode bible")?;
        self.conn
            .execute(
                "INSERT INTO bibles (job_id, content) VALUES (?1, ?2)
                 ON CONFLICT(job_id) DO NOTHING",
                params![job_id, content],
            )
            .context("Failed to insert bible")?;
        self.get_bible(job_id)?
            .context("Bible not found after insert")
    }

    pub fn get_bible(&self, job_id: i64) -> Result<Option<BibleRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, job_id, content, created_at FROM bibles WHERE job_id = ?1")
            .context("Failed to prepare get_bible")?;
        let row = stmt
            .query_row(params![job_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .optional()
            .context("Failed to query bible")?;
        match row {
            Some((id, job_id, content, created_at)) => Ok(Some(BibleRecord {
                id,
                job_id,
                bible: serde_json::from_str(&content).context("Failed to decode bible")?,
                created_at,
            })),
            None => Ok(None),
        }
    }

    // ── Arcs ──────────────────────────────────────────────────────────

    /// Insert an arc keyed on (job, arc number); an existing row wins.
    pub fn insert_arc(&self, job_id: i64, arc_number: u32, arc: &StoryArc) -> Result<ArcRecord> {
        let content = serde_json::to_string(arc).context("Failed to encode arc")?;
        self.conn
            .execute(
                "INSERT INTO arcs (job_id, arc_number, content) VALUES (?1, ?2, ?3)
                 ON CONFLICT(job_id, arc_number) DO NOTHING",
                params![job_id, arc_number, content],
            )
            .context("Failed to insert arc")?;
        self.latest_arc(job_id)?.context("Arc not found after insert")
    }

    /// Most recently created arc for the job. Tolerates duplicate inserts
    /// from past recovery by always picking the newest.
    pub fn latest_arc(&self, job_id: i64) -> Result<Option<ArcRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, job_id, arc_number, content, created_at
                 FROM arcs WHERE job_id = ?1 ORDER BY id DESC LIMIT 1",
            )
            .context("Failed to prepare latest_arc")?;
        let row = stmt
            .query_row(params![job_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .optional()
            .context("Failed to query arc")?;
        match row {
            Some((id, job_id, arc_number, content, created_at)) => Ok(Some(ArcRecord {
                id,
                job_id,
                arc_number,
                arc: serde_json::from_str(&content).context("Failed to decode arc")?,
                created_at,
            })),
            None => Ok(None),
        }
    }

    // ── Chapters ──────────────────────────────────────────────────────

    /// Insert a finished chapter; a chapter already stored under the same
    /// number is returned unchanged.
    pub fn insert_chapter(&self, job_id: i64, arc_id: i64, draft: &ChapterDraft) -> Result<Chapter> {
        let review = match &draft.quality_review {
            Some(r) => Some(serde_json::to_string(r).context("Failed to encode review")?),
            None => None,
        };
        let metadata =
            serde_json::to_string(&draft.metadata).context("Failed to encode chapter metadata")?;
        self.conn
            .execute(
                "INSERT INTO chapters (job_id, arc_id, chapter_number, title, content, word_count,
                                       quality_score, quality_review, regeneration_count, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(job_id, chapter_number) DO NOTHING",
                params![
                    job_id,
                    arc_id,
                    draft.chapter_number,
                    draft.title,
                    draft.content,
                    draft.word_count(),
                    draft.quality_score,
                    review,
                    draft.regeneration_count,
                    metadata
                ],
            )
            .context("Failed to insert chapter")?;
        self.get_chapter(job_id, draft.chapter_number)?
            .context("Chapter not found after insert")
    }

    pub fn get_chapter(&self, job_id: i64, n: u8) -> Result<Option<Chapter>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, job_id, arc_id, chapter_number, title, content, word_count,
                        quality_score, quality_review, regeneration_count, metadata, created_at
                 FROM chapters WHERE job_id = ?1 AND chapter_number = ?2",
            )
            .context("Failed to prepare get_chapter")?;
        let row = stmt
            .query_row(params![job_id, n], ChapterRow::from_row)
            .optional()
            .context("Failed to query chapter")?;
        match row {
            Some(r) => Ok(Some(r.into_chapter()?)),
            None => Ok(None),
        }
    }

    /// Replace a chapter's stored metadata (post-processing enrichment).
    pub fn update_chapter_metadata(&self, job_id: i64, n: u8, metadata: &ChapterMeta) -> Result<()> {
        let encoded =
            serde_json::to_string(metadata).context("Failed to encode chapter metadata")?;
        self.conn
            .execute(
                "UPDATE chapters SET metadata = ?1 WHERE job_id = ?2 AND chapter_number = ?3",
                params![encoded, job_id, n],
            )
            .context("Failed to update chapter metadata")?;
        Ok(())
    }

    /// Update a chapter's prose in place (post-processing rewrites).
    pub fn update_chapter_content(&self, job_id: i64, n: u8, content: &str) -> Result<()> {
        let word_count = content.split_whitespace().count() as u32;
        self.conn
            .execute(
                "UPDATE chapters SET content = ?1, word_count = ?2
                 WHERE job_id = ?3 AND chapter_number = ?4",
                params![content, word_count, job_id, n],
            )
            .context("Failed to update chapter content")?;
        Ok(())
    }

    /// The last `window` chapters before `n`, ordered ascending.
    pub fn previous_chapters(&self, job_id: i64, n: u8, window: u8) -> Result<Vec<Chapter>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, job_id, arc_id, chapter_number, title, content, word_count,
                        quality_score, quality_review, regeneration_count, metadata, created_at
                 FROM chapters WHERE job_id = ?1 AND chapter_number < ?2
                 ORDER BY chapter_number DESC LIMIT ?3",
            )
            .context("Failed to prepare previous_chapters")?;
        let rows = stmt
            .query_map(params![job_id, n, window], ChapterRow::from_row)
            .context("Failed to query previous chapters")?;
        let mut chapters = Vec::new();
        for row in rows {
            chapters.push(row.context("Failed to read chapter row")?.into_chapter()?);
        }
        chapters.reverse();
        Ok(chapters)
    }

    /// Count of persisted chapters; the drift check compares this against
    /// `Progress.chapters_generated`.
    pub fn chapter_count(&self, job_id: i64) -> Result<u8> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM chapters WHERE job_id = ?1",
                params![job_id],
                |r| r.get(0),
            )
            .context("Failed to count chapters")?;
        Ok(count as u8)
    }

    // ── Feedback ──────────────────────────────────────────────────────

    pub fn insert_feedback(&self, fb: &CheckpointFeedback) -> Result<CheckpointFeedback> {
        let quotes =
            serde_json::to_string(&fb.reader_quotes).context("Failed to encode reader quotes")?;
        self.conn
            .execute(
                "INSERT INTO feedback (job_id, checkpoint, pacing, tone, character, reader_quotes, transcript)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    fb.job_id,
                    fb.checkpoint.as_str(),
                    signal_str(&serde_json::to_value(fb.pacing).unwrap_or_default()),
                    signal_str(&serde_json::to_value(fb.tone).unwrap_or_default()),
                    signal_str(&serde_json::to_value(fb.character).unwrap_or_default()),
                    quotes,
                    fb.transcript
                ],
            )
            .context("Failed to insert feedback")?;
        let id = self.conn.last_insert_rowid();
        let mut stored = fb.clone();
        stored.id = id;
        Ok(stored)
    }

    /// All feedback for the job, oldest first.
    pub fn feedback_for_job(&self, job_id: i64) -> Result<Vec<CheckpointFeedback>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, job_id, checkpoint, pacing, tone, character, reader_quotes, transcript, created_at
                 FROM feedback WHERE job_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare feedback_for_job")?;
        let rows = stmt
            .query_map(params![job_id], FeedbackRow::from_row)
            .context("Failed to query feedback")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read feedback row")?.into_feedback()?);
        }
        Ok(out)
    }

    /// Whether a feedback row exists for the given checkpoint — the
    /// prerequisite the sweeper's race-condition guard checks before
    /// triggering a batch.
    pub fn has_feedback(&self, job_id: i64, checkpoint: Checkpoint) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM feedback WHERE job_id = ?1 AND checkpoint = ?2",
                params![job_id, checkpoint.as_str()],
                |r| r.get(0),
            )
            .context("Failed to count feedback")?;
        Ok(count > 0)
    }

    // ── Cost records ──────────────────────────────────────────────────

    pub fn insert_cost_record(
        &self,
        job_id: i64,
        operation: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO cost_records (job_id, operation, model, input_tokens, output_tokens, cost)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![job_id, operation, model, input_tokens, output_tokens, cost],
            )
            .context("Failed to insert cost record")?;
        Ok(())
    }

    pub fn cost_records(&self, job_id: i64) -> Result<Vec<CostRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, job_id, operation, model, input_tokens, output_tokens, cost, created_at
                 FROM cost_records WHERE job_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare cost_records")?;
        let rows = stmt
            .query_map(params![job_id], |row| {
                Ok(CostRecord {
                    id: row.get(0)?,
                    job_id: row.get(1)?,
                    operation: row.get(2)?,
                    model: row.get(3)?,
                    input_tokens: row.get::<_, i64>(4)? as u64,
                    output_tokens: row.get::<_, i64>(5)? as u64,
                    cost: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })
            .context("Failed to query cost records")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read cost record row")?);
        }
        Ok(out)
    }

    pub fn cost_summary(&self, job_id: i64) -> Result<CostSummary> {
        self.conn
            .query_row(
                "SELECT COALESCE(SUM(cost), 0), COALESCE(SUM(input_tokens), 0),
                        COALESCE(SUM(output_tokens), 0), COUNT(*)
                 FROM cost_records WHERE job_id = ?1",
                params![job_id],
                |row| {
                    Ok(CostSummary {
                        total_cost: row.get(0)?,
                        total_input_tokens: row.get::<_, i64>(1)? as u64,
                        total_output_tokens: row.get::<_, i64>(2)? as u64,
                        calls: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .context("Failed to summarise cost records")
    }
}

/// Render an enum's serde string form without the surrounding quotes.
fn signal_str(v: &serde_json::Value) -> String {
    v.as_str().unwrap_or_default().to_string()
}

// ── Internal row helpers ──────────────────────────────────────────────

/// Intermediate row for jobs before JSON columns are decoded.
struct JobRow {
    id: i64,
    owner: String,
    premise_ref: String,
    title: String,
    genre: Option<String>,
    status: String,
    progress: String,
    bible_ref: Option<i64>,
    cover_ref: Option<String>,
    reader_profile: String,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner: row.get(1)?,
            premise_ref: row.get(2)?,
            title: row.get(3)?,
            genre: row.get(4)?,
            status: row.get(5)?,
            progress: row.get(6)?,
            bible_ref: row.get(7)?,
            cover_ref: row.get(8)?,
            reader_profile: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let status = JobStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse job status")?;
        let progress: Progress =
            serde_json::from_str(&self.progress).context("Failed to parse job progress")?;
        let reader_profile: ReaderProfile = serde_json::from_str(&self.reader_profile)
            .context("Failed to parse reader profile")?;
        Ok(Job {
            id: self.id,
            owner: self.owner,
            premise_ref: self.premise_ref,
            title: self.title,
            genre: self.genre,
            status,
            progress,
            bible_ref: self.bible_ref,
            cover_ref: self.cover_ref,
            reader_profile,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Intermediate row for chapters.
struct ChapterRow {
    id: i64,
    job_id: i64,
    arc_id: i64,
    chapter_number: u8,
    title: String,
    content: String,
    word_count: u32,
    quality_score: f64,
    quality_review: Option<String>,
    regeneration_count: u32,
    metadata: String,
    created_at: String,
}

impl ChapterRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_id: row.get(1)?,
            arc_id: row.get(2)?,
            chapter_number: row.get(3)?,
            title: row.get(4)?,
            content: row.get(5)?,
            word_count: row.get(6)?,
            quality_score: row.get(7)?,
            quality_review: row.get(8)?,
            regeneration_count: row.get(9)?,
            metadata: row.get(10)?,
            created_at: row.get(11)?,
        })
    }

    fn into_chapter(self) -> Result<Chapter> {
        let quality_review = match self.quality_review {
            Some(raw) => {
                Some(serde_json::from_str(&raw).context("Failed to parse quality review")?)
            }
            None => None,
        };
        let metadata: ChapterMeta =
            serde_json::from_str(&self.metadata).context("Failed to parse chapter metadata")?;
        Ok(Chapter {
            id: self.id,
            job_id: self.job_id,
            arc_id: self.arc_id,
            chapter_number: self.chapter_number,
            title: self.title,
            content: self.content,
            word_count: self.word_count,
            quality_score: self.quality_score,
            quality_review,
            regeneration_count: self.regeneration_count,
            metadata,
            created_at: self.created_at,
        })
    }
}

/// Intermediate row for feedback.
struct FeedbackRow {
    id: i64,
    job_id: i64,
    checkpoint: String,
    pacing: String,
    tone: String,
    character: String,
    reader_quotes: String,
    transcript: Option<String>,
    created_at: String,
}

impl FeedbackRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_id: row.get(1)?,
            checkpoint: row.get(2)?,
            pacing: row.get(3)?,
            tone: row.get(4)?,
            character: row.get(5)?,
            reader_quotes: row.get(6)?,
            transcript: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn into_feedback(self) -> Result<CheckpointFeedback> {
        let checkpoint = Checkpoint::from_str(&self.checkpoint)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse checkpoint")?;
        let pacing: PacingSignal =
            serde_json::from_value(serde_json::Value::String(self.pacing))
                .context("Failed to parse pacing signal")?;
        let tone: ToneSignal = serde_json::from_value(serde_json::Value::String(self.tone))
            .context("Failed to parse tone signal")?;
        let character: CharacterSignal =
            serde_json::from_value(serde_json::Value::String(self.character))
                .context("Failed to parse character signal")?;
        let reader_quotes: Vec<String> =
            serde_json::from_str(&self.reader_quotes).context("Failed to parse reader quotes")?;
        Ok(CheckpointFeedback {
            id: self.id,
            job_id: self.job_id,
            checkpoint,
            pacing,
            tone,
            character,
            reader_quotes,
            transcript: self.transcript,
            created_at: self.created_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
