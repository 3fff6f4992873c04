//! Generation stages: bible, arc, and chapter, plus the deterministic prose
//! scan, the weighted rubric, and the best-effort post-processing passes.
//!
//! Stages are plain async functions over a shared `StageCtx`. They raise on
//! failure; status transitions and retry policy belong to the step-retry
//! wrapper and the pipeline scope above them.

pub mod arc;
pub mod bible;
pub mod chapter;
pub mod post;
pub mod prose;
pub mod review;

use std::sync::{Arc, MutexGuard};

use crate::config::StoryConfig;
use crate::logbuf::LogBuffers;
use crate::model::ModelClient;
use crate::store::{SharedDb, StoryDb};

/// Everything a stage needs: the store, the model client, the per-job log
/// buffers, configuration, and the cover-task registry.
#[derive(Clone)]
pub struct StageCtx {
    pub db: SharedDb,
    pub client: Arc<ModelClient>,
    pub logs: LogBuffers,
    pub config: StoryConfig,
    pub covers: crate::cover::CoverTasks,
}

impl StageCtx {
    pub fn new(
        db: SharedDb,
        client: Arc<ModelClient>,
        logs: LogBuffers,
        config: StoryConfig,
    ) -> Self {
        Self {
            db,
            client,
            logs,
            config,
            covers: crate::cover::new_registry(),
        }
    }

    /// Short-lived store guard. Never held across an await point.
    pub fn db(&self) -> MutexGuard<'_, StoryDb> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// Re-exports for the orchestration layer.
pub use arc::run_arc_stage;
pub use bible::run_bible_stage;
pub use chapter::run_chapter_stage;

#[cfg(test)]
pub(crate) mod testctx {
    use super::*;
    use crate::model::testing::ScriptedApi;
    use crate::store::{self, Job, ReaderProfile};

    /// In-memory context plus the scripted upstream, ready for stage tests.
    pub(crate) fn scripted() -> (StageCtx, Arc<ScriptedApi>) {
        let db = store::shared(StoryDb::new_in_memory().unwrap());
        let logs = LogBuffers::new();
        let config = StoryConfig::for_tests();
        let api = Arc::new(ScriptedApi::new());
        let client = Arc::new(ModelClient::new(
            api.clone(),
            db.clone(),
            logs.clone(),
            &config,
        ));
        (StageCtx::new(db, client, logs, config), api)
    }

    pub(crate) fn make_job(ctx: &StageCtx) -> Job {
        ctx.db()
            .create_job(
                "reader-1",
                "premise-1",
                "The Moon-Bell",
                Some("cozy fantasy"),
                &ReaderProfile::default(),
            )
            .unwrap()
    }
}
