//! Per-job ring buffers of recent log lines.
//!
//! Every job-scoped narrative line is printed to stdout in the
//! `[job-title] <tag> <event>` shape and also buffered (last 75 lines) so a
//! terminal failure can freeze the tail into `Progress.error_logs`. Buffers
//! idle for 30 minutes are dropped by a background purger whose handle the
//! engine keeps for teardown, so the timer never delays shutdown.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;

/// Emoji tags used in job log lines.
pub mod tags {
    pub const BIBLE: &str = "📖";
    pub const ARC: &str = "🗺️";
    pub const CHAPTER: &str = "✍️";
    pub const REVIEW: &str = "🔍";
    pub const EDITOR: &str = "📝";
    pub const HEALTH: &str = "🩺";
    pub const COST: &str = "💰";
    pub const COVER: &str = "🎨";
    pub const RETRY: &str = "🔁";
    pub const DONE: &str = "✅";
    pub const FAIL: &str = "❌";
}

const MAX_LINES: usize = 75;
const IDLE_PURGE: Duration = Duration::from_secs(30 * 60);
const PURGE_INTERVAL: Duration = Duration::from_secs(5 * 60);

struct JobBuffer {
    lines: VecDeque<String>,
    last_activity: Instant,
}

impl JobBuffer {
    fn new() -> Self {
        Self {
            lines: VecDeque::with_capacity(MAX_LINES),
            last_activity: Instant::now(),
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == MAX_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
        self.last_activity = Instant::now();
    }
}

/// Process-local map from job id to its ring buffer. Single writer per job
/// by construction: only the task currently executing that job logs to it.
#[derive(Clone)]
pub struct LogBuffers {
    inner: Arc<Mutex<HashMap<i64, JobBuffer>>>,
}

impl LogBuffers {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record one job-scoped event and echo it to stdout.
    pub fn log(&self, job_id: i64, job_title: &str, tag: &str, event: &str) {
        let line = format!("[{}] {} {}", job_title, tag, event);
        println!("{}", line);
        let stamped = format!("{} {}", Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"), line);
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(job_id).or_insert_with(JobBuffer::new).push(stamped);
    }

    /// The buffered tail for a job, oldest first.
    pub fn snapshot(&self, job_id: i64) -> Vec<String> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get(&job_id)
            .map(|b| b.lines.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop a job's buffer (on successful completion).
    pub fn free(&self, job_id: i64) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(&job_id);
    }

    /// Remove buffers idle for longer than `max_idle`; returns how many.
    pub fn purge_idle(&self, max_idle: Duration) -> usize {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = map.len();
        map.retain(|_, buf| buf.last_activity.elapsed() < max_idle);
        before - map.len()
    }

    /// Spawn the background purger. The caller owns the handle and aborts
    /// it on teardown.
    pub fn spawn_purger(&self) -> tokio::task::JoinHandle<()> {
        let buffers = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PURGE_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let purged = buffers.purge_idle(IDLE_PURGE);
                if purged > 0 {
                    tracing::debug!(purged, "purged idle job log buffers");
                }
            }
        })
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

impl Default for LogBuffers {
    fn default() -> Self {
        Self::new()
    }
}
