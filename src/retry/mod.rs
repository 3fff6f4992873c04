//! Bounded retry around a pipeline stage, with a same-error circuit breaker.
//!
//! `retry_step` runs a stage up to `max_retries + 1` times, backing off
//! `attempt x backoff` between tries and writing the failure into the job's
//! progress after each one. Two consecutive failures with an identical
//! message mean the input isn't going to change the outcome — that's a code
//! bug, not weather — so the job is quarantined as `permanently_failed`
//! immediately. Transient upstream messages are exempt from the breaker;
//! the health sweeper retries those without limit.

use anyhow::Result;

use crate::logbuf::{LogBuffers, tags};
use crate::model::is_transient_message;
use crate::store::{JobStatus, ProgressPatch, SharedDb, Step};

/// Default extra attempts after the first failure.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Run `stage` with bounded backoff and progress accounting. `stage`
/// receives the 1-based attempt number.
pub async fn retry_step<T, F, Fut>(
    db: &SharedDb,
    logs: &LogBuffers,
    backoff_secs: u64,
    name: &str,
    job_id: i64,
    job_title: &str,
    max_retries: u32,
    stage: F,
) -> Result<T>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let total = max_retries + 1;
    let mut prev_error: Option<String> = None;

    for attempt in 1..=total {
        if attempt > 1 {
            let delay = (attempt as u64 - 1) * backoff_secs;
            if delay > 0 {
                tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
            }
        }

        match stage(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let message = format!("{:#}", err);
                logs.log(
                    job_id,
                    job_title,
                    tags::FAIL,
                    &format!("{} failed (attempt {}/{}): {}", name, attempt, total, message),
                );

                let repeated = prev_error.as_deref() == Some(message.as_str())
                    && !is_transient_message(&message);

                if repeated {
                    // Same message twice in a row: retrying the same input
                    // will not change the outcome.
                    logs.log(
                        job_id,
                        job_title,
                        tags::FAIL,
                        &format!("{} repeated identical error, quarantining job", name),
                    );
                    persist_failure(
                        db,
                        logs,
                        job_id,
                        &message,
                        Step::PermanentlyFailed,
                        true,
                    )?;
                    return Err(err);
                }

                if attempt == total {
                    persist_failure(db, logs, job_id, &message, Step::GenerationFailed, false)?;
                    return Err(err);
                }

                record_attempt_failure(db, job_id, &message)?;
                prev_error = Some(message);
            }
        }
    }

    unreachable!("retry loop returns from its final attempt")
}

/// Non-terminal failure bookkeeping: last_error, last_error_at, retry_count.
fn record_attempt_failure(db: &SharedDb, job_id: i64, message: &str) -> Result<()> {
    let guard = db.lock().unwrap_or_else(|e| e.into_inner());
    let retries = guard
        .get_job(job_id)?
        .map(|j| j.progress.retry_count)
        .unwrap_or(0);
    guard.update_progress(
        job_id,
        &ProgressPatch::new()
            .error(message)
            .retry_count(retries + 1),
    )?;
    Ok(())
}

/// Terminal failure bookkeeping: error status, failure step, frozen log tail.
fn persist_failure(
    db: &SharedDb,
    logs: &LogBuffers,
    job_id: i64,
    message: &str,
    step: Step,
    repeated: bool,
) -> Result<()> {
    let tail = logs.snapshot(job_id);
    let guard = db.lock().unwrap_or_else(|e| e.into_inner());
    let retries = guard
        .get_job(job_id)?
        .map(|j| j.progress.retry_count)
        .unwrap_or(0);
    guard.set_job_status(job_id, JobStatus::Error)?;
    guard.update_progress(
        job_id,
        &ProgressPatch::new()
            .step(step)
            .error(message)
            .retry_count(retries + 1)
            .repeated_error(repeated)
            .error_logs(tail),
    )?;
    Ok(())
}
