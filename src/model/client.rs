//! Retrying wrapper around the upstream model with cost accounting.
//!
//! One `call` runs up to four attempts on transient failures with the
//! 0/2/10/30-second backoff schedule, gives up immediately on permanent
//! errors, and records a cost row for every successful call. Each attempt
//! emits one log line tagged with the job title and prompt size.

use std::sync::Arc;
use std::time::Duration;

use crate::config::StoryConfig;
use crate::errors::ModelError;
use crate::logbuf::{LogBuffers, tags};
use crate::store::SharedDb;

use super::api::{ChatMessage, ModelApi, ModelRequest, ModelResponse};

/// Caller-supplied context threaded through a model call: which job it
/// belongs to and what kind of operation is being metered.
#[derive(Debug, Clone)]
pub struct CallMeta {
    pub job_id: i64,
    pub job_title: String,
    pub operation: String,
}

impl CallMeta {
    pub fn new(job_id: i64, job_title: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            job_id,
            job_title: job_title.into(),
            operation: operation.into(),
        }
    }
}

pub struct ModelClient {
    api: Arc<dyn ModelApi>,
    db: SharedDb,
    logs: LogBuffers,
    model: String,
    input_per_million: f64,
    output_per_million: f64,
    backoff: Vec<Duration>,
}

impl ModelClient {
    pub fn new(api: Arc<dyn ModelApi>, db: SharedDb, logs: LogBuffers, config: &StoryConfig) -> Self {
        Self {
            api,
            db,
            logs,
            model: config.generation_model.clone(),
            input_per_million: config.pricing.input_per_million,
            output_per_million: config.pricing.output_per_million,
            backoff: config
                .model_backoff_secs
                .iter()
                .map(|&s| Duration::from_secs(s))
                .collect(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Run one chat completion with bounded retry. Transient failures are
    /// retried through the backoff schedule; permanent failures return at
    /// once.
    pub async fn call(
        &self,
        system: Option<String>,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
        meta: &CallMeta,
    ) -> Result<ModelResponse, ModelError> {
        let prompt_chars: usize = messages.iter().map(|m| m.content.len()).sum::<usize>()
            + system.as_deref().map(str::len).unwrap_or(0);
        let request = ModelRequest {
            model: self.model.clone(),
            system,
            messages,
            max_tokens,
        };

        let attempts = self.backoff.len().max(1);
        let mut last_err: Option<ModelError> = None;

        for attempt in 0..attempts {
            let delay = self.backoff.get(attempt).copied().unwrap_or_default();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            self.logs.log(
                meta.job_id,
                &meta.job_title,
                tags::RETRY,
                &format!(
                    "{} call attempt {}/{} [{} prompt chars]",
                    meta.operation,
                    attempt + 1,
                    attempts,
                    prompt_chars
                ),
            );

            match self.api.complete(&request).await {
                Ok(response) => {
                    self.logs.log(
                        meta.job_id,
                        &meta.job_title,
                        tags::COST,
                        &format!(
                            "{} ok [{} in / {} out tokens, {} chars]",
                            meta.operation,
                            response.input_tokens,
                            response.output_tokens,
                            response.text.len()
                        ),
                    );
                    self.record_cost(meta, &response);
                    return Ok(response);
                }
                Err(err) if err.is_transient() => {
                    tracing::warn!(
                        job_id = meta.job_id,
                        attempt = attempt + 1,
                        error = %err,
                        "transient model failure"
                    );
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err.unwrap_or_else(|| ModelError::transient("no attempts were made")))
    }

    /// Price a completed call and persist the record. Best effort: a store
    /// failure is logged and never propagated.
    fn record_cost(&self, meta: &CallMeta, response: &ModelResponse) {
        let cost = response.input_tokens as f64 * self.input_per_million / 1_000_000.0
            + response.output_tokens as f64 * self.output_per_million / 1_000_000.0;
        let result = {
            let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
            db.insert_cost_record(
                meta.job_id,
                &meta.operation,
                &self.model,
                response.input_tokens,
                response.output_tokens,
                cost,
            )
        };
        if let Err(e) = result {
            tracing::warn!(job_id = meta.job_id, error = %e, "failed to record model cost");
        }
    }
}
