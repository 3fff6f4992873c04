//! Unified configuration for the storyforge orchestrator.
//!
//! Settings are read from `storyforge.toml` with serde defaults for every
//! key, then layered with environment overrides. The recognised keys:
//!
//! ```toml
//! generation_model = "claude-sonnet-4-5"
//!
//! [pricing]
//! input_per_million = 3.0
//! output_per_million = 15.0
//!
//! [health_check]
//! interval_secs = 300
//! stall_threshold_secs = 600
//! lock_duration_secs = 1200
//! code_error_retry_cap = 2
//!
//! [chapter]
//! quality_threshold = 7.5
//! max_regenerations = 3
//! inter_chapter_delay_ms = 1000
//!
//! [features]
//! adaptive_preferences = true
//! character_ledger = true
//! entity_validation = true
//! voice_review = true
//! ```
//!
//! Retry backoff schedules live here too so tests can zero them.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Per-million-token pricing used for cost records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pricing {
    #[serde(default = "default_input_per_million")]
    pub input_per_million: f64,
    #[serde(default = "default_output_per_million")]
    pub output_per_million: f64,
}

fn default_input_per_million() -> f64 {
    3.0
}

fn default_output_per_million() -> f64 {
    15.0
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            input_per_million: default_input_per_million(),
            output_per_million: default_output_per_million(),
        }
    }
}

/// Health sweeper cadence and recovery limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Seconds between sweeper passes (first pass runs at process start).
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// An active job untouched for longer than this is considered stalled.
    #[serde(default = "default_stall")]
    pub stall_threshold_secs: i64,
    /// A recovery lock younger than this blocks a second pickup.
    #[serde(default = "default_lock")]
    pub lock_duration_secs: i64,
    /// Non-transient failures get this many sweeper retries before quarantine.
    #[serde(default = "default_retry_cap")]
    pub code_error_retry_cap: u32,
}

fn default_interval() -> u64 {
    300
}

fn default_stall() -> i64 {
    600
}

fn default_lock() -> i64 {
    1200
}

fn default_retry_cap() -> u32 {
    2
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            stall_threshold_secs: default_stall(),
            lock_duration_secs: default_lock(),
            code_error_retry_cap: default_retry_cap(),
        }
    }
}

/// Chapter generation knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterConfig {
    /// Weighted rubric score a chapter must reach to pass review.
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    /// Total generate attempts per chapter before the review turns advisory.
    #[serde(default = "default_max_regenerations")]
    pub max_regenerations: u32,
    /// Pause between chapters within a batch.
    #[serde(default = "default_inter_chapter_delay")]
    pub inter_chapter_delay_ms: u64,
}

fn default_quality_threshold() -> f64 {
    7.5
}

fn default_max_regenerations() -> u32 {
    3
}

fn default_inter_chapter_delay() -> u64 {
    1000
}

impl Default for ChapterConfig {
    fn default() -> Self {
        Self {
            quality_threshold: default_quality_threshold(),
            max_regenerations: default_max_regenerations(),
            inter_chapter_delay_ms: default_inter_chapter_delay(),
        }
    }
}

/// Per-job feature flags for chapter post-processing. All default on;
/// individual jobs can disable them through their reader profile extras.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default = "default_true")]
    pub adaptive_preferences: bool,
    #[serde(default = "default_true")]
    pub character_ledger: bool,
    #[serde(default = "default_true")]
    pub entity_validation: bool,
    #[serde(default = "default_true")]
    pub voice_review: bool,
}

fn default_true() -> bool {
    true
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            adaptive_preferences: true,
            character_ledger: true,
            entity_validation: true,
            voice_review: true,
        }
    }
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryConfig {
    #[serde(default = "default_model")]
    pub generation_model: String,
    #[serde(default)]
    pub pricing: Pricing,
    #[serde(default)]
    pub health_check: HealthConfig,
    #[serde(default)]
    pub chapter: ChapterConfig,
    #[serde(default)]
    pub features: FeatureFlags,
    /// Model-client backoff between attempts, in seconds.
    #[serde(default = "default_model_backoff")]
    pub model_backoff_secs: Vec<u64>,
    /// Step-retry backoff unit: attempt N waits N x this many seconds.
    #[serde(default = "default_step_backoff")]
    pub step_backoff_secs: u64,
}

fn default_model() -> String {
    "claude-sonnet-4-5".to_string()
}

fn default_model_backoff() -> Vec<u64> {
    vec![0, 2, 10, 30]
}

fn default_step_backoff() -> u64 {
    15
}

impl StoryConfig {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file is absent. Environment variables win over the file.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::with_defaults()
        };

        if let Ok(model) = std::env::var("STORYFORGE_MODEL") {
            config.generation_model = model;
        }

        Ok(config)
    }

    /// Defaults without touching the filesystem.
    pub fn with_defaults() -> Self {
        toml::from_str("").expect("empty config deserializes via serde defaults")
    }

    /// A configuration with all sleeps zeroed, for tests.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        let mut config = Self::with_defaults();
        config.model_backoff_secs = vec![0, 0, 0, 0];
        config.step_backoff_secs = 0;
        config.chapter.inter_chapter_delay_ms = 0;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = StoryConfig::with_defaults();
        assert_eq!(config.health_check.interval_secs, 300);
        assert_eq!(config.health_check.stall_threshold_secs, 600);
        assert_eq!(config.health_check.lock_duration_secs, 1200);
        assert_eq!(config.health_check.code_error_retry_cap, 2);
        assert_eq!(config.chapter.quality_threshold, 7.5);
        assert_eq!(config.chapter.max_regenerations, 3);
        assert_eq!(config.chapter.inter_chapter_delay_ms, 1000);
        assert_eq!(config.model_backoff_secs, vec![0, 2, 10, 30]);
        assert_eq!(config.step_backoff_secs, 15);
        assert!(config.features.adaptive_preferences);
        assert!(config.features.voice_review);
    }

    #[test]
    fn test_partial_toml_keeps_defaults_elsewhere() {
        let config: StoryConfig = toml::from_str(
            r#"
            generation_model = "claude-haiku-4"

            [chapter]
            quality_threshold = 8.0
            "#,
        )
        .unwrap();
        assert_eq!(config.generation_model, "claude-haiku-4");
        assert_eq!(config.chapter.quality_threshold, 8.0);
        assert_eq!(config.chapter.max_regenerations, 3);
        assert_eq!(config.health_check.interval_secs, 300);
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoryConfig::load(&dir.path().join("storyforge.toml")).unwrap();
        assert_eq!(config.chapter.quality_threshold, 7.5);
    }

    #[test]
    fn test_load_rejects_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storyforge.toml");
        std::fs::write(&path, "not = [valid").unwrap();
        assert!(StoryConfig::load(&path).is_err());
    }
}
