//! Weighted quality rubric for generated chapters.
//!
//! Six fixed criteria, each scored 1-10 by a second model call, combined
//! into a weighted score against the configured pass threshold. This module
//! is the deterministic half: turning the gated review JSON into a
//! `QualityReview` and synthesising reviews from prose violations.

use serde_json::Value;

use crate::store::models::QualityReview;

/// The rubric: criterion name and weight. Weights sum to 1.0.
pub const CRITERIA: &[(&str, f64)] = &[
    ("show_dont_tell", 0.15),
    ("dialogue", 0.20),
    ("pacing", 0.20),
    ("age_appropriateness", 0.15),
    ("character_consistency", 0.05),
    ("prose_quality", 0.25),
];

/// Criterion names, for the JSON gate's required-field check.
pub fn required_fields() -> Vec<&'static str> {
    CRITERIA.iter().map(|(name, _)| *name).collect()
}

/// Fold the gated review JSON into a `QualityReview`. Scores are clamped
/// to 1-10; a fix is collected as a priority fix whenever its criterion
/// scored below 7.
pub fn from_json(value: &Value, threshold: f64) -> QualityReview {
    let mut review = QualityReview::default();
    let mut weighted = 0.0;

    for (name, weight) in CRITERIA {
        let criterion = &value[*name];
        let score = criterion["score"].as_f64().unwrap_or(1.0).clamp(1.0, 10.0);
        weighted += score * weight;

        if score < 7.0 {
            if let Some(fix) = criterion["fix"].as_str() {
                if !fix.is_empty() {
                    review.priority_fixes.push(format!("{}: {}", name, fix));
                }
            }
        }

        let mut entry = serde_json::Map::new();
        entry.insert("score".to_string(), Value::from(score));
        entry.insert(
            "evidence".to_string(),
            Value::from(criterion["evidence"].as_str().unwrap_or_default()),
        );
        if let Some(fix) = criterion["fix"].as_str() {
            entry.insert("fix".to_string(), Value::from(fix));
        }
        review
            .criteria
            .insert(name.to_string(), Value::Object(entry));
    }

    // One decimal, same precision the chapter row stores.
    review.weighted_score = (weighted * 10.0).round() / 10.0;
    review.passed = review.weighted_score >= threshold;
    review
}

/// Review synthesised from prose violations: no rubric scores, just the
/// violation list as priority fixes. Used to drive regeneration.
pub fn from_violations(violations: &[String]) -> QualityReview {
    QualityReview {
        criteria: serde_json::Map::new(),
        weighted_score: 0.0,
        passed: false,
        priority_fixes: violations.to_vec(),
        prose_violations: violations.to_vec(),
    }
}

/// Fallback when the review call itself is unavailable: the rubric is
/// advisory, so the chapter still persists, scored at the neutral midpoint.
pub fn unavailable() -> QualityReview {
    QualityReview {
        criteria: serde_json::Map::new(),
        weighted_score: 5.0,
        passed: false,
        priority_fixes: vec!["quality review unavailable".to_string()],
        prose_violations: Vec::new(),
    }
}
