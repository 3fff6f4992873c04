//! Deterministic prose-violation scan.
//!
//! A fixed set of banned-construction caps applied to chapter text before
//! the model-graded rubric. The patterns are part of the contract with the
//! regeneration loop: first two failures regenerate, the third goes to the
//! rubric with the violations surfaced.

use std::sync::LazyLock;

use regex::Regex;

pub const MAX_EM_DASHES: usize = 15;
pub const MAX_NOT_BUT: usize = 2;
pub const MAX_SOMETHING_IN: usize = 2;
pub const MAX_KIND_OF: usize = 2;

// "Not X, but Y" and "Not X — Y".
static NOT_BUT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bnot\s+[^.!?;:\n]{0,60}?(?:,\s*but\s+|\s*—\s*)").unwrap()
});

static SOMETHING_IN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bsomething in (?:her|his|their|my|your)\b").unwrap());

static KIND_OF: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bthe kind of\b").unwrap());

/// Scan chapter text; an empty result means the prose passes.
pub fn scan(content: &str) -> Vec<String> {
    let mut violations = Vec::new();

    let em_dashes = content.matches('—').count();
    if em_dashes > MAX_EM_DASHES {
        violations.push(format!(
            "em dash used {} times (max {})",
            em_dashes, MAX_EM_DASHES
        ));
    }

    let not_but = NOT_BUT.find_iter(content).count();
    if not_but > MAX_NOT_BUT {
        violations.push(format!(
            "'Not X, but Y' construction used {} times (max {})",
            not_but, MAX_NOT_BUT
        ));
    }

    let something_in = SOMETHING_IN.find_iter(content).count();
    if something_in > MAX_SOMETHING_IN {
        violations.push(format!(
            "'something in her/his/their ...' used {} times (max {})",
            something_in, MAX_SOMETHING_IN
        ));
    }

    let kind_of = KIND_OF.find_iter(content).count();
    if kind_of > MAX_KIND_OF {
        violations.push(format!(
            "'the kind of ...' used {} times (max {})",
            kind_of, MAX_KIND_OF
        ));
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_prose_passes() {
        let content = "The tide came in early. Isla watched it from the tower, counting the \
                       seconds between waves. Not once did she look away, but the bell stayed \
                       silent.";
        assert!(scan(content).is_empty());
    }

    #[test]
    fn test_em_dash_cap() {
        let under = "word — ".repeat(15);
        assert!(scan(&under).is_empty());

        let over = "word — ".repeat(20);
        let violations = scan(&over);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("em dash used 20 times (max 15)"));
    }

    #[test]
    fn test_not_but_comma_form() {
        let content = "It was not the wind, but the bell. She was not afraid, but careful. \
                       He was not cruel, but tired.";
        let violations = scan(content);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("'Not X, but Y'"));
        assert!(violations[0].contains("3 times"));
    }

    #[test]
    fn test_not_but_em_dash_form_counts() {
        let content = "It was not the wind — the bell. Not a warning — a welcome. Not hers — his.";
        let violations = scan(content);
        assert!(violations.iter().any(|v| v.contains("'Not X, but Y'")));
    }

    #[test]
    fn test_something_in_pronoun_cap() {
        let content = "Something in her shifted. Something in his voice cracked. Something in \
                       their silence answered.";
        let violations = scan(content);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("'something in"));
    }

    #[test]
    fn test_something_in_requires_pronoun() {
        let content = "Something in the water moved. Something in the tower groaned. Something \
                       in the dark waited.";
        assert!(scan(content).is_empty());
    }

    #[test]
    fn test_kind_of_cap() {
        let content = "It was the kind of morning that promised rain. She wore the kind of coat \
                       that had seen storms. He gave the kind of smile that meant trouble.";
        let violations = scan(content);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("'the kind of"));
    }

    #[test]
    fn test_multiple_violations_all_reported() {
        let mut content = "word — ".repeat(20);
        content.push_str(&"the kind of thing. ".repeat(3));
        let violations = scan(&content);
        assert_eq!(violations.len(), 2);
    }

    #[test]
    fn test_case_insensitive() {
        let content = "NOT the wind, BUT the bell. Not here, but there. not now, but soon.";
        let violations = scan(content);
        assert_eq!(violations.len(), 1);
    }
}
