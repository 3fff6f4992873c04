//! JSON gate for model responses.
//!
//! Models are asked for JSON but ship it wrapped in prose, fenced in
//! markdown, or cut off mid-string by the output cap. The gate tries, in
//! order:
//!
//! 1. a direct parse of the trimmed text,
//! 2. the last fenced block (` ```json ` opener, closing fence optional),
//! 3. a structural repair pass: truncate past the last balanced top-level
//!    close, or close the open string and any outstanding brackets, then
//!    strip trailing commas.
//!
//! Required top-level keys are asserted once a parse succeeds. Shape errors
//! are never swallowed; the only side effect is a log line naming the
//! branch that succeeded.

use serde_json::Value;
use tracing::debug;

use crate::errors::GateError;

/// Parse a model response into a JSON object, requiring `required` keys at
/// the top level.
pub fn parse(raw: &str, required: &[&str]) -> Result<Value, GateError> {
    let trimmed = raw.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        debug!("model JSON parsed directly");
        return require_fields(value, required);
    }

    let fenced = extract_last_fenced_block(trimmed);
    if let Some(ref body) = fenced {
        if let Ok(value) = serde_json::from_str::<Value>(body) {
            debug!("model JSON parsed from fenced block");
            return require_fields(value, required);
        }
    }

    let source = fenced.as_deref().unwrap_or(trimmed);
    let repaired = repair(source).ok_or(GateError::NoJson)?;
    match serde_json::from_str::<Value>(&repaired) {
        Ok(value) => {
            debug!("model JSON recovered by repair pass");
            require_fields(value, required)
        }
        Err(e) => Err(GateError::Parse(e)),
    }
}

fn require_fields(value: Value, required: &[&str]) -> Result<Value, GateError> {
    if required.is_empty() {
        return Ok(value);
    }
    let object = value.as_object().ok_or_else(|| GateError::MissingField {
        field: required[0].to_string(),
    })?;
    for field in required {
        if !object.contains_key(*field) {
            return Err(GateError::MissingField {
                field: field.to_string(),
            });
        }
    }
    Ok(value)
}

/// The body of the last ``` fence in the text. Fences are assumed to
/// alternate open/close; an odd count means the final block was truncated
/// before its closing fence.
fn extract_last_fenced_block(text: &str) -> Option<String> {
    let fences: Vec<usize> = text.match_indices("```").map(|(i, _)| i).collect();
    if fences.is_empty() {
        return None;
    }
    let (open, close) = if fences.len() % 2 == 0 {
        (fences[fences.len() - 2], Some(fences[fences.len() - 1]))
    } else {
        (fences[fences.len() - 1], None)
    };
    let body_start = open + 3;
    let body_end = close.unwrap_or(text.len());
    if body_start >= body_end {
        return None;
    }
    let mut body = text[body_start..body_end].trim_start();
    if let Some(tag) = body.get(..4) {
        if tag.eq_ignore_ascii_case("json") {
            body = body[4..].trim_start();
        }
    }
    let body = body.trim();
    if body.is_empty() {
        None
    } else {
        Some(body.to_string())
    }
}

/// Structural repair for truncated or over-long output. Returns `None`
/// when the input contains no JSON opener at all.
fn repair(input: &str) -> Option<String> {
    let start = input.find(['{', '['])?;
    let s = &input[start..];

    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut last_balanced_end: Option<usize> = None;

    for (i, ch) in s.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&ch) {
                    stack.pop();
                    if stack.is_empty() {
                        last_balanced_end = Some(i + ch.len_utf8());
                    }
                }
            }
            _ => {}
        }
    }

    let candidate = match last_balanced_end {
        // Trailing content past the last balanced close is dropped.
        Some(end) => s[..end].to_string(),
        // Never balanced: close the open string, then the open brackets
        // innermost-first.
        None => {
            let mut out = s.to_string();
            if in_string {
                out.push('"');
            }
            while let Some(closer) = stack.pop() {
                out.push(closer);
            }
            out
        }
    };

    Some(strip_trailing_commas(&candidate))
}

/// Remove commas that sit (modulo whitespace) directly before a `}` or `]`,
/// outside of strings.
fn strip_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &ch) in chars.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            out.push(ch);
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            ',' => {
                let next = chars[i + 1..].iter().copied().find(|c| !c.is_whitespace());
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(ch);
                }
            }
            _ => out.push(ch),
        }
    }
    out
}
