//! Deterministic cleanup of oracle responses before JSON decoding.
//!
//! Even when asked for bare JSON, models wrap it in fences, prepend a
//! sentence, or leak zero-width characters. These passes remove that noise
//! without interpreting the content; anything still undecodable is reported
//! as [`OracleError::Malformed`].

use super::{OracleError, RuleProposal};
use once_cell::sync::Lazy;
use regex::Regex;

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:json|JSON)?\s*\n(.*)\n```\s*$").unwrap());

/// Strip outer code fences (models sometimes disobey the prompt).
fn strip_fences(input: &str) -> &str {
    match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps.get(1).map_or(input, |m| m.as_str()),
        None => input,
    }
}

/// Remove zero-width spaces, BOM and soft hyphens.
fn remove_invisible_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| !matches!(c, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}' | '\u{00AD}'))
        .collect()
}

/// Slice from the first `{` to the last `}`, dropping any prose around the object.
fn outer_object(input: &str) -> Option<&str> {
    let start = input.find('{')?;
    let end = input.rfind('}')?;
    (end > start).then(|| &input[start..=end])
}

/// Extract the JSON object from a raw response.
pub fn extract_json(raw: &str) -> Option<String> {
    let cleaned = remove_invisible_chars(strip_fences(raw));
    outer_object(&cleaned).map(str::to_string)
}

/// Decode a rule proposal from a raw model response.
pub fn parse_proposal(raw: &str) -> Result<RuleProposal, OracleError> {
    let json = extract_json(raw)
        .ok_or_else(|| OracleError::Malformed("no JSON object in response".to_string()))?;
    serde_json::from_str(&json).map_err(|e| OracleError::Malformed(e.to_string()))
}
