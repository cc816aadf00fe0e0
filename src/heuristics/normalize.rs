use super::title_case;
use regex::Regex;
use std::sync::LazyLock;
use tracing::warn;

static PARENTHETICAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\([^)]*\)").expect("parenthetical pattern"));

/// "12 AND 14", "12 & 14": conjunctions between erf/street numbers.
static CONJUNCTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*(?:\band\b|&)\s*").expect("conjunction pattern"));

/// Leading run of numbers, commas and spaces; only the first number is the
/// street number.
static LEADING_NUMBERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)(?:[\s,]+\d+)*[\s,]+").expect("leading number pattern"));

/// Rewrite a harvested address into `"<Street>, <Suburb>, ..., <Locality>"`.
///
/// Idempotent; the result always ends with `locality` exactly once.
pub fn normalize_address(raw: &str, locality: &str) -> String {
    let text = PARENTHETICAL.replace_all(raw, "");
    let text = CONJUNCTION.replace_all(&text, ", ");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let text = collapse_leading_numbers(&text, locality);

    let mut segments: Vec<String> = text
        .split(',')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(title_case)
        .collect();

    let locality = title_case(locality);
    if segments.last() != Some(&locality) {
        segments.push(locality);
    }
    let normalized = segments.join(", ");

    if raw.to_lowercase() != normalized.to_lowercase() {
        warn!(raw = %raw, patched = %normalized, "Patched address");
    }
    normalized
}

/// `"12, 14 Main Road"` -> `"12 Main Road"`.
///
/// A bare number directly before the locality keeps its comma.
fn collapse_leading_numbers(text: &str, locality: &str) -> String {
    let Some(caps) = LEADING_NUMBERS.captures(text) else {
        return text.to_string();
    };
    let (Some(run), Some(first)) = (caps.get(0), caps.get(1)) else {
        return text.to_string();
    };
    let rest = &text[run.end()..];
    let next_segment = rest.split(',').next().unwrap_or_default().trim();
    if next_segment.eq_ignore_ascii_case(locality.trim()) {
        return text.to_string();
    }
    format!("{} {rest}", first.as_str())
}
