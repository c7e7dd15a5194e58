//! Deterministic cleanup of model replies and parsed page text.
//!
//! Chat models ignore formatting instructions often enough that every reply
//! is normalised before use: extraction replies are stripped of code fences
//! and narrowed to the JSON array they contain, and Q/A replies lose the
//! `Question:` / `Answer:` labels and quotes the prompt format invites.
//! Parsed page text gets the whitespace rules only.

use once_cell::sync::Lazy;
use regex::Regex;

/// Normalise text returned by the parsing service.
///
/// Rules (applied in order):
/// 1. Normalise line endings (CRLF → LF)
/// 2. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 3. Trim trailing whitespace per line
/// 4. Collapse 3+ consecutive blank lines down to 2
pub fn clean_page_text(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    collapse_blank_lines(&s)
}

/// Isolate the JSON array in an extraction reply.
///
/// Returns the slice from the first `[` to the last `]` after removing an
/// outer code fence, or `None` when the reply holds no array.
pub fn extract_json_array(reply: &str) -> Option<String> {
    let s = strip_code_fences(&normalise_line_endings(reply));
    let start = s.find('[')?;
    let end = s.rfind(']')?;
    (end > start).then(|| s[start..=end].to_string())
}

/// Clean a generated question or answer.
///
/// `label` is the prefix the prompt ends with (`"Question"`, `"Answer"`);
/// a leading `label:` echoed by the model is removed, as are wrapping
/// quotes and invisible characters.
pub fn clean_generated_text(reply: &str, label: &str) -> String {
    let s = strip_code_fences(&normalise_line_endings(reply));
    let s = remove_invisible_chars(&s);
    let mut s = s.trim();

    if let Some(rest) = strip_label(s, label) {
        s = rest.trim_start();
    }
    strip_wrapping_quotes(s).trim().to_string()
}

// ── Fences ───────────────────────────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z]*\n(.*?)\n?```\s*$").unwrap());

fn strip_code_fences(input: &str) -> String {
    let trimmed = input.trim();
    match RE_OUTER_FENCES.captures(trimmed) {
        Some(caps) => caps[1].to_string(),
        None => trimmed.to_string(),
    }
}

// ── Labels and quotes ────────────────────────────────────────────────────────

fn strip_label<'a>(s: &'a str, label: &str) -> Option<&'a str> {
    let head = s.get(..label.len())?;
    if !head.eq_ignore_ascii_case(label) {
        return None;
    }
    s[label.len()..].strip_prefix(':')
}

fn strip_wrapping_quotes(s: &str) -> &str {
    for (open, close) in [('"', '"'), ('\u{201C}', '\u{201D}'), ('\'', '\'')] {
        if let Some(inner) = s.strip_prefix(open).and_then(|r| r.strip_suffix(close)) {
            if !inner.contains(close) {
                return inner;
            }
        }
    }
    s
}

// ── Whitespace ───────────────────────────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n\n").to_string()
}

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        ['\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}'],
        "",
    )
}
