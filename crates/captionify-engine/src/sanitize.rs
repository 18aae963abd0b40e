//! Text cleanup for both stages.

use lazy_static::lazy_static;
use regex::Regex;

const REPLACEMENT_CHAR: char = '\u{FFFD}';
/// U+FFFD encoded as UTF-8 and decoded as Latin-1.
const MOJIBAKE_REPLACEMENT: &str = "ï¿½";
const PREAMBLE_MARKER: &str = "Caption Ideas";
const DESCRIPTION_LABELS: [&str; 3] = ["description:", "caption:", "label:"];

lazy_static! {
    static ref DISALLOWED_CHARS: Regex =
        Regex::new(r"[^\p{L}\p{M}\p{N}\p{P}\p{S}\p{Z}\p{Emoji}\p{Emoji_Component}\s]")
            .expect("valid character class");
    static ref WHITESPACE_RUN: Regex = Regex::new(r"\s+").expect("valid whitespace pattern");
    static ref ELAPSED_SUFFIX: Regex = Regex::new(
        r"(?i)[\s,;:|\-]*[(\[]?\s*(?:\d+(?:\.\d+)?\s*(?:seconds?|secs?)|\d+\.\d+s)\.?\s*[)\]]?\s*$",
    )
    .expect("valid elapsed suffix pattern");
    static ref BLIP_ARTIFACT_PREFIX: Regex =
        Regex::new(r"(?i)^(?:arafed|araffe|arafe|araf)\b\s*").expect("valid artifact pattern");
}

/// Strips control characters, replacement characters and their mojibake,
/// then collapses whitespace.
pub fn clean_generated_text(text: &str) -> String {
    let mut cleaned = text.to_string();
    loop {
        let next = DISALLOWED_CHARS
            .replace_all(&cleaned, "")
            .replace(REPLACEMENT_CHAR, "")
            .replace(MOJIBAKE_REPLACEMENT, "");
        if next == cleaned {
            break;
        }
        cleaned = next;
    }
    WHITESPACE_RUN
        .replace_all(cleaned.trim(), " ")
        .trim()
        .to_string()
}

/// Drops a leading "Caption Ideas" block: everything up to and including the
/// first colon after the marker. Text without a colon after the marker is
/// kept whole.
pub fn strip_caption_preamble(text: &str) -> String {
    let cut = text.find(PREAMBLE_MARKER).and_then(|start| {
        let marker_end = start + PREAMBLE_MARKER.len();
        text[marker_end..]
            .find(':')
            .map(|offset| marker_end + offset + 1)
    });
    text[cut.unwrap_or(0)..].trim().to_string()
}

/// Stage-2 output as handed back to the caller.
pub fn finalize_caption(raw: &str) -> String {
    let cleaned = strip_caption_preamble(&clean_generated_text(raw));
    strip_wrapping_quotes(&cleaned).to_string()
}

/// Normalizes stage-1 output. An empty result means the captioner said
/// nothing usable.
pub fn clean_description(text: &str) -> String {
    let mut cleaned = clean_generated_text(text);

    let lowered = cleaned.to_ascii_lowercase();
    if let Some(label) = DESCRIPTION_LABELS
        .iter()
        .find(|label| lowered.starts_with(*label))
    {
        cleaned = cleaned[label.len()..].trim().to_string();
    }

    loop {
        let stripped = ELAPSED_SUFFIX.replace(&cleaned, "").trim().to_string();
        if stripped == cleaned {
            break;
        }
        cleaned = stripped;
    }

    cleaned = strip_wrapping_quotes(&cleaned).to_string();
    cleaned = BLIP_ARTIFACT_PREFIX.replace(&cleaned, "").into_owned();
    cleaned
        .trim_end_matches(|ch: char| matches!(ch, ',' | ';' | ':') || ch.is_whitespace())
        .trim()
        .to_string()
}

fn strip_wrapping_quotes(text: &str) -> &str {
    let trimmed = text.trim();
    for (open, close) in [('"', '"'), ('\'', '\''), ('“', '”')] {
        if trimmed.chars().count() >= 2 && trimmed.starts_with(open) && trimmed.ends_with(close) {
            return trimmed[open.len_utf8()..trimmed.len() - close.len_utf8()].trim();
        }
    }
    trimmed
}
