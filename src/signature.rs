//! Short per-line fingerprints used to spot the same dialog submitted twice.
//!
//! A signature is the speaker's normalized nick followed by the first few
//! words of what they said, lowercased with punctuation dropped. Small
//! edits further into a line, different timestamps, or a changed nick
//! flag all leave the signature unchanged.

use std::collections::BTreeSet;

use crate::dialog::Line;

pub const SIGNATURE_MAX_WORDS: usize = 6;
pub const SIGNATURE_MAX_LENGTH: usize = 40;
pub const SIGNATURE_MIN_LENGTH: usize = 10;

pub fn signature(actor: Option<&str>, text: &str) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    let mut length = 0usize;

    if let Some(actor) = actor.map(canonical_word).filter(|nick| !nick.is_empty()) {
        length += actor.chars().count() + 1;
        parts.push(actor);
    }

    for raw in text.split_whitespace().take(SIGNATURE_MAX_WORDS) {
        let word = canonical_word(raw);
        if word.is_empty() {
            continue;
        }
        let cost = word.chars().count() + 1;
        if length + cost > SIGNATURE_MAX_LENGTH {
            if parts.is_empty() {
                parts.push(word.chars().take(SIGNATURE_MAX_LENGTH).collect());
            }
            break;
        }
        length += cost;
        parts.push(word);
    }

    let joined = parts.join(" ");
    if joined.chars().count() < SIGNATURE_MIN_LENGTH {
        return None;
    }
    Some(joined)
}

/// Signatures for every line of a parsed quote.
pub fn line_signatures(lines: &[Line]) -> BTreeSet<String> {
    lines
        .iter()
        .filter_map(|line| {
            let rendered = line.render();
            signature(rendered.normalized_nick(), &rendered.text)
        })
        .collect()
}

fn canonical_word(raw: &str) -> String {
    raw.chars()
        .filter(|ch| ch.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialog::FormatterRegistry;

    #[test]
    fn short_text_has_no_signature() {
        assert_eq!(signature(None, "lol"), None);
        assert_eq!(signature(Some("bob"), "ok"), None);
        assert_eq!(signature(None, ""), None);
    }

    #[test]
    fn signature_starts_with_the_speaker() {
        assert_eq!(
            signature(Some("bob"), "Hello, World! how are you"),
            Some("bob hello world how are you".to_string())
        );
    }

    #[test]
    fn signature_stops_at_the_word_limit() {
        let sig = signature(None, "one two three four five six seven eight").expect("signature");
        assert_eq!(sig, "one two three four five six");
    }

    #[test]
    fn signature_stops_before_exceeding_the_length_budget() {
        let text = "aaaaaaaaaaaaaaa bbbbbbbbbbbbbbb ccccccccccccccc";
        let sig = signature(None, text).expect("signature");
        assert_eq!(sig, "aaaaaaaaaaaaaaa bbbbbbbbbbbbbbb");
        assert!(sig.chars().count() <= SIGNATURE_MAX_LENGTH);
    }

    #[test]
    fn oversized_first_word_is_truncated() {
        let word = "x".repeat(SIGNATURE_MAX_LENGTH + 15);
        let sig = signature(None, &word).expect("signature");
        assert_eq!(sig.len(), SIGNATURE_MAX_LENGTH);
    }

    #[test]
    fn rewording_past_the_prefix_keeps_the_signature() {
        let a = signature(Some("amy"), "did you see the game last night?");
        let b = signature(Some("amy"), "Did you see the game last week!!");
        assert!(a.is_some());
        assert_eq!(a, b);
    }

    #[test]
    fn signature_is_deterministic_across_formatting() {
        let registry = FormatterRegistry::standard();
        let first = registry.parse("[10:01] <@bob> the build is broken again", false);
        let second = registry.parse("(22:47) <bob> The build is broken again.", false);
        assert_eq!(line_signatures(&first), line_signatures(&second));
        assert_eq!(line_signatures(&first).len(), 1);
    }

    #[test]
    fn preserved_lines_sign_the_raw_text() {
        let registry = FormatterRegistry::standard();
        let lines = registry.parse("<bob> the build is broken again", true);
        let sigs = line_signatures(&lines);
        assert!(sigs.contains("bob the build is broken again"));
    }
}
