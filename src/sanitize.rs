use regex::Regex;
use std::sync::OnceLock;

pub const MAX_MESSAGE_BODY: usize = 2000;
pub const MAX_TICKET_BODY: usize = 4000;
pub const MAX_CANNED_TITLE: usize = 80;
pub const MAX_CANNED_BODY: usize = 2000;
pub const MAX_NOTE_BODY: usize = 2000;
pub const MAX_TAG: usize = 64;
pub const MAX_URL: usize = 512;
pub const MAX_SESSION_ID: usize = 128;
pub const MAX_CONTACT: usize = 190;
pub const MAX_KEYWORD: usize = 190;
pub const MAX_REPLY_TEXT: usize = 2000;

fn control_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Keep \n and \t so multi-line message bodies survive.
    RE.get_or_init(|| Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F\x7F]").expect("valid regex"))
}

/// Trim, strip control characters, and cap at `max_len` characters.
/// Returns an empty string when nothing survives; message callers treat
/// that as "silently ignore".
pub fn clean_text(raw: &str, max_len: usize) -> String {
    let stripped = control_chars().replace_all(raw, "");
    let trimmed = stripped.trim();
    if trimmed.chars().count() <= max_len {
        return trimmed.to_string();
    }
    trimmed.chars().take(max_len).collect::<String>().trim_end().to_string()
}

/// Single-line variant for identifiers, titles, URLs and tags.
pub fn clean_line(raw: &str, max_len: usize) -> String {
    let cleaned = clean_text(raw, max_len);
    cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(max_len)
        .collect()
}

/// Session ids come straight from the embed script; restrict them to a
/// conservative token alphabet so they are safe as lookup keys.
pub fn valid_session_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_SESSION_ID
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub fn normalize_keyword(raw: &str) -> String {
    clean_line(raw, MAX_KEYWORD).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_text_trims_and_strips_controls() {
        assert_eq!(clean_text("  hello\u{0000}world  ", 100), "helloworld");
        assert_eq!(clean_text("a\u{001B}[31mb", 100), "a[31mb");
    }

    #[test]
    fn clean_text_keeps_newlines_and_tabs() {
        assert_eq!(clean_text("line one\nline\ttwo", 100), "line one\nline\ttwo");
    }

    #[test]
    fn clean_text_caps_by_char_count() {
        let long = "x".repeat(50);
        assert_eq!(clean_text(&long, 10).len(), 10);
        // Multi-byte chars count as one.
        let uni = "é".repeat(20);
        assert_eq!(clean_text(&uni, 5).chars().count(), 5);
    }

    #[test]
    fn whitespace_only_becomes_empty() {
        assert_eq!(clean_text("   \n\t  ", MAX_MESSAGE_BODY), "");
    }

    #[test]
    fn clean_line_collapses_whitespace() {
        assert_eq!(clean_line("a \n  b\t c", 100), "a b c");
    }

    #[test]
    fn session_id_alphabet() {
        assert!(valid_session_id("v1-abc_DEF9"));
        assert!(!valid_session_id(""));
        assert!(!valid_session_id("has space"));
        assert!(!valid_session_id(&"x".repeat(MAX_SESSION_ID + 1)));
    }

    #[test]
    fn keyword_is_lowercased() {
        assert_eq!(normalize_keyword("  RefUnd "), "refund");
    }
}
