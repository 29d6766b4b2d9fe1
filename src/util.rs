//! Small shared helpers: ANSI stripping and secret redaction.

use std::sync::OnceLock;

use regex::Regex;

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // CSI sequences, OSC sequences (BEL- or ST-terminated), and lone
        // two-byte escapes, in that order of preference.
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)?|\x1b.")
            .expect("ANSI pattern is a constant")
    })
}

/// Remove terminal escape sequences so pattern matching sees plain text.
pub fn strip_ansi(input: &str) -> String {
    ansi_re().replace_all(input, "").into_owned()
}

/// Redact an OAuth URL for logging: everything after the first `?` carries
/// client state and is replaced wholesale.
pub fn redact_url(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => format!("{base}?[REDACTED]"),
        None => url.to_string(),
    }
}

/// Redact an auth code for logging. Short codes disappear entirely; longer
/// ones keep two characters on each end.
pub fn redact_code(code: &str) -> String {
    let chars: Vec<char> = code.chars().collect();
    if chars.len() <= 4 {
        return "[REDACTED]".to_string();
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{head}...{tail}")
}

/// Truncate to at most `max_chars` characters, appending an ellipsis when
/// something was cut. Safe on multi-byte input.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", s[..idx].trim_end()),
        None => s.to_string(),
    }
}
