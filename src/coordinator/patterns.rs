//! Provider-tuned patterns for the pane state machine.
//!
//! Matching always runs on ANSI-stripped text. URL extraction additionally
//! consults the raw output so percent-encoded characters that an escape
//! sequence happened to split are still recovered.

use regex::Regex;
use std::sync::OnceLock;

use crate::detector::default_patterns;
use crate::provider::Provider;
use crate::util::strip_ansi;

pub struct ProviderPatterns {
    pub provider: Provider,
    pub rate_limit: Vec<Regex>,
    pub method_select: Regex,
    pub oauth_url: Regex,
    pub paste_prompt: Regex,
    pub login_success: Vec<Regex>,
    pub login_failure: Vec<Regex>,
}

fn compile(pattern: &str) -> Regex {
    Regex::new(&format!("(?i){pattern}")).expect("pattern table entries are constants")
}

fn build(provider: Provider, oauth_url: &str) -> ProviderPatterns {
    ProviderPatterns {
        provider,
        rate_limit: default_patterns(provider).iter().map(|p| compile(p)).collect(),
        method_select: compile(r"select login method"),
        oauth_url: Regex::new(oauth_url).expect("pattern table entries are constants"),
        paste_prompt: compile(r"paste code here"),
        login_success: vec![
            compile(r"login successful"),
            compile(r"logged in as"),
            compile(r"successfully logged in"),
            compile(r"authentication successful"),
        ],
        login_failure: vec![
            compile(r"login failed"),
            compile(r"invalid (code|grant)"),
            compile(r"authentication failed"),
            compile(r"oauth error"),
        ],
    }
}

pub fn patterns_for(provider: Provider) -> &'static ProviderPatterns {
    static TABLE: OnceLock<[ProviderPatterns; 3]> = OnceLock::new();
    let table = TABLE.get_or_init(|| {
        [
            build(
                Provider::Claude,
                r"https://claude\.ai/oauth/authorize\?\S+",
            ),
            build(
                Provider::Codex,
                r"https://auth\.openai\.com/\S+",
            ),
            build(
                Provider::Gemini,
                r"https://accounts\.google\.com/o/oauth2/\S+",
            ),
        ]
    });
    match provider {
        Provider::Claude => &table[0],
        Provider::Codex => &table[1],
        Provider::Gemini => &table[2],
    }
}

/// Which provider's rate-limit vocabulary matches this (stripped) output.
pub fn detect_provider(stripped: &str) -> Option<Provider> {
    Provider::ALL.into_iter().find(|provider| {
        patterns_for(*provider)
            .rate_limit
            .iter()
            .any(|p| p.is_match(stripped))
    })
}

/// Pull a complete OAuth URL for `provider` out of pane output.
///
/// CLIs wrap long URLs across terminal lines, so everything from the match
/// start to the next blank line (or paste prompt) is flattened back into
/// one token. The stripped form is tried first; the raw form is the
/// fallback for output where stripping mangled the URL's neighborhood.
pub fn extract_oauth_url(provider: Provider, raw: &str) -> Option<String> {
    let stripped = strip_ansi(raw);
    extract_from(provider, &stripped).or_else(|| extract_from(provider, raw))
}

fn extract_from(provider: Provider, text: &str) -> Option<String> {
    let patterns = patterns_for(provider);
    let m = patterns.oauth_url.find(text)?;
    let tail = &text[m.start()..];

    let mut stop = tail.len();
    if let Some(idx) = tail.find("\n\n") {
        stop = stop.min(idx);
    }
    if let Some(idx) = tail.to_ascii_lowercase().find("paste") {
        stop = stop.min(idx);
    }

    let flattened: String = tail[..stop].split_whitespace().collect();
    patterns
        .oauth_url
        .is_match(&flattened)
        .then_some(flattened)
}
