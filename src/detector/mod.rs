//! Rate-limit detection over terminal output.
//!
//! A detector holds a provider-tuned regex list and a sticky flag: once any
//! pattern matches, [`RateLimitDetector::check`] keeps returning `true`
//! until [`RateLimitDetector::reset`]. The [`ObservingWriter`] adapter
//! scans a byte stream line-by-line on its way to any sink.

use parking_lot::Mutex;
use regex::Regex;
use std::io::Write;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::provider::Provider;

/// Fixed fallback patterns per provider, matched case-insensitively.
pub fn default_patterns(provider: Provider) -> &'static [&'static str] {
    match provider {
        Provider::Claude => &[
            r"rate limit",
            r"usage limit",
            r"HTTP 429",
            r"over capacity",
        ],
        Provider::Codex => &[
            r"rate[- ]limit",
            r"quota exceeded",
            r"usage_limit_reached",
        ],
        Provider::Gemini => &[r"RESOURCE_EXHAUSTED", r"quota exceeded", r"\b429\b"],
    }
}

#[derive(Debug, Default)]
struct DetectorState {
    detected: bool,
    reason: Option<String>,
}

#[derive(Debug)]
pub struct RateLimitDetector {
    provider: Provider,
    patterns: Vec<Regex>,
    state: Mutex<DetectorState>,
}

impl RateLimitDetector {
    /// Detector with the provider's default pattern list.
    pub fn new(provider: Provider) -> Self {
        let patterns = default_patterns(provider)
            .iter()
            .map(|p| compile(p))
            .collect::<Result<Vec<_>>>()
            .unwrap_or_default();
        Self {
            provider,
            patterns,
            state: Mutex::new(DetectorState::default()),
        }
    }

    /// Detector with caller-supplied patterns replacing the defaults.
    pub fn with_patterns(provider: Provider, patterns: &[&str]) -> Result<Self> {
        let compiled = patterns
            .iter()
            .map(|p| compile(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            provider,
            patterns: compiled,
            state: Mutex::new(DetectorState::default()),
        })
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Scan `text` and return the sticky flag. A match latches the flag and
    /// records the pattern for [`RateLimitDetector::reason`].
    pub fn check(&self, text: &str) -> bool {
        let mut state = self.state.lock();
        if state.detected {
            return true;
        }
        for pattern in &self.patterns {
            if pattern.is_match(text) {
                state.detected = true;
                state.reason = Some(pattern.as_str().to_string());
                tracing::debug!(
                    provider = %self.provider,
                    pattern = pattern.as_str(),
                    "Rate limit detected"
                );
                return true;
            }
        }
        false
    }

    pub fn detected(&self) -> bool {
        self.state.lock().detected
    }

    /// The pattern behind the latched detection, stripped of the
    /// case-insensitivity prefix for logging.
    pub fn reason(&self) -> Option<String> {
        self.state
            .lock()
            .reason
            .as_ref()
            .map(|r| r.trim_start_matches("(?i)").to_string())
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.detected = false;
        state.reason = None;
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("(?i){pattern}")).map_err(|source| Error::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Wraps a byte sink, buffering partial lines across writes and running the
/// detector (plus an optional per-line callback) over each complete line.
/// Output always passes through unmodified.
pub struct ObservingWriter<W: Write> {
    inner: W,
    detector: Arc<RateLimitDetector>,
    buffer: String,
    on_line: Option<Box<dyn FnMut(&str) + Send>>,
}

impl<W: Write> ObservingWriter<W> {
    pub fn new(inner: W, detector: Arc<RateLimitDetector>) -> Self {
        Self {
            inner,
            detector,
            buffer: String::new(),
            on_line: None,
        }
    }

    pub fn with_line_callback(mut self, callback: Box<dyn FnMut(&str) + Send>) -> Self {
        self.on_line = Some(callback);
        self
    }

    pub fn detector(&self) -> &RateLimitDetector {
        &self.detector
    }

    fn observe(&mut self, chunk: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            self.scan_line(line.trim_end_matches(['\n', '\r']));
        }
    }

    fn scan_line(&mut self, line: &str) {
        self.detector.check(line);
        if let Some(callback) = &mut self.on_line {
            callback(line);
        }
    }
}

impl<W: Write> Write for ObservingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.observe(&buf[..written]);
        Ok(written)
    }

    /// Drains any residual partial line through the detector as a final
    /// line, then flushes the sink.
    fn flush(&mut self) -> std::io::Result<()> {
        if !self.buffer.is_empty() {
            let residual = std::mem::take(&mut self.buffer);
            self.scan_line(residual.trim_end_matches(['\n', '\r']));
        }
        self.inner.flush()
    }
}
