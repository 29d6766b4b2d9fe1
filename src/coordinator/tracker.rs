//! Per-pane recovery state machine data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::provider::Provider;

/// Where a pane is in the rate-limit recovery flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaneState {
    Idle,
    RateLimited,
    AwaitingMethodSelect,
    AwaitingUrl,
    AuthPending,
    CodeReceived,
    AwaitingConfirm,
    Resuming,
    Failed,
}

impl PaneState {
    pub fn as_str(self) -> &'static str {
        match self {
            PaneState::Idle => "idle",
            PaneState::RateLimited => "rate_limited",
            PaneState::AwaitingMethodSelect => "awaiting_method_select",
            PaneState::AwaitingUrl => "awaiting_url",
            PaneState::AuthPending => "auth_pending",
            PaneState::CodeReceived => "code_received",
            PaneState::AwaitingConfirm => "awaiting_confirm",
            PaneState::Resuming => "resuming",
            PaneState::Failed => "failed",
        }
    }
}

impl fmt::Display for PaneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keystroke classes with independent injection cooldowns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InjectionKind {
    Login,
    MethodSelect,
    Resume,
}

impl InjectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InjectionKind::Login => "login",
            InjectionKind::MethodSelect => "method_select",
            InjectionKind::Resume => "resume",
        }
    }
}

/// A captured OAuth URL waiting for its code, handed to the local agent.
#[derive(Debug, Clone, Serialize)]
pub struct AuthRequest {
    pub request_id: String,
    pub pane_id: u64,
    pub provider: Option<Provider>,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

/// The agent's answer to an [`AuthRequest`].
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    pub request_id: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Outcome reported through the completion callback.
#[derive(Debug, Clone, Serialize)]
pub struct AuthCompletion {
    pub pane_id: u64,
    pub request_id: String,
    pub provider: Option<Provider>,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub(super) struct ReceivedCode {
    pub code: String,
    #[allow(dead_code)]
    pub account: Option<String>,
}

/// Mutable per-pane record. Guarded by its own lock in the coordinator's
/// tracker map so one slow pane cannot stall the rest.
#[derive(Debug)]
pub struct PaneTracker {
    pub pane_id: u64,
    pub state: PaneState,
    pub provider: Option<Provider>,
    state_entered: DateTime<Utc>,
    last_fingerprint: u64,
    pub(super) request: Option<AuthRequest>,
    pub(super) code: Option<ReceivedCode>,
    last_injection: HashMap<InjectionKind, DateTime<Utc>>,
}

impl PaneTracker {
    pub fn new(pane_id: u64) -> Self {
        Self {
            pane_id,
            state: PaneState::Idle,
            provider: None,
            state_entered: Utc::now(),
            last_fingerprint: 0,
            request: None,
            code: None,
            last_injection: HashMap::new(),
        }
    }

    /// Move to `next` and restart the state clock.
    pub fn transition(&mut self, next: PaneState) {
        if self.state != next {
            tracing::debug!(
                pane = self.pane_id,
                from = self.state.as_str(),
                to = next.as_str(),
                "Pane state transition"
            );
        }
        self.state = next;
        self.state_entered = Utc::now();
    }

    /// Back to Idle, discarding any pending request and stored code.
    pub fn reset(&mut self) {
        self.request = None;
        self.code = None;
        self.provider = None;
        self.transition(PaneState::Idle);
    }

    pub fn in_state_for(&self) -> Duration {
        (Utc::now() - self.state_entered)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// True when the previous output snapshot matches `fingerprint`;
    /// records the new value either way.
    pub fn output_unchanged(&mut self, fingerprint: u64) -> bool {
        let unchanged = self.last_fingerprint == fingerprint;
        self.last_fingerprint = fingerprint;
        unchanged
    }

    /// Whether a `kind` injection is allowed now, honoring its cooldown.
    pub fn can_inject(&self, kind: InjectionKind, cooldown: Duration) -> bool {
        match self.last_injection.get(&kind) {
            Some(last) => {
                let elapsed = (Utc::now() - *last).to_std().unwrap_or(Duration::ZERO);
                elapsed >= cooldown
            }
            None => true,
        }
    }

    pub fn note_injection(&mut self, kind: InjectionKind) {
        self.last_injection.insert(kind, Utc::now());
    }

    /// Backdate the state clock, for timeout tests.
    #[doc(hidden)]
    pub fn backdate_state(&mut self, by: Duration) {
        self.state_entered -= chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_restarts_the_state_clock() {
        let mut tracker = PaneTracker::new(1);
        tracker.backdate_state(Duration::from_secs(45));
        assert!(tracker.in_state_for() >= Duration::from_secs(44));

        tracker.transition(PaneState::RateLimited);
        assert!(tracker.in_state_for() < Duration::from_secs(1));
        assert_eq!(tracker.state, PaneState::RateLimited);
    }

    #[test]
    fn reset_discards_request_and_code() {
        let mut tracker = PaneTracker::new(2);
        tracker.provider = Some(Provider::Claude);
        tracker.request = Some(AuthRequest {
            request_id: "req-1".to_string(),
            pane_id: 2,
            provider: Some(Provider::Claude),
            url: "https://claude.ai/oauth/authorize?x".to_string(),
            created_at: Utc::now(),
        });
        tracker.code = Some(ReceivedCode {
            code: "CODE123".to_string(),
            account: None,
        });

        tracker.reset();
        assert_eq!(tracker.state, PaneState::Idle);
        assert!(tracker.request.is_none());
        assert!(tracker.code.is_none());
        assert!(tracker.provider.is_none());
    }

    #[test]
    fn injection_cooldowns_are_per_kind() {
        let mut tracker = PaneTracker::new(3);
        let cooldown = Duration::from_secs(5);

        assert!(tracker.can_inject(InjectionKind::Login, cooldown));
        tracker.note_injection(InjectionKind::Login);
        assert!(!tracker.can_inject(InjectionKind::Login, cooldown));
        assert!(tracker.can_inject(InjectionKind::Resume, cooldown));
        assert!(tracker.can_inject(InjectionKind::Login, Duration::ZERO));
    }

    #[test]
    fn output_fingerprint_detects_change() {
        let mut tracker = PaneTracker::new(4);
        assert!(!tracker.output_unchanged(42));
        assert!(tracker.output_unchanged(42));
        assert!(!tracker.output_unchanged(43));
    }
}
