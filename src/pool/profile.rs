//! Pooled profile record and its status state machine.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::provider::Provider;

/// Lifecycle status of a pooled profile. Status is authoritative for
/// routing; derived predicates like [`PooledProfile::is_expired`] are only
/// consulted where the transitions say so.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileStatus {
    Unknown,
    Ready,
    Refreshing,
    Expired,
    Cooldown,
    Error,
}

impl ProfileStatus {
    pub const ALL: [ProfileStatus; 6] = [
        ProfileStatus::Unknown,
        ProfileStatus::Ready,
        ProfileStatus::Refreshing,
        ProfileStatus::Expired,
        ProfileStatus::Cooldown,
        ProfileStatus::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProfileStatus::Unknown => "unknown",
            ProfileStatus::Ready => "ready",
            ProfileStatus::Refreshing => "refreshing",
            ProfileStatus::Expired => "expired",
            ProfileStatus::Cooldown => "cooldown",
            ProfileStatus::Error => "error",
        }
    }

    /// Recognize a lowercase snapshot tag. `None` for tags this build does
    /// not know, which the loader flags and maps to `Unknown`.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "unknown" => Some(ProfileStatus::Unknown),
            "ready" => Some(ProfileStatus::Ready),
            "refreshing" => Some(ProfileStatus::Refreshing),
            "expired" => Some(ProfileStatus::Expired),
            "cooldown" => Some(ProfileStatus::Cooldown),
            "error" => Some(ProfileStatus::Error),
            _ => None,
        }
    }

    /// Expired and errored profiles are what the refresh sweep targets.
    pub fn needs_refresh(self) -> bool {
        matches!(self, ProfileStatus::Expired | ProfileStatus::Error)
    }

    pub fn is_usable(self) -> bool {
        self == ProfileStatus::Ready
    }
}

impl fmt::Display for ProfileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One profile's in-memory record. Mutated only through the pool's
/// operations; callers always receive copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PooledProfile {
    pub provider: Provider,
    pub name: String,
    pub status: ProfileStatus,
    pub token_expiry: Option<DateTime<Utc>>,
    pub last_refresh: Option<DateTime<Utc>>,
    pub last_check: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub error_message: String,
    /// Higher is preferred during selection. Default 0.
    pub priority: i32,
}

impl PooledProfile {
    pub fn new(provider: Provider, name: impl Into<String>) -> Self {
        Self {
            provider,
            name: name.into(),
            status: ProfileStatus::Unknown,
            token_expiry: None,
            last_refresh: None,
            last_check: None,
            last_used: None,
            cooldown_until: None,
            error_count: 0,
            error_message: String::new(),
            priority: 0,
        }
    }

    pub fn key(&self) -> String {
        self.provider.key(&self.name)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.token_expiry.is_some_and(|expiry| now >= expiry)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Whether the token expires within `window` from now. Unset expiries
    /// never count as expiring.
    pub fn is_expiring_soon(&self, window: Duration) -> bool {
        let Some(expiry) = self.token_expiry else {
            return false;
        };
        let window = ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::zero());
        Utc::now() + window >= expiry
    }

    pub fn is_in_cooldown_at(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    pub fn is_in_cooldown(&self) -> bool {
        self.is_in_cooldown_at(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_tags_roundtrip() {
        for status in ProfileStatus::ALL {
            assert_eq!(ProfileStatus::from_tag(status.as_str()), Some(status));
        }
        assert_eq!(ProfileStatus::from_tag("banana"), None);
    }

    #[test]
    fn needs_refresh_covers_expired_and_error() {
        assert!(ProfileStatus::Expired.needs_refresh());
        assert!(ProfileStatus::Error.needs_refresh());
        assert!(!ProfileStatus::Ready.needs_refresh());
        assert!(!ProfileStatus::Cooldown.needs_refresh());
        assert!(!ProfileStatus::Refreshing.needs_refresh());
    }

    #[test]
    fn expiry_predicates() {
        let mut p = PooledProfile::new(Provider::Claude, "alice");
        assert!(!p.is_expired());
        assert!(!p.is_expiring_soon(Duration::from_secs(300)));

        p.token_expiry = Some(Utc::now() - ChronoDuration::minutes(1));
        assert!(p.is_expired());
        assert!(p.is_expiring_soon(Duration::from_secs(0)));

        p.token_expiry = Some(Utc::now() + ChronoDuration::minutes(2));
        assert!(!p.is_expired());
        assert!(p.is_expiring_soon(Duration::from_secs(300)));
        assert!(!p.is_expiring_soon(Duration::from_secs(30)));
    }

    #[test]
    fn cooldown_predicate_uses_deadline() {
        let mut p = PooledProfile::new(Provider::Codex, "bob");
        assert!(!p.is_in_cooldown());
        p.cooldown_until = Some(Utc::now() + ChronoDuration::minutes(5));
        assert!(p.is_in_cooldown());
        p.cooldown_until = Some(Utc::now() - ChronoDuration::minutes(5));
        assert!(!p.is_in_cooldown());
    }
}
