//! Activity log capability.
//!
//! The embedded activity database lives outside this crate; the core only
//! appends events and asks which cooldowns are live. A no-op impl runs the
//! daemon without any database, and the in-memory impl backs tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::provider::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Switch,
    Refresh,
    RateLimit,
    CooldownSet,
    CooldownCleared,
    AuthFlow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub at: DateTime<Utc>,
    pub provider: Provider,
    pub profile: String,
    pub kind: EventKind,
    #[serde(default)]
    pub detail: String,
    /// Deadline for cooldown events; unset otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
}

impl ActivityEvent {
    pub fn now(provider: Provider, profile: &str, kind: EventKind, detail: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            provider,
            profile: profile.to_string(),
            kind,
            detail: detail.into(),
            until: None,
        }
    }

    pub fn with_until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }
}

/// A cooldown currently in force, as reported by the log backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveCooldown {
    pub provider: Provider,
    pub profile: String,
    pub until: DateTime<Utc>,
}

#[async_trait]
pub trait ActivityLog: Send + Sync {
    async fn append(&self, event: ActivityEvent) -> Result<()>;
    async fn active_cooldowns(&self) -> Result<Vec<ActiveCooldown>>;
}

/// Discards everything. Used when no activity backend is wired in.
#[derive(Debug, Default)]
pub struct NoopActivityLog;

#[async_trait]
impl ActivityLog for NoopActivityLog {
    async fn append(&self, _event: ActivityEvent) -> Result<()> {
        Ok(())
    }

    async fn active_cooldowns(&self) -> Result<Vec<ActiveCooldown>> {
        Ok(Vec::new())
    }
}

/// Keeps events in memory. Tests assert against its contents.
#[derive(Debug, Default)]
pub struct MemoryActivityLog {
    events: Mutex<Vec<ActivityEvent>>,
}

impl MemoryActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ActivityEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl ActivityLog for MemoryActivityLog {
    async fn append(&self, event: ActivityEvent) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }

    async fn active_cooldowns(&self) -> Result<Vec<ActiveCooldown>> {
        let now = Utc::now();
        let events = self.events.lock();
        let mut live: Vec<ActiveCooldown> = Vec::new();
        for event in events.iter() {
            match event.kind {
                EventKind::CooldownSet => {
                    if let Some(until) = event.until {
                        live.retain(|c| {
                            !(c.provider == event.provider && c.profile == event.profile)
                        });
                        if until > now {
                            live.push(ActiveCooldown {
                                provider: event.provider,
                                profile: event.profile.clone(),
                                until,
                            });
                        }
                    }
                }
                EventKind::CooldownCleared => {
                    live.retain(|c| !(c.provider == event.provider && c.profile == event.profile));
                }
                _ => {}
            }
        }
        Ok(live)
    }
}
