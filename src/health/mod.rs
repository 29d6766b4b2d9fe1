//! Per-profile health metadata: expiry, rate-limit penalty, plan.
//!
//! Penalties decay exponentially so an account hammered yesterday is not
//! punished forever: `penalty(t) = penalty₀ · 2^(−Δt / half_life)`. The
//! store is a single mutex-guarded JSON document replaced atomically on
//! every mutation.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::provider::Provider;

pub const HEALTH_VERSION: u32 = 1;

/// Penalty added when a provider reports a rate limit against a profile.
const RATE_LIMIT_PENALTY: f64 = 25.0;
/// Penalty added per recorded error.
const ERROR_PENALTY: f64 = 5.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub penalty: f64,
    pub penalty_updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rate_limited: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recent_errors: u32,
    pub updated_at: DateTime<Utc>,
}

impl HealthRecord {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            token_expiry: None,
            penalty: 0.0,
            penalty_updated_at: now,
            plan: None,
            last_rate_limited: None,
            recent_errors: 0,
            updated_at: now,
        }
    }

    /// Penalty as of `now`, with decay applied but not folded back in.
    pub fn penalty_at(&self, now: DateTime<Utc>, half_life: Duration) -> f64 {
        decayed(self.penalty, self.penalty_updated_at, now, half_life)
    }
}

fn decayed(
    penalty: f64,
    since: DateTime<Utc>,
    now: DateTime<Utc>,
    half_life: Duration,
) -> f64 {
    if penalty <= 0.0 {
        return 0.0;
    }
    let elapsed = (now - since).num_milliseconds().max(0) as f64 / 1000.0;
    let half_life = half_life.as_secs_f64().max(1.0);
    penalty * 0.5_f64.powf(elapsed / half_life)
}

#[derive(Debug, Serialize, Deserialize)]
struct HealthData {
    version: u32,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    records: BTreeMap<String, HealthRecord>,
}

impl Default for HealthData {
    fn default() -> Self {
        Self {
            version: HEALTH_VERSION,
            updated_at: Utc::now(),
            records: BTreeMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct HealthStore {
    path: PathBuf,
    half_life: Duration,
    inner: Mutex<HealthData>,
}

impl HealthStore {
    /// Open the store at `path`, reading any existing document. A missing
    /// file is an empty store; a newer-versioned file is a hard error.
    pub fn open(path: impl Into<PathBuf>, half_life: Duration) -> Result<Self> {
        let path = path.into();
        let data = match std::fs::read(&path) {
            Ok(bytes) => {
                let data: HealthData = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::parse("health file", e))?;
                if data.version > HEALTH_VERSION {
                    return Err(Error::VersionNewer {
                        found: data.version,
                        supported: HEALTH_VERSION,
                    });
                }
                data
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HealthData::default(),
            Err(e) => return Err(Error::io(format!("reading {}", path.display()), e)),
        };
        Ok(Self {
            path,
            half_life,
            inner: Mutex::new(data),
        })
    }

    /// A provider told us this profile is rate limited.
    pub fn record_rate_limit(
        &self,
        provider: Provider,
        name: &str,
        plan: Option<&str>,
    ) -> Result<()> {
        self.update(provider, name, |record, now| {
            record.penalty += RATE_LIMIT_PENALTY;
            record.last_rate_limited = Some(now);
            if let Some(plan) = plan {
                record.plan = Some(plan.to_string());
            }
        })
    }

    pub fn record_error(&self, provider: Provider, name: &str) -> Result<()> {
        self.update(provider, name, |record, _now| {
            record.penalty += ERROR_PENALTY;
            record.recent_errors = record.recent_errors.saturating_add(1);
        })
    }

    /// A successful use halves the remaining penalty and forgives one error.
    pub fn record_success(&self, provider: Provider, name: &str) -> Result<()> {
        self.update(provider, name, |record, _now| {
            record.penalty /= 2.0;
            record.recent_errors = record.recent_errors.saturating_sub(1);
        })
    }

    pub fn set_token_expiry(
        &self,
        provider: Provider,
        name: &str,
        expiry: DateTime<Utc>,
    ) -> Result<()> {
        self.update(provider, name, |record, _now| {
            record.token_expiry = Some(expiry);
        })
    }

    /// Current decayed penalty; 0 for unknown profiles.
    pub fn penalty(&self, provider: Provider, name: &str) -> f64 {
        let inner = self.inner.lock();
        inner
            .records
            .get(&provider.key(name))
            .map(|r| r.penalty_at(Utc::now(), self.half_life))
            .unwrap_or(0.0)
    }

    pub fn record(&self, provider: Provider, name: &str) -> Option<HealthRecord> {
        self.inner.lock().records.get(&provider.key(name)).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, HealthRecord> {
        self.inner.lock().records.clone()
    }

    fn update(
        &self,
        provider: Provider,
        name: &str,
        apply: impl FnOnce(&mut HealthRecord, DateTime<Utc>),
    ) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let record = inner
            .records
            .entry(provider.key(name))
            .or_insert_with(|| HealthRecord::new(now));

        // Fold the decay in before applying the mutation, so additions
        // stack on the current value rather than the historical one.
        record.penalty = decayed(record.penalty, record.penalty_updated_at, now, self.half_life);
        record.penalty_updated_at = now;
        apply(record, now);
        record.updated_at = now;
        inner.updated_at = now;

        self.persist(&inner)
    }

    fn persist(&self, data: &HealthData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;
        }
        let payload =
            serde_json::to_vec_pretty(data).map_err(|e| Error::parse("health file", e))?;
        let tmp = self.path.with_extension(format!("{}.tmp", std::process::id()));
        std::fs::write(&tmp, &payload)
            .map_err(|e| Error::io(format!("writing {}", tmp.display()), e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            Error::io(format!("replacing {}", self.path.display()), e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> HealthStore {
        HealthStore::open(tmp.path().join("health.json"), Duration::from_secs(3600)).unwrap()
    }

    #[test]
    fn rate_limit_adds_penalty_and_plan() {
        let tmp = TempDir::new().unwrap();
        let health = store(&tmp);
        health
            .record_rate_limit(Provider::Claude, "alice", Some("pro"))
            .unwrap();

        let record = health.record(Provider::Claude, "alice").unwrap();
        assert!(record.penalty >= RATE_LIMIT_PENALTY - 0.01);
        assert_eq!(record.plan.as_deref(), Some("pro"));
        assert!(record.last_rate_limited.is_some());
        assert!(health.penalty(Provider::Claude, "alice") > 20.0);
    }

    #[test]
    fn penalty_decays_with_half_life() {
        let tmp = TempDir::new().unwrap();
        let health = store(&tmp);
        health
            .record_rate_limit(Provider::Codex, "bob", None)
            .unwrap();

        // Backdate the penalty one half-life.
        {
            let mut inner = health.inner.lock();
            let record = inner.records.get_mut("codex:bob").unwrap();
            record.penalty_updated_at = Utc::now() - ChronoDuration::hours(1);
        }
        let penalty = health.penalty(Provider::Codex, "bob");
        assert!((penalty - RATE_LIMIT_PENALTY / 2.0).abs() < 1.0, "{penalty}");
    }

    #[test]
    fn success_halves_penalty_and_forgives_an_error() {
        let tmp = TempDir::new().unwrap();
        let health = store(&tmp);
        health.record_error(Provider::Gemini, "g").unwrap();
        health.record_error(Provider::Gemini, "g").unwrap();
        assert_eq!(health.record(Provider::Gemini, "g").unwrap().recent_errors, 2);

        health.record_success(Provider::Gemini, "g").unwrap();
        let record = health.record(Provider::Gemini, "g").unwrap();
        assert_eq!(record.recent_errors, 1);
        assert!(record.penalty < 2.0 * ERROR_PENALTY);
    }

    #[test]
    fn persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("health.json");
        {
            let health =
                HealthStore::open(&path, Duration::from_secs(3600)).unwrap();
            health
                .record_rate_limit(Provider::Claude, "alice", Some("max"))
                .unwrap();
        }
        let reopened = HealthStore::open(&path, Duration::from_secs(3600)).unwrap();
        let record = reopened.record(Provider::Claude, "alice").unwrap();
        assert_eq!(record.plan.as_deref(), Some("max"));
        assert!(record.penalty > 0.0);
    }

    #[test]
    fn newer_version_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("health.json");
        std::fs::write(
            &path,
            br#"{"version": 99, "updated_at": "2025-01-01T00:00:00Z", "records": {}}"#,
        )
        .unwrap();
        let err = HealthStore::open(&path, Duration::from_secs(3600)).unwrap_err();
        assert!(matches!(err, Error::VersionNewer { found: 99, .. }));
    }

    #[test]
    fn unknown_profile_has_zero_penalty() {
        let tmp = TempDir::new().unwrap();
        let health = store(&tmp);
        assert_eq!(health.penalty(Provider::Claude, "nobody"), 0.0);
    }
}
