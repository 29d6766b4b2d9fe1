//! In-memory profile registry with the status state machine.
//!
//! One record per `(provider, name)` behind a single reader-writer lock.
//! The lock is never held across I/O or callbacks: mutators copy out what
//! they need, release, then notify. Persistence lives in [`state`]; the
//! background refresh driver in [`monitor`].

mod monitor;
mod profile;
pub mod state;

pub use monitor::{MonitorConfig, MonitorStats, PoolMonitor, RefreshOutcome, Refresher};
pub use profile::{PooledProfile, ProfileStatus};
pub use state::STATE_VERSION;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::provider::{validate_profile_name, Provider};
use crate::vault::Vault;

/// Construction-time tunables.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Errors tolerated before a profile is parked in `Error` status.
    pub max_retries: u32,
    /// Cooldown applied when `set_status` has to invent a deadline.
    pub cooldown: Duration,
    /// Window for "expiring soon" in the refresh sweep.
    pub refresh_threshold: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            cooldown: Duration::from_secs(5 * 60),
            refresh_threshold: Duration::from_secs(5 * 60),
        }
    }
}

/// Called with `(profile_copy, old_status, new_status)` after any status
/// change, outside the pool lock. Delivery is fire-and-forget.
pub type StateChangeFn = dyn Fn(PooledProfile, ProfileStatus, ProfileStatus) + Send + Sync;

type ChangeEvent = (PooledProfile, ProfileStatus, ProfileStatus);

#[derive(Debug, Clone, Serialize)]
pub struct PoolSummary {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub in_cooldown: usize,
    pub needing_refresh: usize,
}

pub struct AuthPool {
    profiles: RwLock<HashMap<String, PooledProfile>>,
    opts: PoolOptions,
    on_state_change: Option<Arc<StateChangeFn>>,
    cancel: CancellationToken,
}

impl AuthPool {
    pub fn new(opts: PoolOptions) -> Self {
        Self {
            profiles: RwLock::new(HashMap::new()),
            opts,
            on_state_change: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_state_change(mut self, hook: Arc<StateChangeFn>) -> Self {
        self.on_state_change = Some(hook);
        self
    }

    /// Tie snapshot I/O to `token`: once cancelled, save and load return
    /// [`crate::error::Error::Cancelled`] before touching the filesystem.
    /// In-memory mutators stay available for shutdown bookkeeping.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    fn ensure_live(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(crate::error::Error::Cancelled);
        }
        Ok(())
    }

    pub fn options(&self) -> &PoolOptions {
        &self.opts
    }

    // ── Registry ────────────────────────────────────────────────

    /// Register a profile. Adding an existing key is a no-op that returns
    /// the existing record's snapshot.
    pub fn add_profile(&self, provider: Provider, name: &str) -> Result<PooledProfile> {
        validate_profile_name(name)?;
        let key = provider.key(name);
        let mut profiles = self.profiles.write();
        let entry = profiles
            .entry(key)
            .or_insert_with(|| PooledProfile::new(provider, name));
        Ok(entry.clone())
    }

    /// Remove a profile. Returns whether it existed.
    pub fn remove_profile(&self, provider: Provider, name: &str) -> bool {
        self.profiles.write().remove(&provider.key(name)).is_some()
    }

    pub fn get(&self, provider: Provider, name: &str) -> Option<PooledProfile> {
        self.profiles.read().get(&provider.key(name)).cloned()
    }

    pub fn get_status(&self, provider: Provider, name: &str) -> Option<ProfileStatus> {
        self.profiles.read().get(&provider.key(name)).map(|p| p.status)
    }

    // ── Status transitions ──────────────────────────────────────

    /// Authoritative status override. Unlike the best-effort mutators this
    /// reports a missing profile as `NotFound`.
    pub fn set_status(&self, provider: Provider, name: &str, status: ProfileStatus) -> Result<()> {
        let key = provider.key(name);
        let event = {
            let mut profiles = self.profiles.write();
            let profile = profiles
                .get_mut(&key)
                .ok_or_else(|| crate::error::Error::NotFound(format!("profile {key}")))?;
            let old = profile.status;
            profile.status = status;
            match status {
                ProfileStatus::Ready => {
                    profile.error_count = 0;
                    profile.error_message.clear();
                    profile.cooldown_until = None;
                }
                ProfileStatus::Cooldown => {
                    // Keep the cooldown invariant: entering Cooldown always
                    // has a deadline, even through the generic setter.
                    if profile.cooldown_until.is_none() {
                        profile.cooldown_until = Some(
                            Utc::now()
                                + chrono::Duration::from_std(self.opts.cooldown)
                                    .unwrap_or_else(|_| chrono::Duration::minutes(5)),
                        );
                    }
                }
                _ => {}
            }
            change_event(profile, old)
        };
        self.fire(event.into_iter().collect());
        Ok(())
    }

    /// Single-flight primitive: observe not-Refreshing and transition in one
    /// critical section. Exactly one concurrent caller gets `true`; that
    /// caller is obligated to finish with `mark_refreshed` or `set_error`.
    pub fn try_mark_refreshing(&self, provider: Provider, name: &str) -> bool {
        let key = provider.key(name);
        let event = {
            let mut profiles = self.profiles.write();
            let Some(profile) = profiles.get_mut(&key) else {
                return false;
            };
            if profile.status == ProfileStatus::Refreshing {
                return false;
            }
            let old = profile.status;
            profile.status = ProfileStatus::Refreshing;
            change_event(profile, old)
        };
        self.fire(event.into_iter().collect());
        true
    }

    /// Record a failed attempt. Best-effort: missing profiles are ignored.
    ///
    /// Below the retry budget the profile drops back to `Expired` when it
    /// was mid-flight (`Refreshing`) or nominally usable (`Ready`), so the
    /// sweep will retry it; at the budget it is parked in `Error`.
    pub fn set_error(&self, provider: Provider, name: &str, message: &str) {
        let key = provider.key(name);
        let event = {
            let mut profiles = self.profiles.write();
            let Some(profile) = profiles.get_mut(&key) else {
                return;
            };
            let old = profile.status;
            profile.error_count = profile.error_count.saturating_add(1);
            profile.error_message = message.to_string();
            profile.last_check = Some(Utc::now());
            profile.status = if profile.error_count >= self.opts.max_retries {
                ProfileStatus::Error
            } else if matches!(old, ProfileStatus::Refreshing | ProfileStatus::Ready) {
                ProfileStatus::Expired
            } else {
                old
            };
            change_event(profile, old)
        };
        self.fire(event.into_iter().collect());
    }

    /// Park a profile until `now + duration`. Best-effort.
    pub fn set_cooldown(&self, provider: Provider, name: &str, duration: Duration) {
        let key = provider.key(name);
        let event = {
            let mut profiles = self.profiles.write();
            let Some(profile) = profiles.get_mut(&key) else {
                return;
            };
            let old = profile.status;
            profile.status = ProfileStatus::Cooldown;
            profile.cooldown_until = Some(
                Utc::now()
                    + chrono::Duration::from_std(duration)
                        .unwrap_or_else(|_| chrono::Duration::minutes(5)),
            );
            change_event(profile, old)
        };
        self.fire(event.into_iter().collect());
    }

    /// Lift a cooldown early. Best-effort.
    pub fn clear_cooldown(&self, provider: Provider, name: &str) {
        let key = provider.key(name);
        let event = {
            let mut profiles = self.profiles.write();
            let Some(profile) = profiles.get_mut(&key) else {
                return;
            };
            let old = profile.status;
            profile.cooldown_until = None;
            if old == ProfileStatus::Cooldown {
                profile.status = ProfileStatus::Ready;
                profile.error_count = 0;
                profile.error_message.clear();
            }
            change_event(profile, old)
        };
        self.fire(event.into_iter().collect());
    }

    /// Record a token expiry observed out-of-band. Auto-demotes Ready (and
    /// Unknown) to Expired when the expiry is already past, and promotes
    /// Expired back to Ready when it is in the future. Best-effort.
    pub fn update_token_expiry(
        &self,
        provider: Provider,
        name: &str,
        expiry: chrono::DateTime<Utc>,
    ) {
        let key = provider.key(name);
        let event = {
            let mut profiles = self.profiles.write();
            let Some(profile) = profiles.get_mut(&key) else {
                return;
            };
            let old = profile.status;
            let now = Utc::now();
            profile.token_expiry = Some(expiry);
            profile.last_check = Some(now);
            match old {
                ProfileStatus::Ready | ProfileStatus::Unknown if now >= expiry => {
                    profile.status = ProfileStatus::Expired;
                }
                ProfileStatus::Expired if now < expiry => {
                    profile.status = ProfileStatus::Ready;
                    profile.error_count = 0;
                    profile.error_message.clear();
                }
                _ => {}
            }
            change_event(profile, old)
        };
        self.fire(event.into_iter().collect());
    }

    /// Land a successful refresh: Ready, errors cleared, fresh expiry.
    /// Best-effort.
    pub fn mark_refreshed(&self, provider: Provider, name: &str, expiry: chrono::DateTime<Utc>) {
        let key = provider.key(name);
        let event = {
            let mut profiles = self.profiles.write();
            let Some(profile) = profiles.get_mut(&key) else {
                return;
            };
            let old = profile.status;
            profile.status = ProfileStatus::Ready;
            profile.error_count = 0;
            profile.error_message.clear();
            profile.token_expiry = Some(expiry);
            profile.last_refresh = Some(Utc::now());
            profile.cooldown_until = None;
            change_event(profile, old)
        };
        self.fire(event.into_iter().collect());
    }

    /// Stamp `last_used`. Best-effort.
    pub fn mark_used(&self, provider: Provider, name: &str) {
        let mut profiles = self.profiles.write();
        if let Some(profile) = profiles.get_mut(&provider.key(name)) {
            profile.last_used = Some(Utc::now());
        }
    }

    /// Wake every cooldown whose deadline has passed. Returns how many
    /// profiles went back to Ready.
    pub fn check_and_update_cooldowns(&self) -> usize {
        let now = Utc::now();
        let events: Vec<ChangeEvent> = {
            let mut profiles = self.profiles.write();
            profiles
                .values_mut()
                .filter(|p| {
                    p.status == ProfileStatus::Cooldown
                        && p.cooldown_until.is_some_and(|until| until <= now)
                })
                .filter_map(|profile| {
                    let old = profile.status;
                    profile.status = ProfileStatus::Ready;
                    profile.cooldown_until = None;
                    profile.error_count = 0;
                    profile.error_message.clear();
                    profile.last_check = Some(now);
                    change_event(profile, old)
                })
                .collect()
        };
        let woken = events.len();
        self.fire(events);
        woken
    }

    // ── Queries ─────────────────────────────────────────────────

    /// Ready profiles, best first: priority descending, then least recently
    /// used (never-used profiles ahead of all others).
    pub fn get_ready_profiles(&self, provider: Option<Provider>) -> Vec<PooledProfile> {
        let mut ready: Vec<PooledProfile> = self
            .profiles
            .read()
            .values()
            .filter(|p| p.status == ProfileStatus::Ready)
            .filter(|p| provider.is_none_or(|want| p.provider == want))
            .cloned()
            .collect();
        ready.sort_by(|a, b| {
            Reverse(a.priority)
                .cmp(&Reverse(b.priority))
                .then(a.last_used.cmp(&b.last_used))
                .then(a.name.cmp(&b.name))
        });
        ready
    }

    pub fn select_best(&self, provider: Option<Provider>) -> Option<PooledProfile> {
        self.get_ready_profiles(provider).into_iter().next()
    }

    /// Profiles the refresh sweep should target: errored/expired status, or
    /// a token inside the refresh threshold.
    pub fn get_profiles_needing_refresh(&self, provider: Option<Provider>) -> Vec<PooledProfile> {
        let threshold = self.opts.refresh_threshold;
        let mut out: Vec<PooledProfile> = self
            .profiles
            .read()
            .values()
            .filter(|p| provider.is_none_or(|want| p.provider == want))
            .filter(|p| p.status.needs_refresh() || p.is_expiring_soon(threshold))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn get_profiles_in_cooldown(&self) -> Vec<PooledProfile> {
        let mut out: Vec<PooledProfile> = self
            .profiles
            .read()
            .values()
            .filter(|p| p.status == ProfileStatus::Cooldown)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn get_all_profiles(&self) -> Vec<PooledProfile> {
        let mut out: Vec<PooledProfile> = self.profiles.read().values().cloned().collect();
        out.sort_by_key(|p| p.key());
        out
    }

    pub fn count(&self) -> usize {
        self.profiles.read().len()
    }

    pub fn count_by_status(&self) -> BTreeMap<ProfileStatus, usize> {
        let mut counts: BTreeMap<ProfileStatus, usize> =
            ProfileStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for profile in self.profiles.read().values() {
            *counts.entry(profile.status).or_default() += 1;
        }
        counts
    }

    pub fn summary(&self) -> PoolSummary {
        let by_status: BTreeMap<String, usize> = self
            .count_by_status()
            .into_iter()
            .map(|(status, n)| (status.as_str().to_string(), n))
            .collect();
        PoolSummary {
            total: self.count(),
            in_cooldown: self.get_profiles_in_cooldown().len(),
            needing_refresh: self.get_profiles_needing_refresh(None).len(),
            by_status,
        }
    }

    // ── Snapshot I/O ────────────────────────────────────────────

    pub async fn save(&self, path: &Path) -> Result<()> {
        self.ensure_live()?;
        let snapshot: BTreeMap<String, PooledProfile> = {
            let profiles = self.profiles.read();
            profiles
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        state::save(path, &snapshot).await
    }

    /// Replace the entire in-memory set with the snapshot at `path`.
    /// A missing file is an empty pool.
    pub async fn load(&self, path: &Path) -> Result<()> {
        self.ensure_live()?;
        let loaded = state::load(path).await?;
        self.install(loaded);
        Ok(())
    }

    /// [`AuthPool::load`] from any reader (tests, stdin, a socket).
    pub fn load_from_reader(&self, mut reader: impl std::io::Read) -> Result<()> {
        self.ensure_live()?;
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .map_err(|e| crate::error::Error::io("reading state", e))?;
        let loaded = state::load_from_slice(&bytes)?;
        self.install(loaded);
        Ok(())
    }

    fn install(&self, loaded: BTreeMap<String, PooledProfile>) {
        let mut profiles = self.profiles.write();
        profiles.clear();
        profiles.extend(loaded);
    }

    /// Seed the pool from the vault: one `Unknown` profile per stored
    /// `(provider, name)`. Existing keys are left untouched. Returns how
    /// many entries were seen.
    pub async fn load_from_vault(&self, vault: &Vault) -> Result<usize> {
        self.ensure_live()?;
        let entries = vault.list_all().await?;
        let seen = entries.len();
        for entry in entries {
            self.add_profile(entry.provider, &entry.name)?;
        }
        tracing::info!(profiles = seen, "Seeded pool from vault");
        Ok(seen)
    }

    // ── Callback plumbing ───────────────────────────────────────

    fn fire(&self, events: Vec<ChangeEvent>) {
        let Some(hook) = &self.on_state_change else {
            return;
        };
        for (profile, old, new) in events {
            let hook = Arc::clone(hook);
            // Detach onto the runtime when one is available so a slow hook
            // cannot stall the mutating caller.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { hook(profile, old, new) });
            } else {
                hook(profile, old, new);
            }
        }
    }
}

fn change_event(profile: &PooledProfile, old: ProfileStatus) -> Option<ChangeEvent> {
    (profile.status != old).then(|| (profile.clone(), old, profile.status))
}
