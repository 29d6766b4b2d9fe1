//! Background refresh coordinator.
//!
//! One scheduler task sweeps the pool on an interval: expire cooldowns,
//! collect profiles needing refresh, and fan out bounded refresh tasks.
//! The actual token exchange lives behind the injected [`Refresher`]; the
//! monitor never speaks HTTPS itself. Each start owns a cancellation
//! token: `stop` cancels it, the scheduler exits, and every in-flight
//! refresh races its exchange against the token so cancellation still
//! lands a terminal transition on the profile.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::pool::{AuthPool, ProfileStatus};
use crate::provider::Provider;

/// Performs the provider's token-refresh exchange. Must be idempotent under
/// retry; the monitor treats transient and permanent failures identically.
#[async_trait]
pub trait Refresher: Send + Sync {
    async fn refresh(&self, provider: Provider, name: &str) -> Result<DateTime<Utc>>;
}

/// What a completed attempt produced, as seen by the completion hook.
pub type RefreshOutcome = std::result::Result<DateTime<Utc>, String>;

pub type RefreshStartFn = dyn Fn(Provider, &str) + Send + Sync;
pub type RefreshCompleteFn = dyn Fn(Provider, &str, &RefreshOutcome) + Send + Sync;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub check_interval: Duration,
    /// Upper bound on concurrently running refresh tasks.
    pub max_concurrent: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            max_concurrent: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStats {
    pub running: bool,
    pub max_concurrent: usize,
    pub in_flight: usize,
    pub last_sweep: Option<DateTime<Utc>>,
}

struct Scheduler {
    handle: JoinHandle<()>,
    shutdown: CancellationToken,
}

pub struct PoolMonitor {
    pool: Arc<AuthPool>,
    refresher: Option<Arc<dyn Refresher>>,
    cfg: MonitorConfig,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    last_sweep: Arc<Mutex<Option<DateTime<Utc>>>>,
    scheduler: Mutex<Option<Scheduler>>,
    on_refresh_start: Option<Arc<RefreshStartFn>>,
    on_refresh_complete: Option<Arc<RefreshCompleteFn>>,
}

impl PoolMonitor {
    pub fn new(pool: Arc<AuthPool>, cfg: MonitorConfig) -> Self {
        let permits = cfg.max_concurrent.max(1);
        Self {
            pool,
            refresher: None,
            cfg,
            semaphore: Arc::new(Semaphore::new(permits)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            last_sweep: Arc::new(Mutex::new(None)),
            scheduler: Mutex::new(None),
            on_refresh_start: None,
            on_refresh_complete: None,
        }
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn Refresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn on_refresh_start(mut self, hook: Arc<RefreshStartFn>) -> Self {
        self.on_refresh_start = Some(hook);
        self
    }

    pub fn on_refresh_complete(mut self, hook: Arc<RefreshCompleteFn>) -> Self {
        self.on_refresh_complete = Some(hook);
        self
    }

    pub fn stats(&self) -> MonitorStats {
        MonitorStats {
            running: self.scheduler.lock().is_some(),
            max_concurrent: self.cfg.max_concurrent,
            in_flight: self.in_flight.load(Ordering::SeqCst),
            last_sweep: *self.last_sweep.lock(),
        }
    }

    /// Launch the scheduler task. Refuses a double start.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut scheduler = self.scheduler.lock();
        if scheduler.is_some() {
            return Err(Error::AlreadyInProgress("monitor".to_string()));
        }

        let token = CancellationToken::new();
        let loop_token = token.clone();
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.cfg.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => monitor.sweep().await,
                    () = loop_token.cancelled() => break,
                }
            }
            tracing::debug!("Monitor scheduler stopped");
        });

        *scheduler = Some(Scheduler {
            handle,
            shutdown: token,
        });
        tracing::info!(
            interval_secs = self.cfg.check_interval.as_secs(),
            max_concurrent = self.cfg.max_concurrent,
            "Monitor started"
        );
        Ok(())
    }

    /// Stop the scheduler. Idempotent and safe from any thread. In-flight
    /// refresh tasks observe the cancellation and record `refresh
    /// cancelled` on their profile, so none is left in `Refreshing`.
    pub fn stop(&self) {
        if let Some(scheduler) = self.scheduler.lock().take() {
            scheduler.shutdown.cancel();
            scheduler.handle.abort();
            tracing::info!("Monitor stopped");
        }
    }

    /// Token of the current run; an inert token while stopped.
    fn current_token(&self) -> CancellationToken {
        self.scheduler
            .lock()
            .as_ref()
            .map_or_else(CancellationToken::new, |s| s.shutdown.clone())
    }

    /// One sweep: wake expired cooldowns, then fan out refreshes for every
    /// profile that needs one, bounded by `max_concurrent`.
    pub async fn sweep(self: &Arc<Self>) {
        let woken = self.pool.check_and_update_cooldowns();
        if woken > 0 {
            tracing::info!(woken, "Cooldowns expired");
        }
        *self.last_sweep.lock() = Some(Utc::now());

        let token = self.current_token();
        let targets: Vec<_> = self
            .pool
            .get_profiles_needing_refresh(None)
            .into_iter()
            .filter(|p| p.status != ProfileStatus::Refreshing)
            .collect();

        for target in targets {
            if token.is_cancelled() {
                return;
            }
            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            if !self.pool.try_mark_refreshing(target.provider, &target.name) {
                continue;
            }

            let monitor = Arc::clone(self);
            let task_token = token.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let _ = monitor
                    .run_refresh(target.provider, &target.name, &task_token)
                    .await;
            });
        }
    }

    /// Refresh one profile synchronously in the caller's context. Observes
    /// the running scheduler's cancellation: a `stop` mid-exchange returns
    /// [`Error::Cancelled`].
    pub async fn force_refresh(
        self: &Arc<Self>,
        provider: Provider,
        name: &str,
    ) -> Result<DateTime<Utc>> {
        let key = provider.key(name);
        let current = self
            .pool
            .get(provider, name)
            .ok_or_else(|| Error::NotFound(format!("profile {key}")))?;
        if current.status == ProfileStatus::Refreshing {
            return Err(Error::AlreadyInProgress(key));
        }
        if !self.pool.try_mark_refreshing(provider, name) {
            return Err(Error::AlreadyInProgress(key));
        }

        match self.run_refresh(provider, name, &self.current_token()).await {
            Ok(expiry) => Ok(expiry),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(Error::RefreshFailed { message, .. }) => Err(Error::RefreshFailed { key, message }),
            Err(other) => Err(Error::RefreshFailed {
                key,
                message: other.to_string(),
            }),
        }
    }

    /// Drive one claimed refresh to its terminal transition. The caller must
    /// already hold the Refreshing claim; every exit path here, including
    /// cancellation and a dropped future, leaves the profile out of
    /// Refreshing.
    async fn run_refresh(
        &self,
        provider: Provider,
        name: &str,
        token: &CancellationToken,
    ) -> Result<DateTime<Utc>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let mut guard = RefreshingGuard {
            pool: Arc::clone(&self.pool),
            in_flight: Arc::clone(&self.in_flight),
            provider,
            name: name.to_string(),
            armed: true,
        };

        if let Some(hook) = &self.on_refresh_start {
            hook(provider, name);
        }

        let result: Result<DateTime<Utc>> = match &self.refresher {
            None => Err(Error::RefreshFailed {
                key: provider.key(name),
                message: "no refresher configured".to_string(),
            }),
            Some(refresher) => tokio::select! {
                outcome = refresher.refresh(provider, name) => outcome,
                () = token.cancelled() => Err(Error::Cancelled),
            },
        };

        let outcome: RefreshOutcome = match &result {
            Ok(expiry) => {
                self.pool.mark_refreshed(provider, name, *expiry);
                tracing::info!(provider = %provider, profile = name, "Token refreshed");
                Ok(*expiry)
            }
            Err(e) => {
                let message = match e {
                    Error::Cancelled => "refresh cancelled".to_string(),
                    Error::RefreshFailed { message, .. } => message.clone(),
                    other => other.to_string(),
                };
                self.pool.set_error(provider, name, &message);
                tracing::warn!(provider = %provider, profile = name, error = %message, "Refresh failed");
                Err(message)
            }
        };
        guard.disarm();

        if let Some(hook) = &self.on_refresh_complete {
            hook(provider, name, &outcome);
        }
        result
    }
}

/// Ensures a claimed refresh cannot strand its profile in `Refreshing` if
/// the surrounding future is dropped mid-flight.
struct RefreshingGuard {
    pool: Arc<AuthPool>,
    in_flight: Arc<AtomicUsize>,
    provider: Provider,
    name: String,
    armed: bool,
}

impl RefreshingGuard {
    fn disarm(&mut self) {
        self.armed = false;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for RefreshingGuard {
    fn drop(&mut self) {
        if self.armed {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.pool
                .set_error(self.provider, &self.name, "refresh cancelled");
        }
    }
}
