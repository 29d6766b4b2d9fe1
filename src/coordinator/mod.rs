//! Pane coordinator: watches multiplexer panes for rate-limit events and
//! drives the re-login flow.
//!
//! One tracker per observed pane, each behind its own lock; the tracker map
//! itself is locked only for insertion and cleanup. A single poll task
//! snapshots every pane's tail and fans the handling out per pane, so one
//! slow injection cannot stall the rest.

mod patterns;
pub mod server;
mod tracker;

pub use patterns::{detect_provider, extract_oauth_url, patterns_for};
pub use tracker::{
    AuthCompletion, AuthRequest, AuthResponse, InjectionKind, PaneState, PaneTracker,
};

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::pane::PaneClient;
use crate::provider::Provider;
use crate::util::{redact_code, redact_url, strip_ansi};

use tracker::ReceivedCode;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub poll_interval: Duration,
    /// How many trailing lines to fetch per pane per poll.
    pub output_lines: u32,
    /// Every non-Idle state resets to Idle after this long.
    pub state_timeout: Duration,
    /// AuthPending gets this longer budget before failing.
    pub auth_timeout: Duration,
    pub login_cooldown: Duration,
    pub method_select_cooldown: Duration,
    pub resume_cooldown: Duration,
    /// Pause before selecting the login method, letting the CLI draw.
    pub method_select_delay: Duration,
    /// Pause before injecting the resume prompt.
    pub resume_delay: Duration,
    pub resume_prompt: String,
    pub http_port: u16,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            output_lines: 100,
            state_timeout: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(60),
            login_cooldown: Duration::from_secs(5),
            method_select_cooldown: Duration::from_secs(2),
            resume_cooldown: Duration::from_secs(10),
            method_select_delay: Duration::from_millis(200),
            resume_delay: Duration::from_millis(500),
            resume_prompt: "Please continue with the task you were working on.".to_string(),
            http_port: 8377,
        }
    }
}

pub type AuthRequestFn = dyn Fn(AuthRequest) + Send + Sync;
pub type AuthCompleteFn = dyn Fn(AuthCompletion) + Send + Sync;

#[derive(Debug, Clone, Serialize)]
pub struct PaneSummary {
    pub pane_id: u64,
    pub state: PaneState,
    pub provider: Option<Provider>,
    pub has_request: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub running: bool,
    pub backend: &'static str,
    pub pane_count: usize,
    pub pending_auths: usize,
    pub panes: Vec<PaneSummary>,
    pub pending_details: Vec<AuthRequest>,
}

struct Scheduler {
    handle: JoinHandle<()>,
    shutdown: tokio::sync::watch::Sender<bool>,
}

pub struct PaneCoordinator {
    client: Arc<dyn PaneClient>,
    cfg: CoordinatorConfig,
    trackers: Mutex<HashMap<u64, Arc<RwLock<PaneTracker>>>>,
    scheduler: Mutex<Option<Scheduler>>,
    on_auth_request: Option<Arc<AuthRequestFn>>,
    on_auth_complete: Option<Arc<AuthCompleteFn>>,
}

impl PaneCoordinator {
    pub fn new(client: Arc<dyn PaneClient>, cfg: CoordinatorConfig) -> Self {
        Self {
            client,
            cfg,
            trackers: Mutex::new(HashMap::new()),
            scheduler: Mutex::new(None),
            on_auth_request: None,
            on_auth_complete: None,
        }
    }

    pub fn on_auth_request(mut self, hook: Arc<AuthRequestFn>) -> Self {
        self.on_auth_request = Some(hook);
        self
    }

    pub fn on_auth_complete(mut self, hook: Arc<AuthCompleteFn>) -> Self {
        self.on_auth_complete = Some(hook);
        self
    }

    pub fn backend(&self) -> &'static str {
        self.client.backend()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.cfg
    }

    /// Launch the poll task. Refuses a double start.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut scheduler = self.scheduler.lock();
        if scheduler.is_some() {
            return Err(Error::AlreadyInProgress("coordinator".to_string()));
        }

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(coordinator.cfg.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = coordinator.poll_once().await {
                            tracing::debug!(error = %e, "Pane poll failed");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            tracing::debug!("Coordinator poll task stopped");
        });

        *scheduler = Some(Scheduler {
            handle,
            shutdown: shutdown_tx,
        });
        tracing::info!(
            backend = self.client.backend(),
            poll_ms = self.cfg.poll_interval.as_millis() as u64,
            "Pane coordinator started"
        );
        Ok(())
    }

    /// Stop the poll task. Idempotent.
    pub fn stop(&self) {
        if let Some(scheduler) = self.scheduler.lock().take() {
            let _ = scheduler.shutdown.send(true);
            scheduler.handle.abort();
            tracing::info!("Pane coordinator stopped");
        }
    }

    /// One full poll: prune vanished panes, then fan out per-pane handling.
    pub async fn poll_once(self: &Arc<Self>) -> Result<()> {
        let panes = self.client.list_panes().await?;
        let live: HashSet<u64> = panes.iter().map(|p| p.pane_id).collect();
        {
            let mut trackers = self.trackers.lock();
            trackers.retain(|pane_id, _| {
                let keep = live.contains(pane_id);
                if !keep {
                    tracing::debug!(pane = pane_id, "Pane vanished; tracker removed");
                }
                keep
            });
        }

        let mut handles = Vec::with_capacity(panes.len());
        for pane in panes {
            let tracker = self.tracker_for(pane.pane_id);
            let coordinator = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let start_line = -(i64::from(coordinator.cfg.output_lines));
                match coordinator.client.get_text(pane.pane_id, start_line).await {
                    Ok(raw) => coordinator.handle_pane(&tracker, &raw).await,
                    Err(e) => {
                        tracing::debug!(pane = pane.pane_id, error = %e, "get_text failed")
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    /// The local agent answered an auth request.
    pub async fn receive_auth_response(&self, response: AuthResponse) -> Result<()> {
        let tracker = self
            .find_request(&response.request_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("auth request {}", response.request_id)))?;

        let mut t = tracker.write().await;
        if let Some(agent_error) = &response.error {
            tracing::warn!(
                pane = t.pane_id,
                request = response.request_id.as_str(),
                error = agent_error.as_str(),
                "Agent reported auth failure"
            );
            self.fire_completion(&t, false);
            t.transition(PaneState::Failed);
            return Ok(());
        }
        if response.code.is_empty() {
            return Err(Error::NotFound(format!(
                "auth request {} has no code",
                response.request_id
            )));
        }

        tracing::info!(
            pane = t.pane_id,
            request = response.request_id.as_str(),
            code = redact_code(&response.code).as_str(),
            account = response.account.as_deref().unwrap_or("-"),
            "Auth code received"
        );
        t.code = Some(ReceivedCode {
            code: response.code,
            account: response.account,
        });
        Ok(())
    }

    /// Requests still waiting on the agent.
    pub async fn pending_requests(&self) -> Vec<AuthRequest> {
        let trackers = self.snapshot_trackers();
        let mut pending = Vec::new();
        for tracker in trackers {
            let t = tracker.read().await;
            if t.state == PaneState::AuthPending {
                if let Some(request) = &t.request {
                    pending.push(request.clone());
                }
            }
        }
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pending
    }

    pub async fn status(&self) -> CoordinatorStatus {
        let trackers = self.snapshot_trackers();
        let mut panes = Vec::with_capacity(trackers.len());
        for tracker in &trackers {
            let t = tracker.read().await;
            panes.push(PaneSummary {
                pane_id: t.pane_id,
                state: t.state,
                provider: t.provider,
                has_request: t.request.is_some(),
            });
        }
        panes.sort_by_key(|p| p.pane_id);
        let pending_details = self.pending_requests().await;
        CoordinatorStatus {
            running: self.scheduler.lock().is_some(),
            backend: self.client.backend(),
            pane_count: panes.len(),
            pending_auths: pending_details.len(),
            panes,
            pending_details,
        }
    }

    /// Live panes as the backend reports them.
    pub async fn list_panes(&self) -> Result<Vec<crate::pane::Pane>> {
        self.client.list_panes().await
    }

    /// Current state of one pane's tracker, mainly for tests and status.
    pub async fn pane_state(&self, pane_id: u64) -> Option<PaneState> {
        let tracker = { self.trackers.lock().get(&pane_id).cloned() }?;
        let state = tracker.read().await.state;
        Some(state)
    }

    /// Backdate a pane's state clock, driving timeout paths in tests.
    #[doc(hidden)]
    pub async fn backdate_pane_state(&self, pane_id: u64, by: Duration) {
        let tracker = { self.trackers.lock().get(&pane_id).cloned() };
        if let Some(tracker) = tracker {
            tracker.write().await.backdate_state(by);
        }
    }

    // ── Per-pane handling ───────────────────────────────────────

    async fn handle_pane(&self, tracker: &Arc<RwLock<PaneTracker>>, raw: &str) {
        let stripped = strip_ansi(raw);
        let fingerprint = fingerprint(raw);

        let mut t = tracker.write().await;
        let unchanged = t.output_unchanged(fingerprint);
        if unchanged && t.state == PaneState::Idle {
            return;
        }

        if self.timed_out(&mut t) {
            return;
        }

        match t.state {
            PaneState::Idle => self.handle_idle(&mut t, &stripped).await,
            PaneState::RateLimited => self.handle_rate_limited(&mut t, &stripped).await,
            PaneState::AwaitingMethodSelect => self.handle_awaiting_method(&mut t, raw, &stripped),
            PaneState::AwaitingUrl => self.handle_awaiting_url(&mut t, raw),
            PaneState::AuthPending => {
                if t.code.is_some() {
                    t.transition(PaneState::CodeReceived);
                }
            }
            PaneState::CodeReceived => self.handle_code_received(&mut t).await,
            PaneState::AwaitingConfirm => self.handle_awaiting_confirm(&mut t, &stripped),
            PaneState::Resuming => self.handle_resuming(&mut t).await,
            PaneState::Failed => {}
        }
    }

    /// Apply the in-band timeouts. Returns true when the poll is done with
    /// this pane.
    fn timed_out(&self, t: &mut PaneTracker) -> bool {
        match t.state {
            PaneState::Idle => false,
            PaneState::Failed => {
                if t.in_state_for() >= self.cfg.state_timeout {
                    t.reset();
                }
                true
            }
            PaneState::AuthPending => {
                if t.in_state_for() >= self.cfg.auth_timeout {
                    tracing::warn!(pane = t.pane_id, "Auth timed out waiting for code");
                    self.fire_completion(t, false);
                    t.transition(PaneState::Failed);
                    return true;
                }
                false
            }
            _ => {
                if t.in_state_for() >= self.cfg.state_timeout {
                    tracing::debug!(
                        pane = t.pane_id,
                        state = t.state.as_str(),
                        "State timed out; resetting pane"
                    );
                    t.reset();
                    return true;
                }
                false
            }
        }
    }

    async fn handle_idle(&self, t: &mut PaneTracker, stripped: &str) {
        let Some(provider) = detect_provider(stripped) else {
            return;
        };
        tracing::info!(pane = t.pane_id, provider = %provider, "Rate limit observed in pane");
        t.provider = Some(provider);
        self.inject(t, InjectionKind::Login, self.cfg.login_cooldown, "/login\n")
            .await;
        t.transition(PaneState::RateLimited);
    }

    async fn handle_rate_limited(&self, t: &mut PaneTracker, stripped: &str) {
        let Some(provider) = t.provider else {
            t.reset();
            return;
        };
        let patterns = patterns_for(provider);
        if patterns.method_select.is_match(stripped) {
            tokio::time::sleep(self.cfg.method_select_delay).await;
            self.inject(
                t,
                InjectionKind::MethodSelect,
                self.cfg.method_select_cooldown,
                "1\n",
            )
            .await;
            t.transition(PaneState::AwaitingMethodSelect);
        } else if patterns.oauth_url.is_match(stripped) {
            // Direct URL screen, no method menu.
            t.transition(PaneState::AwaitingUrl);
        }
    }

    fn handle_awaiting_method(&self, t: &mut PaneTracker, raw: &str, stripped: &str) {
        let Some(provider) = t.provider else {
            t.reset();
            return;
        };
        let patterns = patterns_for(provider);
        if patterns.oauth_url.is_match(stripped) || patterns.oauth_url.is_match(raw) {
            t.transition(PaneState::AwaitingUrl);
        }
    }

    fn handle_awaiting_url(&self, t: &mut PaneTracker, raw: &str) {
        let Some(provider) = t.provider else {
            t.reset();
            return;
        };
        let Some(url) = extract_oauth_url(provider, raw) else {
            return;
        };

        let request = AuthRequest {
            request_id: Uuid::new_v4().to_string(),
            pane_id: t.pane_id,
            provider: t.provider,
            url: url.clone(),
            created_at: chrono::Utc::now(),
        };
        tracing::info!(
            pane = t.pane_id,
            request = request.request_id.as_str(),
            url = redact_url(&url).as_str(),
            "Auth URL captured"
        );
        t.request = Some(request.clone());
        t.transition(PaneState::AuthPending);
        if let Some(hook) = &self.on_auth_request {
            hook(request);
        }
    }

    async fn handle_code_received(&self, t: &mut PaneTracker) {
        let Some(received) = t.code.take() else {
            // Nothing to inject: the state machine was driven here without a
            // code, which is an invariant violation, not a transient.
            tracing::error!(pane = t.pane_id, "CodeReceived with no stored code");
            self.fire_completion(t, false);
            t.transition(PaneState::Failed);
            return;
        };
        tracing::info!(
            pane = t.pane_id,
            code = redact_code(&received.code).as_str(),
            "Injecting auth code"
        );
        self.send(t.pane_id, &format!("{}\n", received.code)).await;
        t.transition(PaneState::AwaitingConfirm);
    }

    fn handle_awaiting_confirm(&self, t: &mut PaneTracker, stripped: &str) {
        let Some(provider) = t.provider else {
            t.reset();
            return;
        };
        let patterns = patterns_for(provider);
        if patterns.login_failure.iter().any(|p| p.is_match(stripped)) {
            tracing::warn!(pane = t.pane_id, "Login failed after code injection");
            self.fire_completion(t, false);
            t.transition(PaneState::Failed);
        } else if patterns.login_success.iter().any(|p| p.is_match(stripped)) {
            t.transition(PaneState::Resuming);
        }
    }

    async fn handle_resuming(&self, t: &mut PaneTracker) {
        tokio::time::sleep(self.cfg.resume_delay).await;
        let prompt = format!("{}\n", self.cfg.resume_prompt);
        self.inject(t, InjectionKind::Resume, self.cfg.resume_cooldown, &prompt)
            .await;
        self.fire_completion(t, true);
        tracing::info!(pane = t.pane_id, "Recovery complete; pane resumed");
        t.reset();
    }

    // ── Helpers ─────────────────────────────────────────────────

    fn tracker_for(&self, pane_id: u64) -> Arc<RwLock<PaneTracker>> {
        self.trackers
            .lock()
            .entry(pane_id)
            .or_insert_with(|| Arc::new(RwLock::new(PaneTracker::new(pane_id))))
            .clone()
    }

    fn snapshot_trackers(&self) -> Vec<Arc<RwLock<PaneTracker>>> {
        self.trackers.lock().values().cloned().collect()
    }

    async fn find_request(&self, request_id: &str) -> Option<Arc<RwLock<PaneTracker>>> {
        for tracker in self.snapshot_trackers() {
            let matches = {
                let t = tracker.read().await;
                t.state == PaneState::AuthPending
                    && t.request
                        .as_ref()
                        .is_some_and(|r| r.request_id == request_id)
            };
            if matches {
                return Some(tracker);
            }
        }
        None
    }

    /// Inject `text` under `kind`'s cooldown. A cooldown skip or a failed
    /// send is logged and swallowed; transitions never hinge on it.
    async fn inject(
        &self,
        t: &mut PaneTracker,
        kind: InjectionKind,
        cooldown: Duration,
        text: &str,
    ) {
        if !t.can_inject(kind, cooldown) {
            tracing::debug!(
                pane = t.pane_id,
                kind = kind.as_str(),
                "Injection on cooldown; skipped"
            );
            return;
        }
        if self.send(t.pane_id, text).await {
            t.note_injection(kind);
        }
    }

    async fn send(&self, pane_id: u64, text: &str) -> bool {
        match self.client.send_text(pane_id, text, true).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(pane = pane_id, error = %e, "send_text failed");
                false
            }
        }
    }

    fn fire_completion(&self, t: &PaneTracker, success: bool) {
        let Some(hook) = &self.on_auth_complete else {
            return;
        };
        hook(AuthCompletion {
            pane_id: t.pane_id,
            request_id: t
                .request
                .as_ref()
                .map(|r| r.request_id.clone())
                .unwrap_or_default(),
            provider: t.provider,
            success,
        });
    }
}

fn fingerprint(text: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}
