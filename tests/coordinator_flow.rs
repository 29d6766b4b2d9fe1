//! Drives the pane state machine end-to-end against a scripted pane client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use caam::coordinator::{
    AuthCompletion, AuthRequest, AuthResponse, CoordinatorConfig, PaneCoordinator, PaneState,
};
use caam::error::Result;
use caam::pane::{Pane, PaneClient};

#[derive(Default)]
struct MockPaneClient {
    panes: Mutex<Vec<Pane>>,
    outputs: Mutex<HashMap<u64, String>>,
    sent: Mutex<Vec<(u64, String)>>,
}

impl MockPaneClient {
    fn with_pane(pane_id: u64) -> Arc<Self> {
        let client = Self::default();
        client.panes.lock().unwrap().push(Pane {
            pane_id,
            title: "agent".to_string(),
        });
        Arc::new(client)
    }

    fn set_output(&self, pane_id: u64, text: &str) {
        self.outputs.lock().unwrap().insert(pane_id, text.to_string());
    }

    fn remove_pane(&self, pane_id: u64) {
        self.panes.lock().unwrap().retain(|p| p.pane_id != pane_id);
    }

    fn sent_texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }
}

#[async_trait]
impl PaneClient for MockPaneClient {
    async fn list_panes(&self) -> Result<Vec<Pane>> {
        Ok(self.panes.lock().unwrap().clone())
    }

    async fn get_text(&self, pane_id: u64, _start_line: i64) -> Result<String> {
        Ok(self
            .outputs
            .lock()
            .unwrap()
            .get(&pane_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_text(&self, pane_id: u64, text: &str, _no_paste: bool) -> Result<()> {
        self.sent.lock().unwrap().push((pane_id, text.to_string()));
        Ok(())
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn backend(&self) -> &'static str {
        "mock"
    }
}

fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        poll_interval: Duration::from_millis(10),
        method_select_delay: Duration::ZERO,
        resume_delay: Duration::ZERO,
        ..CoordinatorConfig::default()
    }
}

struct Harness {
    client: Arc<MockPaneClient>,
    coordinator: Arc<PaneCoordinator>,
    requests: Arc<Mutex<Vec<AuthRequest>>>,
    completions: Arc<Mutex<Vec<AuthCompletion>>>,
}

fn harness() -> Harness {
    let client = MockPaneClient::with_pane(1);
    let requests = Arc::new(Mutex::new(Vec::new()));
    let completions = Arc::new(Mutex::new(Vec::new()));

    let on_request = {
        let requests = Arc::clone(&requests);
        Arc::new(move |request: AuthRequest| {
            requests.lock().unwrap().push(request);
        }) as Arc<dyn Fn(AuthRequest) + Send + Sync>
    };
    let on_complete = {
        let completions = Arc::clone(&completions);
        Arc::new(move |completion: AuthCompletion| {
            completions.lock().unwrap().push(completion);
        }) as Arc<dyn Fn(AuthCompletion) + Send + Sync>
    };

    let coordinator = Arc::new(
        PaneCoordinator::new(Arc::clone(&client) as Arc<dyn PaneClient>, fast_config())
            .on_auth_request(on_request)
            .on_auth_complete(on_complete),
    );
    Harness {
        client,
        coordinator,
        requests,
        completions,
    }
}

const CLAUDE_URL_SCREEN: &str = "Browser didn't open? Use the url below to sign in\n\n\
    https://claude.ai/oauth/authorize?code=true&client_id=abc&scope=user%3Ainference\n\n\
    Paste code here if prompted >\n";

#[tokio::test]
async fn full_recovery_flow_emits_one_request_and_one_completion() {
    let h = harness();

    // Rate limit appears: /login goes in, tracker arms.
    h.client.set_output(1, "Error: rate limit exceeded");
    h.coordinator.poll_once().await.unwrap();
    assert_eq!(
        h.coordinator.pane_state(1).await,
        Some(PaneState::RateLimited)
    );
    assert!(h.client.sent_texts().contains(&"/login\n".to_string()));

    // Login method menu: option 1 selected.
    h.client.set_output(1, "Select login method:\n 1. OAuth\n 2. API key\n");
    h.coordinator.poll_once().await.unwrap();
    assert_eq!(
        h.coordinator.pane_state(1).await,
        Some(PaneState::AwaitingMethodSelect)
    );
    assert!(h.client.sent_texts().contains(&"1\n".to_string()));

    // URL shows up, gets extracted, request goes out.
    h.client.set_output(1, CLAUDE_URL_SCREEN);
    h.coordinator.poll_once().await.unwrap();
    assert_eq!(
        h.coordinator.pane_state(1).await,
        Some(PaneState::AwaitingUrl)
    );
    h.coordinator.poll_once().await.unwrap();
    assert_eq!(
        h.coordinator.pane_state(1).await,
        Some(PaneState::AuthPending)
    );

    let captured = h.requests.lock().unwrap().clone();
    assert_eq!(captured.len(), 1);
    assert!(captured[0].url.starts_with("https://claude.ai/oauth/authorize?"));
    assert!(captured[0].url.contains("client_id=abc"));

    // Agent answers with the code.
    let pending = h.coordinator.pending_requests().await;
    assert_eq!(pending.len(), 1);
    h.coordinator
        .receive_auth_response(AuthResponse {
            request_id: pending[0].request_id.clone(),
            code: "CODE123".to_string(),
            account: Some("u@x".to_string()),
            error: None,
        })
        .await
        .unwrap();

    // One poll stages the code, the next injects it.
    h.coordinator.poll_once().await.unwrap();
    assert_eq!(
        h.coordinator.pane_state(1).await,
        Some(PaneState::CodeReceived)
    );
    h.coordinator.poll_once().await.unwrap();
    assert_eq!(
        h.coordinator.pane_state(1).await,
        Some(PaneState::AwaitingConfirm)
    );
    assert!(h.client.sent_texts().contains(&"CODE123\n".to_string()));

    // Login confirmed, session resumes, tracker returns to idle.
    h.client.set_output(1, "Login successful. Welcome back!");
    h.coordinator.poll_once().await.unwrap();
    assert_eq!(h.coordinator.pane_state(1).await, Some(PaneState::Resuming));
    h.coordinator.poll_once().await.unwrap();
    assert_eq!(h.coordinator.pane_state(1).await, Some(PaneState::Idle));

    let completions = h.completions.lock().unwrap().clone();
    assert_eq!(completions.len(), 1);
    assert!(completions[0].success);
    assert_eq!(h.requests.lock().unwrap().len(), 1);

    // The resume prompt was typed into the pane.
    let sent = h.client.sent_texts();
    assert!(sent.iter().any(|t| t.contains("continue")), "{sent:?}");
}

#[tokio::test]
async fn unknown_request_id_is_rejected() {
    let h = harness();
    let err = h
        .coordinator
        .receive_auth_response(AuthResponse {
            request_id: "req-unknown".to_string(),
            code: "X".repeat(8),
            account: None,
            error: None,
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"), "{err}");
}

#[tokio::test]
async fn agent_reported_error_fails_the_pane() {
    let h = harness();
    h.client.set_output(1, "Error: usage limit reached");
    h.coordinator.poll_once().await.unwrap();
    h.client.set_output(1, CLAUDE_URL_SCREEN);
    h.coordinator.poll_once().await.unwrap(); // RateLimited -> AwaitingUrl (direct URL screen)
    h.coordinator.poll_once().await.unwrap(); // AwaitingUrl -> AuthPending

    let pending = h.coordinator.pending_requests().await;
    assert_eq!(pending.len(), 1);
    h.coordinator
        .receive_auth_response(AuthResponse {
            request_id: pending[0].request_id.clone(),
            code: String::new(),
            account: None,
            error: Some("user cancelled".to_string()),
        })
        .await
        .unwrap();

    assert_eq!(h.coordinator.pane_state(1).await, Some(PaneState::Failed));
    let completions = h.completions.lock().unwrap().clone();
    assert_eq!(completions.len(), 1);
    assert!(!completions[0].success);
}

#[tokio::test]
async fn state_timeout_resets_to_idle() {
    let h = harness();
    h.client.set_output(1, "rate limit hit");
    h.coordinator.poll_once().await.unwrap();
    assert_eq!(
        h.coordinator.pane_state(1).await,
        Some(PaneState::RateLimited)
    );

    h.coordinator
        .backdate_pane_state(1, Duration::from_secs(31))
        .await;
    h.coordinator.poll_once().await.unwrap();
    assert_eq!(h.coordinator.pane_state(1).await, Some(PaneState::Idle));
    assert!(h.coordinator.pending_requests().await.is_empty());
}

#[tokio::test]
async fn auth_timeout_fails_then_self_resets() {
    let h = harness();
    h.client.set_output(1, "rate limit hit");
    h.coordinator.poll_once().await.unwrap();
    h.client.set_output(1, CLAUDE_URL_SCREEN);
    h.coordinator.poll_once().await.unwrap();
    h.coordinator.poll_once().await.unwrap();
    assert_eq!(
        h.coordinator.pane_state(1).await,
        Some(PaneState::AuthPending)
    );

    // Agent never answers.
    h.coordinator
        .backdate_pane_state(1, Duration::from_secs(61))
        .await;
    h.coordinator.poll_once().await.unwrap();
    assert_eq!(h.coordinator.pane_state(1).await, Some(PaneState::Failed));
    assert!(!h.completions.lock().unwrap()[0].success);

    // Failed wears off after the state timeout.
    h.coordinator
        .backdate_pane_state(1, Duration::from_secs(31))
        .await;
    h.coordinator.poll_once().await.unwrap();
    assert_eq!(h.coordinator.pane_state(1).await, Some(PaneState::Idle));
}

#[tokio::test]
async fn vanished_panes_lose_their_trackers() {
    let h = harness();
    h.client.set_output(1, "rate limit hit");
    h.coordinator.poll_once().await.unwrap();
    assert!(h.coordinator.pane_state(1).await.is_some());

    h.client.remove_pane(1);
    h.coordinator.poll_once().await.unwrap();
    assert!(h.coordinator.pane_state(1).await.is_none());
}

#[tokio::test]
async fn status_reports_panes_and_pending() {
    let h = harness();
    h.client.set_output(1, "rate limit hit");
    h.coordinator.poll_once().await.unwrap();

    let status = h.coordinator.status().await;
    assert_eq!(status.backend, "mock");
    assert_eq!(status.pane_count, 1);
    assert_eq!(status.pending_auths, 0);
    assert!(!status.running);
    assert_eq!(status.panes[0].state, PaneState::RateLimited);
}
