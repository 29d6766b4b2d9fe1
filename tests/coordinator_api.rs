//! The coordinator's local HTTP surface, exercised through the router.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use caam::coordinator::{server, CoordinatorConfig, PaneCoordinator};
use caam::error::Result;
use caam::pane::{Pane, PaneClient};

#[derive(Default)]
struct ScriptedClient {
    outputs: Mutex<HashMap<u64, String>>,
}

#[async_trait]
impl PaneClient for ScriptedClient {
    async fn list_panes(&self) -> Result<Vec<Pane>> {
        Ok(vec![Pane {
            pane_id: 9,
            title: "claude".to_string(),
        }])
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

    async fn send_text(&self, _pane_id: u64, _text: &str, _no_paste: bool) -> Result<()> {
        Ok(())
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn backend(&self) -> &'static str {
        "scripted"
    }
}

fn coordinator() -> (Arc<ScriptedClient>, Arc<PaneCoordinator>) {
    let client = Arc::new(ScriptedClient::default());
    let coordinator = Arc::new(PaneCoordinator::new(
        Arc::clone(&client) as Arc<dyn PaneClient>,
        CoordinatorConfig {
            method_select_delay: std::time::Duration::ZERO,
            resume_delay: std::time::Duration::ZERO,
            ..CoordinatorConfig::default()
        },
    ));
    (client, coordinator)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_backend_and_timestamp() {
    let (_client, coordinator) = coordinator();
    let app = server::router(coordinator);

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["backend"], "scripted");
    assert!(json["timestamp"].as_str().unwrap().contains('T'));
}

#[tokio::test]
async fn status_and_panes_round_trip() {
    let (_client, coordinator) = coordinator();
    let app = server::router(Arc::clone(&coordinator));

    let response = app
        .clone()
        .oneshot(Request::get("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["backend"], "scripted");
    assert_eq!(json["pending_auths"], 0);

    let response = app
        .oneshot(Request::get("/panes").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json[0]["pane_id"], 9);
}

#[tokio::test]
async fn auth_complete_flow_through_the_api() {
    let (client, coordinator) = coordinator();
    let app = server::router(Arc::clone(&coordinator));

    // March the pane to AuthPending.
    client.outputs.lock().unwrap().insert(
        9,
        "Error: rate limit exceeded".to_string(),
    );
    coordinator.poll_once().await.unwrap();
    client.outputs.lock().unwrap().insert(
        9,
        "https://claude.ai/oauth/authorize?client_id=abc\n\nPaste code here >\n".to_string(),
    );
    coordinator.poll_once().await.unwrap();
    coordinator.poll_once().await.unwrap();

    let response = app
        .clone()
        .oneshot(Request::get("/auth/pending").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let pending = body_json(response).await;
    let request_id = pending[0]["request_id"].as_str().unwrap().to_string();
    assert!(pending[0]["url"]
        .as_str()
        .unwrap()
        .starts_with("https://claude.ai/oauth/authorize?"));

    // Wrong id: 404.
    let response = app
        .clone()
        .oneshot(
            Request::post("/auth/complete")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"request_id": "req-nope", "code": "ABCDEFGH"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Missing code: 400.
    let response = app
        .clone()
        .oneshot(
            Request::post("/auth/complete")
                .header("content-type", "application/json")
                .body(Body::from(format!(
                    r#"{{"request_id": "{request_id}", "code": ""}}"#
                )))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // The real thing, via the /auth/submit alias.
    let response = app
        .oneshot(
            Request::post("/auth/submit")
                .header("content-type", "application/json")
                .body(Body::from(format!(
                    r#"{{"request_id": "{request_id}", "code": "CODE123", "account": "u@x"}}"#
                )))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    coordinator.poll_once().await.unwrap();
    assert_eq!(
        coordinator.pane_state(9).await,
        Some(caam::coordinator::PaneState::CodeReceived)
    );
}
