use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use concord_daemon::api::{create_router, AppState};
use concord_daemon::config::ServerConfig;
use concord_engine::{Engine, EngineConfig};
use concord_storage::InMemoryConcordStore;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn app() -> (Arc<InMemoryConcordStore>, Router) {
    let store = Arc::new(InMemoryConcordStore::new());
    let engine = Arc::new(Engine::new(store.clone(), EngineConfig::default()));
    let router = create_router(AppState::new(engine), &ServerConfig::default());
    (store, router)
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        })
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn health_reports_store_state() {
    let (store, app) = app();
    let (status, body) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database_connected"], true);

    store.set_offline(true);
    let (status, body) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn message_round_trip() {
    let (_store, app) = app();
    for (id, caps) in [("a", json!([])), ("b", json!(["search"]))] {
        let (status, body) = call(
            &app,
            "POST",
            "/v1/agents",
            Some(json!({ "agent_id": id, "name": id, "capabilities": caps })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(body["identity_proof"].as_str().unwrap().starts_with("0x"));
    }

    let (status, body) = call(
        &app,
        "POST",
        "/v1/messages",
        Some(json!({
            "message_id": "m-1",
            "sender_id": "a",
            "message_type": "request",
            "content": { "required_capabilities": ["search"] }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["message_id"], "m-1");

    let (status, body) = call(&app, "POST", "/v1/messages/m-1/process", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "PROCESSED");
    assert_eq!(body["target_agents"], json!(["b"]));
    assert_eq!(body["replayed"], false);

    let (_, body) = call(&app, "POST", "/v1/messages/m-1/process", None).await;
    assert_eq!(body["replayed"], true);

    let (status, body) = call(&app, "POST", "/v1/messages/missing/process", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn proposal_vote_flow() {
    let (_store, app) = app();
    for id in ["p", "v"] {
        call(
            &app,
            "POST",
            "/v1/agents",
            Some(json!({ "agent_id": id, "name": id })),
        )
        .await;
    }
    call(
        &app,
        "POST",
        "/v1/proposals",
        Some(json!({ "proposal_id": "prop-1", "proposer_id": "p", "title": "Ship it" })),
    )
    .await;

    let (status, body) = call(&app, "POST", "/v1/proposals/prop-1/process", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["disposition"], "VOTING_STARTED");
    assert_eq!(body["proposal_status"], "voting");

    let (status, body) = call(
        &app,
        "POST",
        "/v1/proposals/prop-1/votes",
        Some(json!({ "agent_id": "outsider", "choice": "approve" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], false);

    let (_, body) = call(
        &app,
        "POST",
        "/v1/proposals/prop-1/votes",
        Some(json!({ "agent_id": "v", "choice": "approve", "reasoning": "good" })),
    )
    .await;
    assert_eq!(body["accepted"], true);
    assert_eq!(body["proposal_status"], "accepted");
}

#[tokio::test]
async fn proactive_pass_returns_a_report() {
    let (_store, app) = app();
    let (status, body) = call(&app, "POST", "/v1/proactive", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["actions_performed"], 0);
}

#[tokio::test]
async fn invalid_submissions_are_rejected() {
    let (_store, app) = app();
    let (status, _) = call(
        &app,
        "POST",
        "/v1/proposals",
        Some(json!({ "proposer_id": "p", "title": "  " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    call(
        &app,
        "POST",
        "/v1/messages",
        Some(json!({ "message_id": "dup", "sender_id": "a", "message_type": "note" })),
    )
    .await;
    let (status, body) = call(
        &app,
        "POST",
        "/v1/messages",
        Some(json!({ "message_id": "dup", "sender_id": "a", "message_type": "note" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICT");
}
