//! Exercises the history client against a mock persistence service.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};

use banter_history::{HistoryClient, HistoryError};
use banter_types::api::SaveMessageRequest;

type Saved = Arc<Mutex<Vec<Value>>>;

async fn start_mock(saved: Saved) -> String {
    let app = Router::new()
        .route("/api/messages/save", post(save))
        .route("/api/messages/history", get(history))
        .route("/api/chats/list", get(chats))
        .with_state(saved);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/api")
}

async fn save(State(saved): State<Saved>, Json(body): Json<Value>) -> StatusCode {
    saved.lock().unwrap().push(body);
    StatusCode::CREATED
}

async fn history(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    Json(json!({
        "messages": [
            {"from": params["chat_with"], "to": params["username"], "message": "hi", "type": "dm"}
        ]
    }))
}

async fn chats(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    Json(json!({"chats": [{"username": params["username"], "chat_with": "bob"}]}))
}

#[tokio::test]
async fn save_posts_canonical_body() {
    let saved: Saved = Arc::default();
    let base = start_mock(saved.clone()).await;
    let client = HistoryClient::new(base, Duration::from_secs(2)).unwrap();

    let body = SaveMessageRequest::new("alice", "bob", "hi", "dm", None);
    client.save_message(&body).await.unwrap();

    let recorded = saved.lock().unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0]["sender"], "alice");
    assert_eq!(recorded[0]["recipient"], "bob");
    assert_eq!(recorded[0]["message"], "hi");
    assert_eq!(recorded[0]["type"], "dm");
    assert!(recorded[0]["timestamp"].is_string());
    assert!(recorded[0].get("ciphertext").is_none());
}

#[tokio::test]
async fn fetches_message_history() {
    let base = start_mock(Arc::default()).await;
    let client = HistoryClient::new(base, Duration::from_secs(2)).unwrap();

    let messages = client.message_history("alice", "bob", 100).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["from"], "bob");
    assert_eq!(messages[0]["to"], "alice");
}

#[tokio::test]
async fn fetches_chat_list() {
    let base = start_mock(Arc::default()).await;
    let client = HistoryClient::new(base, Duration::from_secs(2)).unwrap();

    let chats = client.chat_list("alice").await.unwrap();
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0]["username"], "alice");
}

#[tokio::test]
async fn non_success_status_is_an_error() {
    let base = start_mock(Arc::default()).await;
    // Point under an unrouted prefix so every call 404s.
    let client = HistoryClient::new(format!("{base}/missing"), Duration::from_secs(2)).unwrap();

    match client.message_history("alice", "bob", 100).await {
        Err(HistoryError::Status(status)) => assert_eq!(status, StatusCode::NOT_FOUND),
        other => panic!("expected status error, got {other:?}"),
    }
    assert!(client.chat_list("alice").await.is_err());
    let body = SaveMessageRequest::new("alice", "bob", "hi", "dm", None);
    assert!(client.save_message(&body).await.is_err());
}

#[tokio::test]
async fn unreachable_service_is_a_transport_error() {
    // Nothing listens on this port.
    let client = HistoryClient::new("http://127.0.0.1:9/api", Duration::from_millis(300)).unwrap();
    match client.message_history("alice", "bob", 10).await {
        Err(HistoryError::Transport(_)) => {}
        other => panic!("expected transport error, got {other:?}"),
    }
}
