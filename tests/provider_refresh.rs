//! The HTTP provider client against a mock provider: a stale access token is
//! refreshed transparently and the new pair is persisted.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::{
    Form, Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tokio::net::TcpListener;

use autopilot::config::ProviderConfig;
use autopilot::provider::{HttpProviderClient, MessageType, ProviderClient, with_auto_refresh};
use autopilot::store::{Database, LibSqlBackend};

#[derive(Clone, Default)]
struct Mock {
    refreshes: Arc<AtomicU32>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "Bearer fresh-access")
}

async fn messages(headers: HeaderMap, Path(id): Path<String>) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({
        "messages": {
            "lastMessageId": "m1",
            "nextPage": false,
            "messages": [
                {"id": "m2", "conversationId": id, "direction": "inbound", "body": "still there?",
                 "messageType": "TYPE_SMS", "dateAdded": "2026-03-10T10:05:00.000Z"},
                {"id": "m1", "conversationId": id, "direction": "outbound", "body": "hello",
                 "messageType": "TYPE_SMS", "dateAdded": "2026-03-10T10:00:00.000Z"}
            ]
        }
    }))
    .into_response()
}

async fn send(headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({"conversationId": "c1", "messageId": "out-1"})).into_response()
}

async fn token(State(mock): State<Mock>, Form(form): Form<HashMap<String, String>>) -> Response {
    mock.refreshes.fetch_add(1, Ordering::SeqCst);
    if form.get("grant_type").map(String::as_str) != Some("refresh_token")
        || form.get("refresh_token").map(String::as_str) != Some("refresh-1")
    {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid_grant"}))).into_response();
    }
    Json(json!({
        "access_token": "fresh-access",
        "refresh_token": "refresh-2",
        "expires_in": 86400
    }))
    .into_response()
}

async fn start_mock() -> (String, Mock) {
    let mock = Mock::default();
    let app = Router::new()
        .route("/conversations/{id}/messages", get(messages))
        .route("/conversations/messages", post(send))
        .route("/oauth/token", post(token))
        .with_state(mock.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    (format!("http://127.0.0.1:{port}"), mock)
}

fn provider_config(base: &str, refresh_token: &str) -> ProviderConfig {
    ProviderConfig {
        base_url: base.to_string(),
        token_url: format!("{base}/oauth/token"),
        client_id: "client".into(),
        client_secret: SecretString::from("secret"),
        location_id: "loc-1".into(),
        access_token: Some(SecretString::from("stale-access")),
        refresh_token: Some(SecretString::from(refresh_token)),
    }
}

#[tokio::test]
async fn stale_token_is_refreshed_and_persisted() {
    let (base, mock) = start_mock().await;
    let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());

    let http = HttpProviderClient::from_store(provider_config(&base, "refresh-1"), store.clone())
        .await
        .unwrap();
    let client = with_auto_refresh(http);

    let fresh = client.fetch_new_messages("c1", Some("m1")).await.unwrap();
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh[0].id, "m2");
    assert!(fresh[0].is_inbound());
    assert_eq!(mock.refreshes.load(Ordering::SeqCst), 1);

    let saved = store.get_credentials("loc-1").await.unwrap().unwrap();
    assert_eq!(saved.access_token.expose_secret(), "fresh-access");
    assert_eq!(saved.refresh_token.expose_secret(), "refresh-2");
    assert!(saved.expires_at.is_some());

    // Later calls reuse the refreshed token.
    let id = client
        .send_message("c1", "Yes, see you at 3!", &MessageType::Sms)
        .await
        .unwrap();
    assert_eq!(id, "out-1");
    assert_eq!(mock.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rejected_refresh_surfaces_as_error() {
    let (base, _mock) = start_mock().await;
    let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());

    let http = HttpProviderClient::from_store(provider_config(&base, "revoked"), store)
        .await
        .unwrap();
    let client = with_auto_refresh(http);

    let err = client.fetch_new_messages("c1", None).await.unwrap_err();
    assert!(matches!(
        err,
        autopilot::error::ProviderError::RefreshFailed(_)
    ));
}
