//! Cross-module scenario tests: single-flight behavior, dispatcher paths,
//! and the HTTP transport end to end.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::sync::Notify;
use tokio_test::assert_ok;
use tower::ServiceExt;
use url::Url;

use crate::auth::{AuthManager, Credentials};
use crate::client::{LoginService, TaskForgeClient};
use crate::config::ServerConfig;
use crate::error::AuthError;
use crate::http::{self, AppState};

/// Counting login stub. Accepts password "pw", optionally blocks on a gate
/// so tests can control when the login completes, optionally fails or
/// panics on the next call.
struct MockLogin {
    calls: AtomicUsize,
    fail: AtomicBool,
    panic_once: AtomicBool,
    gate: Option<Arc<Notify>>,
}

impl MockLogin {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            panic_once: AtomicBool::new(false),
            gate: None,
        })
    }

    fn gated(gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            panic_once: AtomicBool::new(false),
            gate: Some(gate),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LoginService for MockLogin {
    async fn login(&self, email: &str, password: &str) -> Result<TaskForgeClient, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_once.swap(false, Ordering::SeqCst) {
            panic!("login blew up");
        }
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(AuthError::UpstreamLogin("simulated outage".into()));
        }
        if password != "pw" && password != "svc-pw" {
            return Err(AuthError::InvalidCredentials);
        }
        Ok(TaskForgeClient::new(
            reqwest::Client::new(),
            Url::parse("http://127.0.0.1:9/").unwrap(),
            format!("tok-{}", email),
        ))
    }
}

fn config(shared_token: Option<&str>) -> ServerConfig {
    ServerConfig {
        shared_token: shared_token.map(str::to_string),
        service_email: Some("svc@example.com".into()),
        service_password: Some("svc-pw".into()),
        ..Default::default()
    }
}

fn manager(config: &ServerConfig, login: Arc<MockLogin>) -> Arc<AuthManager> {
    Arc::new(AuthManager::new(config, login))
}

fn basic() -> Credentials {
    Credentials::Basic {
        email: "a@example.com".into(),
        password: "pw".into(),
    }
}

async fn wait_for_calls(mock: &MockLogin, n: usize) {
    for _ in 0..200 {
        if mock.calls() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("login never reached {} calls", n);
}

// ── Single-flight ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_basic_auth_shares_one_login() {
    let gate = Arc::new(Notify::new());
    let mock = MockLogin::gated(Arc::clone(&gate));
    let mgr = manager(&config(None), Arc::clone(&mock));

    let m1 = Arc::clone(&mgr);
    let t1 = tokio::spawn(async move { m1.authenticate(basic()).await });
    wait_for_calls(&mock, 1).await;

    let m2 = Arc::clone(&mgr);
    let t2 = tokio::spawn(async move { m2.authenticate(basic()).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    gate.notify_one();
    let r1 = t1.await.unwrap().unwrap();
    let r2 = t2.await.unwrap().unwrap();

    assert_eq!(mock.calls(), 1);
    assert!(Arc::ptr_eq(&r1.client, &r2.client));
    assert_eq!(r1.email, "a@example.com");
    assert_eq!(mgr.cache().len(), 1);
}

#[tokio::test]
async fn test_failed_login_fans_out_and_is_not_cached() {
    let gate = Arc::new(Notify::new());
    let mock = MockLogin::gated(Arc::clone(&gate));
    mock.fail.store(true, Ordering::SeqCst);
    let mgr = manager(&config(None), Arc::clone(&mock));

    let m1 = Arc::clone(&mgr);
    let t1 = tokio::spawn(async move { m1.authenticate(basic()).await });
    wait_for_calls(&mock, 1).await;
    let m2 = Arc::clone(&mgr);
    let t2 = tokio::spawn(async move { m2.authenticate(basic()).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    gate.notify_one();
    let e1 = t1.await.unwrap().unwrap_err();
    let e2 = t2.await.unwrap().unwrap_err();
    assert_eq!(e1, e2);
    assert!(matches!(e1, AuthError::UpstreamLogin(_)));
    assert_eq!(mock.calls(), 1, "both waiters shared the failed attempt");
    assert_eq!(mgr.cache().len(), 0);

    // The pending slot was cleared, so a fresh request retries.
    mock.fail.store(false, Ordering::SeqCst);
    gate.notify_one();
    let retry = mgr.authenticate(basic()).await;
    assert_ok!(retry);
    assert_eq!(mock.calls(), 2);
}

#[tokio::test]
async fn test_abandoned_caller_does_not_cancel_login() {
    let gate = Arc::new(Notify::new());
    let mock = MockLogin::gated(Arc::clone(&gate));
    let mgr = manager(&config(None), Arc::clone(&mock));

    let m1 = Arc::clone(&mgr);
    let t1 = tokio::spawn(async move { m1.authenticate(basic()).await });
    wait_for_calls(&mock, 1).await;

    // The original requester goes away mid-login.
    t1.abort();
    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The login ran to completion and its result was cached.
    assert_eq!(mgr.cache().len(), 1);
    let again = mgr.authenticate(basic()).await.unwrap();
    assert_eq!(again.email, "a@example.com");
    assert_eq!(mock.calls(), 1);
}

#[tokio::test]
async fn test_panicked_login_does_not_wedge_the_key() {
    let mock = MockLogin::new();
    mock.panic_once.store(true, Ordering::SeqCst);
    let mgr = manager(&config(None), Arc::clone(&mock));

    // The login task dies mid-flight; the leader must still resolve.
    let err = tokio::time::timeout(Duration::from_secs(1), mgr.authenticate(basic()))
        .await
        .expect("leader resolved")
        .unwrap_err();
    assert!(matches!(err, AuthError::UpstreamLogin(_)));
    assert_eq!(mgr.cache().len(), 0);

    // The slot was deregistered, so a fresh attempt logs in instead of
    // waiting on the dead task.
    let again = tokio::time::timeout(Duration::from_secs(1), mgr.authenticate(basic()))
        .await
        .expect("retry resolved")
        .unwrap();
    assert_eq!(again.email, "a@example.com");
    assert_eq!(mock.calls(), 2);
}

// ── Dispatcher scenarios ─────────────────────────────────────────────────

#[tokio::test]
async fn test_two_simultaneous_token_requests_share_one_client() {
    let gate = Arc::new(Notify::new());
    let mock = MockLogin::gated(Arc::clone(&gate));
    let mgr = manager(&config(Some("T1")), Arc::clone(&mock));

    let m1 = Arc::clone(&mgr);
    let t1 = tokio::spawn(async move {
        m1.authenticate(Credentials::QueryToken("T1".into())).await
    });
    wait_for_calls(&mock, 1).await;

    // Same token via the bearer form maps to the same credential key.
    let m2 = Arc::clone(&mgr);
    let t2 = tokio::spawn(async move { m2.authenticate(Credentials::Bearer("T1".into())).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    gate.notify_one();
    let r1 = t1.await.unwrap().unwrap();
    let r2 = t2.await.unwrap().unwrap();

    assert_eq!(mock.calls(), 1, "service login invoked exactly once");
    assert!(Arc::ptr_eq(&r1.client, &r2.client));
    assert_eq!(r1.email, "svc@example.com");
}

#[tokio::test]
async fn test_idle_timeout_forces_reauthentication() {
    let mock = MockLogin::new();
    let mut cfg = config(None);
    cfg.idle_timeout = Duration::from_millis(100);
    let mgr = manager(&cfg, Arc::clone(&mock));

    mgr.authenticate(basic()).await.unwrap();
    assert_eq!(mock.calls(), 1);

    // Within the window: reuse, no login.
    mgr.authenticate(basic()).await.unwrap();
    assert_eq!(mock.calls(), 1);

    // Past the idle window with no access in between: treated as a miss.
    tokio::time::sleep(Duration::from_millis(150)).await;
    mgr.authenticate(basic()).await.unwrap();
    assert_eq!(mock.calls(), 2);
}

#[tokio::test]
async fn test_distinct_credentials_do_not_serialize() {
    let mock = MockLogin::new();
    let mgr = manager(&config(None), Arc::clone(&mock));

    let other = Credentials::Basic {
        email: "b@example.com".into(),
        password: "pw".into(),
    };
    let (r1, r2) = tokio::join!(mgr.authenticate(basic()), mgr.authenticate(other));
    let (r1, r2) = (r1.unwrap(), r2.unwrap());

    assert_eq!(mock.calls(), 2);
    assert!(!Arc::ptr_eq(&r1.client, &r2.client));
    assert_eq!(mgr.cache().len(), 2);
}

// ── HTTP transport ───────────────────────────────────────────────────────

fn basic_auth_header(email: &str, password: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{}:{}", email, password)))
}

fn initialize_body() -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": 0,
        "method": "initialize",
        "params": {
            "protocolVersion": "2025-03-26",
            "capabilities": {},
            "clientInfo": { "name": "test-client", "version": "0.0.0" }
        }
    })
    .to_string()
}

fn test_state(shared_token: Option<&str>, max_sessions: usize) -> (AppState, Arc<MockLogin>) {
    let mut cfg = config(shared_token);
    cfg.max_sessions = max_sessions;
    let mock = MockLogin::new();
    let state = AppState::with_login(&cfg, Arc::clone(&mock) as Arc<dyn LoginService>);
    (state, mock)
}

#[tokio::test]
async fn test_healthz_requires_no_credentials() {
    let (state, _) = test_state(None, 10);
    let app = http::router(state);

    let response = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_mcp_rejects_missing_credentials() {
    let (state, _) = test_state(None, 10);
    let app = http::router(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .body(Body::from(initialize_body()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_mcp_rejects_malformed_basic() {
    let (state, _) = test_state(None, 10);
    let app = http::router(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .header("authorization", "Basic %%%not-base64%%%")
                .body(Body::from(initialize_body()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_mcp_rejects_wrong_password() {
    let (state, mock) = test_state(None, 10);
    let app = http::router(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .header("authorization", basic_auth_header("a@example.com", "wrong"))
                .body(Body::from(initialize_body()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(mock.calls(), 1);
}

#[tokio::test]
async fn test_initialize_creates_session_and_delete_closes_it() {
    let (state, _) = test_state(Some("T1"), 10);
    let app = http::router(state.clone());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp?token=T1")
                .header("content-type", "application/json")
                .body(Body::from(initialize_body()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let session_id = response
        .headers()
        .get(http::SESSION_HEADER)
        .expect("session id header")
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(state.sessions.session_count(), 1);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let reply: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(reply.get("result").is_some(), "initialize result: {}", reply);

    // Complete the handshake; notifications get 202 with no body.
    let initialized =
        serde_json::json!({ "jsonrpc": "2.0", "method": "notifications/initialized" });
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp?token=T1")
                .header(http::SESSION_HEADER, &session_id)
                .body(Body::from(initialized.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    // Correlated follow-up: list tools over the session pipe.
    let list = serde_json::json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" });
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp?token=T1")
                .header(http::SESSION_HEADER, &session_id)
                .body(Body::from(list.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("create_task"), "tool listing: {}", text);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/mcp?token=T1")
                .header(http::SESSION_HEADER, &session_id)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(state.sessions.session_count(), 0);
}

#[tokio::test]
async fn test_unknown_session_id_is_not_found() {
    let (state, _) = test_state(Some("T1"), 10);
    let app = http::router(state);

    let list = serde_json::json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" });
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp?token=T1")
                .header(http::SESSION_HEADER, "no-such-session")
                .body(Body::from(list.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_session_limit_returns_unavailable() {
    let (state, _) = test_state(Some("T1"), 1);
    let app = http::router(state.clone());

    let first = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp?token=T1")
                .body(Body::from(initialize_body()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp?token=T1")
                .body(Body::from(initialize_body()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(state.sessions.session_count(), 1);
}

#[tokio::test]
async fn test_non_initialize_without_session_is_rejected() {
    let (state, _) = test_state(Some("T1"), 10);
    let app = http::router(state);

    let list = serde_json::json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" });
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp?token=T1")
                .body(Body::from(list.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
