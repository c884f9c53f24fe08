//! Streamable HTTP transport.
//!
//! `POST /mcp` carries JSON-RPC messages. The first request of a
//! conversation is `initialize`: it is authenticated, a per-session MCP
//! service is spawned over an in-process duplex pipe, and the generated
//! session identifier is returned in the `Mcp-Session-Id` response header.
//! Subsequent posts present that header and are forwarded over the session's
//! pipe; `DELETE /mcp` closes the session. Every request re-authenticates
//! through the dispatcher — the session id correlates, it never
//! authenticates.

use axum::{
    extract::{Request, State},
    http::{header::CONTENT_TYPE, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use rmcp::ServiceExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::auth::{AuthManager, AuthenticatedClient};
use crate::client::{HttpLoginService, LoginService};
use crate::config::{ConfigError, ServerConfig};
use crate::error::{AuthError, SessionError};
use crate::server::TaskForgeMcpServer;
use crate::session::{SessionManager, SessionTransport};
use crate::sweeper::Sweeper;

pub const SESSION_HEADER: &str = "mcp-session-id";

#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthManager>,
    pub sessions: Arc<SessionManager>,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let login = Arc::new(HttpLoginService::new(config.base_url.clone()));
        Ok(Self::with_login(config, login))
    }

    /// Build state with a custom login service. Tests use this to count and
    /// fail upstream logins.
    pub fn with_login(config: &ServerConfig, login: Arc<dyn LoginService>) -> Self {
        Self {
            auth: Arc::new(AuthManager::new(config, login)),
            sessions: Arc::new(SessionManager::new(
                config.session_timeout,
                config.max_sessions,
            )),
        }
    }
}

enum McpHttpError {
    Session(SessionError),
    Transport(std::io::Error),
    BadRequest(&'static str),
}

impl IntoResponse for McpHttpError {
    fn into_response(self) -> Response {
        match self {
            McpHttpError::Session(e) => e.into_response(),
            McpHttpError::Transport(e) => {
                let body = serde_json::json!({
                    "error": format!("session transport failed: {}", e),
                    "code": 502,
                });
                (StatusCode::BAD_GATEWAY, Json(body)).into_response()
            }
            McpHttpError::BadRequest(message) => {
                let body = serde_json::json!({ "error": message, "code": 400 });
                (StatusCode::BAD_REQUEST, Json(body)).into_response()
            }
        }
    }
}

/// Authenticate every request to `/mcp` and inject the resolved client into
/// request extensions.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let query_token = request.uri().query().and_then(query_token);
    let creds = state.auth.extract(request.headers(), query_token.as_deref())?;
    let authed = state.auth.authenticate(creds).await?;
    request.extensions_mut().insert(authed);
    Ok(next.run(request).await)
}

fn query_token(query: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "token")
        .map(|(_, v)| v.into_owned())
}

async fn handle_post(
    State(state): State<AppState>,
    Extension(authed): Extension<AuthenticatedClient>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, McpHttpError> {
    let message: serde_json::Value =
        serde_json::from_str(&body).map_err(|_| McpHttpError::BadRequest("invalid JSON-RPC body"))?;
    let expects_response = message.get("id").is_some();

    if let Some(id) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        let transport = state
            .sessions
            .checkout(id, Instant::now())
            .map_err(McpHttpError::Session)?;
        let reply = transport
            .request(&body, expects_response)
            .await
            .map_err(McpHttpError::Transport)?;
        return Ok(match reply {
            Some(reply) => json_response(reply, id),
            None => StatusCode::ACCEPTED.into_response(),
        });
    }

    // No session header: this must be the start of a new conversation.
    if message.get("method").and_then(|m| m.as_str()) != Some("initialize") {
        return Err(McpHttpError::BadRequest(
            "missing Mcp-Session-Id header; only initialize may open a session",
        ));
    }

    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let (their_read, their_write) = tokio::io::split(theirs);
    let (our_read, our_write) = tokio::io::split(ours);

    let server = TaskForgeMcpServer::new(authed.clone());
    let (id_tx, id_rx) = oneshot::channel::<String>();
    let sessions = Arc::clone(&state.sessions);
    let service = tokio::spawn(async move {
        match server.serve((their_read, their_write)).await {
            Ok(running) => {
                let _ = running.waiting().await;
            }
            Err(e) => debug!(error = %e, "session service ended during handshake"),
        }
        // Transport closed from the service side: deregister the session.
        if let Ok(id) = id_rx.await {
            sessions.remove_session(&id);
        }
    });

    let transport = Arc::new(SessionTransport::new(our_write, our_read, service));
    let id = match state
        .sessions
        .create_session(Some(authed), Arc::clone(&transport))
    {
        Ok(id) => id,
        Err(e) => {
            transport.close();
            return Err(McpHttpError::Session(e));
        }
    };
    let _ = id_tx.send(id.clone());

    let reply = transport
        .request(&body, true)
        .await
        .map_err(McpHttpError::Transport)?;
    info!(session_id = %id, email = %state.sessions.get(&id).and_then(|s| s.email).unwrap_or_default(), "session initialized");
    Ok(json_response(reply.unwrap_or_default(), &id))
}

async fn handle_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, McpHttpError> {
    let id = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(McpHttpError::BadRequest("missing Mcp-Session-Id header"))?;

    if state.sessions.remove_session(id) {
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Err(McpHttpError::Session(SessionError::NotFound(id.to_string())))
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

fn json_response(body: String, session_id: &str) -> Response {
    let mut response = (StatusCode::OK, body).into_response();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

pub fn router(state: AppState) -> Router {
    let mcp = Router::new()
        .route("/mcp", post(handle_post).delete(handle_delete))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/healthz", get(health))
        .merge(mcp)
        .with_state(state)
}

/// Run the streamable HTTP server until ctrl-c, then drain sessions and the
/// client cache.
pub async fn serve(config: ServerConfig, bind: SocketAddr) -> anyhow::Result<()> {
    let state = AppState::new(&config)?;
    let sweeper = Sweeper::start(
        Arc::clone(state.auth.cache()),
        Arc::clone(&state.sessions),
        config.cleanup_interval,
        config.session_cleanup_interval,
    );

    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, "TaskForge MCP server listening (streamable HTTP)");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down: draining sessions and client cache");
    sweeper.stop().await;
    let closed = state.sessions.cleanup_all();
    let evicted = state.auth.cache().clear().await;
    info!(closed, evicted, "shutdown drain complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
