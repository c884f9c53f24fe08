//! Error taxonomy for the authentication, session, and client layers.
//!
//! Every externally visible failure is distinguishable so a caller can decide
//! whether to retry with the same credentials, obtain new credentials, or
//! re-establish a session. Teardown (logout) failures are deliberately absent
//! here: they are logged and swallowed at the point of eviction.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rmcp::ErrorData as McpError;
use thiserror::Error;

/// Authentication failures.
///
/// `Clone` matters: a single-flight login failure fans out to every
/// concurrent waiter as the same value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No usable credential was supplied. Names the accepted forms so the
    /// client knows what to send.
    #[error("missing credentials; accepted: {accepted}")]
    MissingCredentials { accepted: &'static str },

    /// A credential header was present but could not be parsed.
    #[error("malformed {scheme} credentials")]
    MalformedCredentials { scheme: &'static str },

    /// Wrong password or wrong token. Not retried, never cached.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The TaskForge login endpoint was unreachable or failed for
    /// infrastructure reasons. A later independent request may retry.
    #[error("upstream login failed: {0}")]
    UpstreamLogin(String),
}

/// Session lookup failures, distinct from credential failures: the caller
/// must re-initialize a session rather than re-authenticate.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session expired: {0}")]
    Expired(String),

    #[error("session limit reached ({0})")]
    LimitReached(usize),
}

/// TaskForge API call failures (post-authentication).
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("taskforge api error ({status}): {message}")]
    Api { status: u16, message: String },
}

impl From<ClientError> for McpError {
    fn from(e: ClientError) -> Self {
        internal_error(e.to_string())
    }
}

/// Create an internal MCP error with a message.
pub fn internal_error(message: impl Into<String>) -> McpError {
    McpError::internal_error(message.into(), None)
}

/// Create an invalid-params MCP error with a message.
pub fn invalid_params(message: impl Into<String>) -> McpError {
    McpError::invalid_params(message.into(), None)
}

fn json_error(status: StatusCode, message: String) -> Response {
    let body = serde_json::json!({
        "error": message,
        "code": status.as_u16(),
    });
    (status, Json(body)).into_response()
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self {
            AuthError::MissingCredentials { .. } => StatusCode::UNAUTHORIZED,
            AuthError::MalformedCredentials { .. } => StatusCode::BAD_REQUEST,
            AuthError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            AuthError::UpstreamLogin(_) => StatusCode::BAD_GATEWAY,
        };
        json_error(status, self.to_string())
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = match self {
            SessionError::NotFound(_) | SessionError::Expired(_) => StatusCode::NOT_FOUND,
            SessionError::LimitReached(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        json_error(status, self.to_string())
    }
}
