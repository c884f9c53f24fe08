//! Request authentication.
//!
//! The dispatcher turns an inbound request's credentials into an
//! authenticated TaskForge client, funneling every path through the
//! single-flight authenticator so concurrent requests for the same identity
//! share one upstream login.
//!
//! Credential priority when a shared-secret token is configured:
//! `?token=` query parameter, then `Bearer` header, then `Basic` header.
//! Without a shared secret only Basic is accepted. The dispatcher itself
//! holds no cache state.

pub mod cache;
pub mod key;
pub mod single_flight;
pub mod token;

use axum::http::{header::AUTHORIZATION, HeaderMap};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::sync::Arc;
use tracing::debug;

use crate::client::LoginService;
use crate::config::ServerConfig;
use crate::error::AuthError;

pub use cache::{AuthMethod, AuthenticatedClient, ClientCache};
pub use key::{basic_key, token_key, CredentialKey};
pub use single_flight::SingleFlight;

const ACCEPTED_WITH_TOKEN: &str =
    "?token= query parameter, Bearer token, or Basic authentication";
const ACCEPTED_BASIC_ONLY: &str = "Basic authentication";

/// Credentials extracted from one inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    QueryToken(String),
    Bearer(String),
    Basic { email: String, password: String },
}

pub struct AuthManager {
    flight: SingleFlight,
    login: Arc<dyn LoginService>,
    shared_token: Option<String>,
    service_email: Option<String>,
    service_password: Option<String>,
}

impl AuthManager {
    pub fn new(config: &ServerConfig, login: Arc<dyn LoginService>) -> Self {
        let cache = Arc::new(ClientCache::new(config.idle_timeout, config.max_lifetime));
        Self {
            flight: SingleFlight::new(cache),
            login,
            shared_token: config.shared_token.clone(),
            service_email: config.service_email.clone(),
            service_password: config.service_password.clone(),
        }
    }

    pub fn cache(&self) -> &Arc<ClientCache> {
        self.flight.cache()
    }

    /// Pull credentials out of the request, enforcing the fixed priority
    /// order. `query_token` is the already-extracted `token` query value.
    pub fn extract(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<Credentials, AuthError> {
        let shared_mode = self.shared_token.is_some();

        if shared_mode {
            if let Some(token) = query_token {
                if !token.is_empty() {
                    return Ok(Credentials::QueryToken(token.to_string()));
                }
            }
        }

        let auth_header = match headers.get(AUTHORIZATION) {
            Some(value) => Some(value.to_str().map_err(|_| AuthError::MalformedCredentials {
                scheme: "Authorization",
            })?),
            None => None,
        };

        if shared_mode {
            if let Some(raw) = auth_header {
                if let Some(token) = raw.strip_prefix("Bearer ") {
                    return Ok(Credentials::Bearer(token.trim().to_string()));
                }
                if let Some(encoded) = raw.strip_prefix("Basic ") {
                    return parse_basic(encoded);
                }
                return Err(AuthError::MalformedCredentials {
                    scheme: "Authorization",
                });
            }
            return Err(AuthError::MissingCredentials {
                accepted: ACCEPTED_WITH_TOKEN,
            });
        }

        // Basic-only mode: anything else is treated as absent, and the error
        // names Basic so the client knows bearer tokens are not accepted.
        match auth_header {
            Some(raw) => match raw.strip_prefix("Basic ") {
                Some(encoded) => parse_basic(encoded),
                None => Err(AuthError::MissingCredentials {
                    accepted: ACCEPTED_BASIC_ONLY,
                }),
            },
            None => Err(AuthError::MissingCredentials {
                accepted: ACCEPTED_BASIC_ONLY,
            }),
        }
    }

    /// Resolve credentials to an authenticated client, hitting the cache and
    /// single-flight layers. Token paths validate the shared secret in
    /// constant time before anything else; the upstream login for a token is
    /// performed with the server-side service account, first use only.
    pub async fn authenticate(&self, creds: Credentials) -> Result<AuthenticatedClient, AuthError> {
        match creds {
            Credentials::QueryToken(t) | Credentials::Bearer(t) => {
                let expected = self.shared_token.as_deref().ok_or(
                    AuthError::MissingCredentials {
                        accepted: ACCEPTED_BASIC_ONLY,
                    },
                )?;
                if !token::timing_safe_eq(&t, expected) {
                    debug!("shared-token mismatch");
                    return Err(AuthError::InvalidCredentials);
                }

                let (email, password) = match (&self.service_email, &self.service_password) {
                    (Some(e), Some(p)) => (e.clone(), p.clone()),
                    _ => {
                        return Err(AuthError::UpstreamLogin(
                            "service credentials not configured".to_string(),
                        ))
                    }
                };

                let login = Arc::clone(&self.login);
                let subject = email.clone();
                self.flight
                    .authenticate(token_key(&t), &subject, AuthMethod::Token, async move {
                        login.login(&email, &password).await
                    })
                    .await
            }
            Credentials::Basic { email, password } => {
                let key = basic_key(&email, &password);
                let login = Arc::clone(&self.login);
                let (e, p) = (email.clone(), password);
                self.flight
                    .authenticate(key, &email, AuthMethod::Basic, async move {
                        login.login(&e, &p).await
                    })
                    .await
            }
        }
    }
}

fn parse_basic(encoded: &str) -> Result<Credentials, AuthError> {
    let malformed = AuthError::MalformedCredentials { scheme: "Basic" };
    let decoded = BASE64.decode(encoded.trim()).map_err(|_| malformed.clone())?;
    let decoded = String::from_utf8(decoded).map_err(|_| malformed.clone())?;
    let (email, password) = decoded.split_once(':').ok_or(malformed)?;
    Ok(Credentials::Basic {
        email: email.to_string(),
        password: password.to_string(),
    })
}
