//! Server configuration from environment variables.
//!
//! All duration knobs are supplied in milliseconds and are mutually
//! independent. The client cache and the session map have separate timeouts
//! and separate sweep intervals.

use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("TASKFORGE_URL is not a valid URL: {0}")]
    InvalidUrl(String),

    #[error("{0} is not a valid integer")]
    InvalidNumber(&'static str),

    #[error("TASKFORGE_TOKEN requires TASKFORGE_EMAIL and TASKFORGE_PASSWORD for the upstream login")]
    TokenWithoutServiceCredentials,

    #[error("TASKFORGE_EMAIL and TASKFORGE_PASSWORD are required")]
    MissingServiceCredentials,

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

/// Configuration for the TaskForge MCP server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Base URL of the TaskForge instance.
    pub base_url: Url,
    /// Service-account email, used for stdio mode and for shared-token logins.
    pub service_email: Option<String>,
    /// Service-account password.
    pub service_password: Option<String>,
    /// Shared-secret token. When set, HTTP clients may authenticate with
    /// `?token=` or a bearer header instead of Basic credentials.
    pub shared_token: Option<String>,
    /// Sliding idle window for cached clients.
    pub idle_timeout: Duration,
    /// Absolute lifetime cap for cached clients, independent of idle.
    pub max_lifetime: Duration,
    /// Interval between eager client-cache sweeps.
    pub cleanup_interval: Duration,
    /// Sliding idle window for protocol sessions.
    pub session_timeout: Duration,
    /// Interval between session sweeps.
    pub session_cleanup_interval: Duration,
    /// Hard cap on live sessions; creation beyond it is rejected.
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse("http://localhost:3456/").expect("static url"),
            service_email: None,
            service_password: None,
            shared_token: None,
            idle_timeout: Duration::from_secs(30 * 60),
            max_lifetime: Duration::from_secs(8 * 60 * 60),
            cleanup_interval: Duration::from_secs(60),
            session_timeout: Duration::from_secs(2 * 60 * 60),
            session_cleanup_interval: Duration::from_secs(60),
            max_sessions: 100,
        }
    }
}

impl ServerConfig {
    /// Build configuration from `TASKFORGE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("TASKFORGE_URL") {
            config.base_url = Url::parse(&raw).map_err(|_| ConfigError::InvalidUrl(raw))?;
        }
        if let Ok(email) = std::env::var("TASKFORGE_EMAIL") {
            config.service_email = Some(email);
        }
        if let Ok(password) = std::env::var("TASKFORGE_PASSWORD") {
            config.service_password = Some(password);
        }
        if let Ok(token) = std::env::var("TASKFORGE_TOKEN") {
            if !token.is_empty() {
                config.shared_token = Some(token);
            }
        }

        config.idle_timeout =
            env_duration_ms("TASKFORGE_CLIENT_IDLE_TIMEOUT_MS", config.idle_timeout)?;
        config.max_lifetime =
            env_duration_ms("TASKFORGE_CLIENT_MAX_LIFETIME_MS", config.max_lifetime)?;
        config.cleanup_interval =
            env_duration_ms("TASKFORGE_CLIENT_CLEANUP_INTERVAL_MS", config.cleanup_interval)?;
        config.session_timeout =
            env_duration_ms("TASKFORGE_SESSION_TIMEOUT_MS", config.session_timeout)?;
        config.session_cleanup_interval = env_duration_ms(
            "TASKFORGE_SESSION_CLEANUP_INTERVAL_MS",
            config.session_cleanup_interval,
        )?;
        if let Ok(raw) = std::env::var("TASKFORGE_MAX_SESSIONS") {
            config.max_sessions = raw
                .parse()
                .map_err(|_| ConfigError::InvalidNumber("TASKFORGE_MAX_SESSIONS"))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Shared-token mode performs the upstream login with the service
    /// account, so the token is unusable without those credentials. Sweep
    /// intervals must be non-zero; the sweeper's timers cannot run on a
    /// zero period.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shared_token.is_some()
            && (self.service_email.is_none() || self.service_password.is_none())
        {
            return Err(ConfigError::TokenWithoutServiceCredentials);
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::ZeroInterval(
                "TASKFORGE_CLIENT_CLEANUP_INTERVAL_MS",
            ));
        }
        if self.session_cleanup_interval.is_zero() {
            return Err(ConfigError::ZeroInterval(
                "TASKFORGE_SESSION_CLEANUP_INTERVAL_MS",
            ));
        }
        Ok(())
    }

    /// Service credentials, required for stdio mode.
    pub fn require_service_credentials(&self) -> Result<(&str, &str), ConfigError> {
        match (&self.service_email, &self.service_password) {
            (Some(e), Some(p)) => Ok((e, p)),
            _ => Err(ConfigError::MissingServiceCredentials),
        }
    }
}

fn env_duration_ms(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => {
            let ms: u64 = raw.parse().map_err(|_| ConfigError::InvalidNumber(name))?;
            Ok(Duration::from_millis(ms))
        }
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.idle_timeout, Duration::from_secs(1800));
        assert_eq!(config.max_sessions, 100);
        assert!(config.shared_token.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_token_requires_service_credentials() {
        let config = ServerConfig {
            shared_token: Some("secret".into()),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TokenWithoutServiceCredentials)
        ));

        let config = ServerConfig {
            shared_token: Some("secret".into()),
            service_email: Some("svc@example.com".into()),
            service_password: Some("hunter2".into()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_sweep_intervals_rejected() {
        let config = ServerConfig {
            cleanup_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroInterval("TASKFORGE_CLIENT_CLEANUP_INTERVAL_MS"))
        ));

        let config = ServerConfig {
            session_cleanup_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroInterval(
                "TASKFORGE_SESSION_CLEANUP_INTERVAL_MS"
            ))
        ));
    }

    #[test]
    fn test_require_service_credentials() {
        let config = ServerConfig::default();
        assert!(config.require_service_credentials().is_err());
    }
}
