//! TaskForge REST client.
//!
//! One client handle corresponds to one authenticated TaskForge login. The
//! handle is created by [`TaskForgeClient::login`], shared by reference for
//! task operations, and torn down exactly once via [`TaskForgeClient::logout`]
//! when the owning cache entry is evicted.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::error::{AuthError, ClientError};
use crate::types::{NewTask, Project, Task, TaskPatch, TaskQuery};

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

/// An authenticated handle to a TaskForge instance.
#[derive(Debug)]
pub struct TaskForgeClient {
    http: reqwest::Client,
    base_url: Url,
    token: String,
}

impl TaskForgeClient {
    /// Build a handle around an already-issued API token.
    pub fn new(http: reqwest::Client, base_url: Url, token: String) -> Self {
        Self {
            http,
            base_url,
            token,
        }
    }

    /// Log in with email and password, producing an authenticated handle.
    ///
    /// 401/403 map to [`AuthError::InvalidCredentials`]; everything else that
    /// goes wrong (network, 5xx) is [`AuthError::UpstreamLogin`].
    pub async fn login(
        http: reqwest::Client,
        base_url: Url,
        email: &str,
        password: &str,
    ) -> Result<Self, AuthError> {
        let url = base_url
            .join("api/v1/login")
            .map_err(|e| AuthError::UpstreamLogin(e.to_string()))?;

        let response = http
            .post(url)
            .json(&json!({ "username": email, "password": password }))
            .send()
            .await
            .map_err(|e| AuthError::UpstreamLogin(e.to_string()))?;

        match response.status() {
            s if s.is_success() => {
                let body: LoginResponse = response
                    .json()
                    .await
                    .map_err(|e| AuthError::UpstreamLogin(e.to_string()))?;
                Ok(Self::new(http, base_url, body.token))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AuthError::InvalidCredentials),
            s => Err(AuthError::UpstreamLogin(format!("login returned {}", s))),
        }
    }

    /// Best-effort logout. Callers log and swallow the error; a misbehaving
    /// upstream must never block cache eviction.
    pub async fn logout(&self) -> Result<(), ClientError> {
        let url = self.url("api/v1/logout")?;
        let response = self.http.post(url).bearer_auth(&self.token).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(api_error(response).await)
        }
    }

    pub async fn projects(&self) -> Result<Vec<Project>, ClientError> {
        self.get_json("api/v1/projects").await
    }

    pub async fn tasks(&self, query: &TaskQuery) -> Result<Vec<Task>, ClientError> {
        let mut url = self.url("api/v1/tasks")?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(project_id) = query.project_id {
                pairs.append_pair("project_id", &project_id.to_string());
            }
            if let Some(done) = query.done {
                pairs.append_pair("done", if done { "true" } else { "false" });
            }
            if let Some(search) = &query.search {
                pairs.append_pair("s", search);
            }
        }
        let response = self.http.get(url).bearer_auth(&self.token).send().await?;
        expect_json(response).await
    }

    pub async fn task(&self, id: u64) -> Result<Task, ClientError> {
        self.get_json(&format!("api/v1/tasks/{}", id)).await
    }

    pub async fn create_task(&self, project_id: u64, task: &NewTask) -> Result<Task, ClientError> {
        let url = self.url(&format!("api/v1/projects/{}/tasks", project_id))?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(task)
            .send()
            .await?;
        expect_json(response).await
    }

    pub async fn update_task(&self, id: u64, patch: &TaskPatch) -> Result<Task, ClientError> {
        let url = self.url(&format!("api/v1/tasks/{}", id))?;
        let response = self
            .http
            .patch(url)
            .bearer_auth(&self.token)
            .json(patch)
            .send()
            .await?;
        expect_json(response).await
    }

    pub async fn delete_task(&self, id: u64) -> Result<(), ClientError> {
        let url = self.url(&format!("api/v1/tasks/{}", id))?;
        let response = self
            .http
            .delete(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(api_error(response).await)
        }
    }

    fn url(&self, path: &str) -> Result<Url, ClientError> {
        self.base_url.join(path).map_err(|e| ClientError::Api {
            status: 0,
            message: format!("invalid path {}: {}", path, e),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = self.url(path)?;
        let response = self.http.get(url).bearer_auth(&self.token).send().await?;
        expect_json(response).await
    }
}

async fn expect_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    if response.status().is_success() {
        Ok(response.json().await?)
    } else {
        Err(api_error(response).await)
    }
}

async fn api_error(response: reqwest::Response) -> ClientError {
    let status = response.status().as_u16();
    let mut message = response.text().await.unwrap_or_default();
    message.truncate(512);
    ClientError::Api { status, message }
}

/// Seam for the upstream login, so the cache and dispatcher can be exercised
/// without a TaskForge instance.
#[async_trait]
pub trait LoginService: Send + Sync {
    async fn login(&self, email: &str, password: &str) -> Result<TaskForgeClient, AuthError>;
}

/// Production login against a real TaskForge instance.
pub struct HttpLoginService {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpLoginService {
    pub fn new(base_url: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }
}

#[async_trait]
impl LoginService for HttpLoginService {
    async fn login(&self, email: &str, password: &str) -> Result<TaskForgeClient, AuthError> {
        TaskForgeClient::login(self.http.clone(), self.base_url.clone(), email, password).await
    }
}
