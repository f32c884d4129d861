//! Remote ephemeral-sandbox service backend (JSON over HTTP).
//!
//! Endpoints, relative to `base_url`:
//! - `POST   /sandboxes`             create, returns `{"id": "..."}`
//! - `POST   /sandboxes/{id}/start`  start
//! - `POST   /sandboxes/{id}/stop`   stop
//! - `DELETE /sandboxes/{id}`        remove (404 counts as removed)
//! - `GET    /sandboxes/{id}`        status
//! - `POST   /sandboxes/{id}/exec`   run a command
//! - `POST   /sandboxes/{id}/files`  write files
//! - `GET    /health`                liveness

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::SandboxBackend;
use crate::environment::{
    EnvironmentId, EnvironmentSpec, EnvironmentStatus, ExecOutput, ExecRequest, FileWrite,
};
use crate::error::{Result, SandboxError};

/// Remote sandbox service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Service base URL
    pub base_url: String,
    /// Bearer token (optional for local services)
    pub api_key: Option<String>,
    /// Per-request timeout, excluding exec which uses the request's own budget
    pub request_timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            base_url: std::env::var("AUTOCODER_SANDBOX_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8790".to_string()),
            api_key: std::env::var("AUTOCODER_SANDBOX_API_KEY").ok(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RemoteConfig {
    /// Create a new config from environment variables
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Create config for a specific service URL
    pub fn new(base_url: &str) -> Self {
        RemoteConfig {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Set authentication token
    pub fn with_api_key(mut self, key: &str) -> Self {
        self.api_key = Some(key.to_string());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct FilesBody<'a> {
    files: &'a [FileWrite],
}

/// Client for a remote sandbox service
pub struct RemoteSandboxBackend {
    config: RemoteConfig,
    http_client: reqwest::Client,
}

impl RemoteSandboxBackend {
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("autocoder-sandbox-manager/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(RemoteSandboxBackend {
            config,
            http_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .http_client
            .request(method, self.url(path))
            .timeout(self.config.request_timeout);
        match &self.config.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn check(operation: &str, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            return Err(SandboxError::NotFound(body));
        }
        if status == StatusCode::SERVICE_UNAVAILABLE || status == StatusCode::BAD_GATEWAY {
            return Err(SandboxError::Unavailable(format!("{}: {}", status, body)));
        }
        Err(SandboxError::backend(operation, format!("{}: {}", status, body)))
    }
}

#[async_trait]
impl SandboxBackend for RemoteSandboxBackend {
    fn name(&self) -> &str {
        "remote"
    }

    async fn create(&self, spec: &EnvironmentSpec) -> Result<EnvironmentId> {
        let response = self
            .request(reqwest::Method::POST, "/sandboxes")
            .json(spec)
            .send()
            .await?;
        let created: CreateResponse = Self::check("create", response).await?.json().await?;
        debug!(sandbox_id = %created.id, "remote sandbox created");
        Ok(EnvironmentId::new(created.id))
    }

    async fn start(&self, id: &EnvironmentId) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, &format!("/sandboxes/{}/start", id))
            .send()
            .await?;
        Self::check("start", response).await.map(|_| ())
    }

    async fn stop(&self, id: &EnvironmentId) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, &format!("/sandboxes/{}/stop", id))
            .send()
            .await?;
        match Self::check("stop", response).await {
            Ok(_) | Err(SandboxError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove(&self, id: &EnvironmentId) -> Result<()> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/sandboxes/{}", id))
            .send()
            .await?;
        match Self::check("remove", response).await {
            Ok(_) | Err(SandboxError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn inspect(&self, id: &EnvironmentId) -> Result<EnvironmentStatus> {
        let response = self
            .request(reqwest::Method::GET, &format!("/sandboxes/{}", id))
            .send()
            .await?;
        let status: EnvironmentStatus = Self::check("inspect", response).await?.json().await?;
        Ok(status)
    }

    async fn exec(&self, id: &EnvironmentId, request: &ExecRequest) -> Result<ExecOutput> {
        // Let the service enforce the command budget; allow slack for transport.
        let budget = request.timeout() + Duration::from_secs(10);
        let response = self
            .request(reqwest::Method::POST, &format!("/sandboxes/{}/exec", id))
            .timeout(budget)
            .json(request)
            .send()
            .await;
        let response = match response {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Ok(ExecOutput::timed_out(
                    budget.as_millis() as u64,
                    String::new(),
                    format!("command timed out after {}ms", request.timeout_ms),
                ))
            }
            Err(e) => return Err(e.into()),
        };
        let output: ExecOutput = Self::check("exec", response).await?.json().await?;
        Ok(output)
    }

    async fn write_files(&self, id: &EnvironmentId, files: &[FileWrite]) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, &format!("/sandboxes/{}/files", id))
            .json(&FilesBody { files })
            .send()
            .await?;
        Self::check("write_files", response).await.map(|_| ())
    }

    async fn ping(&self) -> Result<()> {
        let response = self.request(reqwest::Method::GET, "/health").send().await?;
        Self::check("ping", response).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_trims_trailing_slash() {
        let config = RemoteConfig::new("http://sandbox.local:8790/").with_api_key("secret");
        assert_eq!(config.base_url, "http://sandbox.local:8790");
        assert_eq!(config.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn test_url_join() {
        let backend = RemoteSandboxBackend::new(RemoteConfig::new("http://h:1")).unwrap();
        assert_eq!(backend.url("/sandboxes/abc"), "http://h:1/sandboxes/abc");
    }

    #[tokio::test]
    async fn test_unreachable_service_ping_fails() {
        // Port 9 (discard) is closed on loopback in test environments.
        let config =
            RemoteConfig::new("http://127.0.0.1:9").with_request_timeout(Duration::from_secs(2));
        let backend = RemoteSandboxBackend::new(config).unwrap();
        assert!(backend.ping().await.is_err());
    }
}
