//! Client for remote reference-execution playgrounds.
//!
//! These backends compile and run a program on a hosted service. Their
//! failures are reported as [`RemoteError`] and never mixed with local build
//! results.

use crate::config::PlaygroundConfig;
use crate::errors::RemoteError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const USER_AGENT: &str = concat!("sandpit/", env!("CARGO_PKG_VERSION"));
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRunRequest {
    pub source: String,
    pub vet: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RemoteEvent {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub kind: String,
    /// Nanoseconds to wait before showing this event.
    #[serde(default)]
    pub delay: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RemoteRunResponse {
    #[serde(default)]
    pub errors: String,
    #[serde(default)]
    pub events: Option<Vec<RemoteEvent>>,
    #[serde(default)]
    pub status: i32,
    #[serde(default)]
    pub is_test: bool,
    #[serde(default)]
    pub tests_failed: i32,
    #[serde(default)]
    pub vet_errors: String,
}

#[async_trait]
pub trait PlaygroundClient: Send + Sync + std::fmt::Debug {
    async fn compile(&self, request: &RemoteRunRequest) -> Result<RemoteRunResponse, RemoteError>;
}

/// reqwest-backed [`PlaygroundClient`].
#[derive(Debug, Clone)]
pub struct HttpPlaygroundClient {
    base_url: String,
    client: reqwest::Client,
    retries: u32,
}

impl HttpPlaygroundClient {
    pub fn new(
        base_url: impl Into<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
        retries: u32,
    ) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            retries,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_once(&self, request: &RemoteRunRequest) -> Result<RemoteRunResponse, reqwest::Error> {
        let url = format!("{}/compile", self.base_url);
        let with_vet = if request.vet { "true" } else { "false" };
        let form = [
            ("version", "2"),
            ("body", request.source.as_str()),
            ("withVet", with_vet),
        ];
        let response = self.client.post(&url).form(&form).send().await?;
        let response = response.error_for_status()?;
        response.json::<RemoteRunResponse>().await
    }
}

#[async_trait]
impl PlaygroundClient for HttpPlaygroundClient {
    async fn compile(&self, request: &RemoteRunRequest) -> Result<RemoteRunResponse, RemoteError> {
        let mut attempt = 0;
        loop {
            match self.post_once(request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_connect() && attempt < self.retries => {
                    attempt += 1;
                    log::warn!(
                        "Connection to {} failed (attempt {}): {}",
                        self.base_url,
                        attempt,
                        e
                    );
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(e) => {
                    if let Some(status) = e.status() {
                        return Err(RemoteError::Status {
                            status: status.as_u16(),
                            body: e.to_string(),
                        });
                    }
                    return Err(RemoteError::from(e));
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteBackend {
    #[default]
    Default,
    Tip,
}

impl std::fmt::Display for RemoteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteBackend::Default => write!(f, "default"),
            RemoteBackend::Tip => write!(f, "tip"),
        }
    }
}

/// The configured remote backends.
#[derive(Debug, Clone, Default)]
pub struct PlaygroundServices {
    pub default: Option<Arc<dyn PlaygroundClient>>,
    pub tip: Option<Arc<dyn PlaygroundClient>>,
}

impl PlaygroundServices {
    /// Builds HTTP clients for every non-empty URL in `config`.
    pub fn from_config(config: &PlaygroundConfig) -> Result<Self, RemoteError> {
        let client = |url: &str| -> Result<Option<Arc<dyn PlaygroundClient>>, RemoteError> {
            if url.is_empty() {
                return Ok(None);
            }
            let client = HttpPlaygroundClient::new(
                url,
                config.connect_timeout(),
                config.request_timeout(),
                config.connect_retries,
            )?;
            let client: Arc<dyn PlaygroundClient> = Arc::new(client);
            Ok(Some(client))
        };
        Ok(Self {
            default: client(&config.url)?,
            tip: client(&config.tip_url)?,
        })
    }

    pub fn get(&self, backend: RemoteBackend) -> Result<&Arc<dyn PlaygroundClient>, RemoteError> {
        let client = match backend {
            RemoteBackend::Default => self.default.as_ref(),
            RemoteBackend::Tip => self.tip.as_ref(),
        };
        client.ok_or_else(|| RemoteError::NotConfigured(backend.to_string()))
    }
}
