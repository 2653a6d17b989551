//! HTTP front end for the Sandpit build server
//!
//! Translates JSON requests into [`BuildOrchestrator`] calls and maps build
//! errors onto status codes. A compile failure is a normal `200` response
//! carrying a non-zero `exit_status`; only timeouts, rejected requests and
//! internal faults become HTTP errors.

pub mod error;

pub use error::{ApiError, Result, ServerError};

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::{middleware, Router};
use sandpit_core::config::HttpConfig;
use sandpit_core::{
    BuildOrchestrator, BuildRequest, BuildResult, Fingerprint, RemoteBackend, RemoteRunRequest,
    RemoteRunResponse, StatsSnapshot,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompileRequest {
    pub source: String,
    #[serde(default)]
    pub toolchain: String,
    #[serde(default)]
    pub flags: Vec<String>,
    /// Capped at the server's build timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompileResponse {
    pub fingerprint: String,
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    pub from_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_url: Option<String>,
}

impl From<BuildResult> for CompileResponse {
    fn from(result: BuildResult) -> Self {
        let artifact_url = result
            .artifact
            .as_ref()
            .map(|_| format!("/api/artifacts/{}", result.fingerprint));
        Self {
            fingerprint: result.fingerprint.to_string(),
            exit_status: result.exit_status,
            stdout: result.stdout,
            stderr: result.stderr,
            truncated: result.truncated,
            from_cache: result.from_cache,
            artifact_url,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunRequest {
    pub source: String,
    #[serde(default)]
    pub backend: RemoteBackend,
    #[serde(default)]
    pub vet: bool,
}

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub enable_cors: bool,
    pub max_body_size: usize,
    pub enable_logging: bool,
    /// Deadline for compile requests that do not ask for less.
    pub build_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_http_config(&HttpConfig::default(), Duration::from_secs(30))
    }
}

impl ServerConfig {
    pub fn from_http_config(http: &HttpConfig, build_timeout: Duration) -> Self {
        Self {
            bind_addr: http.bind_addr,
            enable_cors: true,
            max_body_size: http.max_body_bytes,
            enable_logging: true,
            build_timeout,
        }
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_logging(mut self, enable: bool) -> Self {
        self.enable_logging = enable;
        self
    }

    fn request_timeout(&self, requested_ms: Option<u64>) -> Duration {
        requested_ms
            .map(Duration::from_millis)
            .map_or(self.build_timeout, |t| t.min(self.build_timeout))
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: BuildOrchestrator,
    pub config: ServerConfig,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn version_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let registry = state.orchestrator.registry();
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "toolchains": registry.names(),
        "default_toolchain": registry.default_name(),
    }))
}

async fn stats_handler(State(state): State<AppState>) -> Json<StatsSnapshot> {
    Json(state.orchestrator.stats().await)
}

/// Handler for the /api/compile POST endpoint.
async fn compile_handler(
    State(state): State<AppState>,
    Json(request): Json<CompileRequest>,
) -> std::result::Result<Json<CompileResponse>, ApiError> {
    let timeout = state.config.request_timeout(request.timeout_ms);
    let build = BuildRequest::new(request.source, request.toolchain, timeout)
        .with_flags(request.flags);

    let result = state.orchestrator.execute(build).await?;
    log::debug!(
        "Build {} finished with status {} (cached: {})",
        result.fingerprint.short(),
        result.exit_status,
        result.from_cache
    );
    Ok(Json(CompileResponse::from(result)))
}

/// Handler for the /api/artifacts/{fingerprint} GET endpoint.
///
/// The reader lease travels with the body stream, so the janitor cannot evict
/// the entry until the download finishes or the client goes away.
async fn artifact_handler(
    State(state): State<AppState>,
    Path(fingerprint): Path<String>,
) -> std::result::Result<Response, ApiError> {
    let fingerprint = Fingerprint::parse(&fingerprint)
        .ok_or_else(|| ApiError::not_found(format!("no artifact {}", fingerprint)))?;
    let (lease, path) = state
        .orchestrator
        .open_artifact(&fingerprint)
        .await
        .ok_or_else(|| ApiError::not_found(format!("no artifact {}", fingerprint)))?;

    let file = tokio::fs::File::open(&path).await.map_err(|e| {
        log::error!("Failed to open artifact {}: {}", path.display(), e);
        ApiError::Internal
    })?;
    let len = file.metadata().await.map(|m| m.len()).map_err(|e| {
        log::error!("Failed to stat artifact {}: {}", path.display(), e);
        ApiError::Internal
    })?;

    let stream = ReaderStream::new(file).map(move |chunk| {
        let _held = &lease;
        chunk
    });

    let content_type = match path.extension().and_then(|e| e.to_str()) {
        Some("wasm") => "application/wasm",
        _ => "application/octet-stream",
    };
    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_LENGTH, len.to_string()),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

/// Handler for the /api/run POST endpoint.
async fn run_handler(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> std::result::Result<Json<RemoteRunResponse>, ApiError> {
    let response = state
        .orchestrator
        .run_remote(
            request.backend,
            RemoteRunRequest {
                source: request.source,
                vet: request.vet,
            },
        )
        .await?;
    Ok(Json(response))
}

/// The Sandpit HTTP server.
pub struct SandpitServer {
    orchestrator: BuildOrchestrator,
    config: ServerConfig,
}

impl SandpitServer {
    pub fn new(orchestrator: BuildOrchestrator, config: ServerConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Build the Axum router with all routes and middleware.
    pub fn build_router(&self) -> Router {
        let state = AppState {
            orchestrator: self.orchestrator.clone(),
            config: self.config.clone(),
        };

        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/api/version", get(version_handler))
            .route("/api/stats", get(stats_handler))
            .route("/api/compile", post(compile_handler))
            .route("/api/artifacts/{fingerprint}", get(artifact_handler))
            .route("/api/run", post(run_handler))
            .with_state(state)
            .layer(DefaultBodyLimit::disable())
            .layer(RequestBodyLimitLayer::new(self.config.max_body_size));

        if self.config.enable_logging {
            router = router.layer(middleware::from_fn(
                |request: axum::http::Request<axum::body::Body>,
                 next: axum::middleware::Next| async {
                    let request_id = uuid::Uuid::new_v4().to_string();
                    let method = request.method().clone();
                    let uri = request.uri().clone();

                    // Health probes are frequent, keep them out of the info log
                    if uri.path() == "/health" {
                        log::debug!("Request {} {} {}", request_id, method, uri);
                    } else {
                        log::info!("Request {} {} {}", request_id, method, uri);
                    }

                    let start = std::time::Instant::now();
                    let response = next.run(request).await;
                    log::debug!(
                        "Response {} {} in {:?}",
                        request_id,
                        response.status(),
                        start.elapsed()
                    );
                    response
                },
            ));
        }

        router = router.layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            router = router.layer(CorsLayer::permissive());
        }

        router
    }

    /// Start the server with graceful shutdown support.
    ///
    /// Returns once `shutdown_signal` resolves and open connections drain.
    pub async fn serve_with_shutdown<F>(self, shutdown_signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.bind_addr,
                source,
            })?;

        log::info!("Sandpit server listening on {}", self.config.bind_addr);
        log::info!("Health check: http://{}/health", self.config.bind_addr);
        log::info!("Compile endpoint: http://{}/api/compile", self.config.bind_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await?;

        log::info!("Sandpit server stopped accepting connections");
        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}
