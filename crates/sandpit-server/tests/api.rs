#![cfg(unix)]

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use sandpit_core::config::ToolchainConfig;
use sandpit_core::{
    ArtifactStore, BuildConfig, BuildOrchestrator, EnvironmentSpec, Fingerprint, SystemClock,
};
use sandpit_server::{CompileResponse, SandpitServer, ServerConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt; // for `oneshot`

const COMPILER: &str = "if grep -q ' x ' main.go; then \
     echo './main.go:2:15: undefined: x' >&2; exit 1; fi; \
     if grep -q 'slow' main.go; then sleep 5; fi; \
     cp main.go main.wasm";

async fn router() -> (TempDir, Router) {
    let (dir, _, router) = router_with_orchestrator().await;
    (dir, router)
}

async fn router_with_orchestrator() -> (TempDir, BuildOrchestrator, Router) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = BuildConfig {
        build_dir: dir.path().join("store"),
        work_dir: Some(dir.path().join("work")),
        ..Default::default()
    };
    config.toolchains.clear();
    config.toolchains.insert(
        "stable".to_string(),
        ToolchainConfig {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), COMPILER.to_string()],
            env: [("PATH".to_string(), "/usr/bin:/bin".to_string())]
                .into_iter()
                .collect(),
            source_file: "main.go".to_string(),
            artifact_file: "main.wasm".to_string(),
            allowed_flags: Vec::new(),
        },
    );

    let store = ArtifactStore::new(&config.build_dir, Arc::new(SystemClock));
    store.bootstrap().await.unwrap();
    let orchestrator = BuildOrchestrator::new(&config, store, EnvironmentSpec::default());
    let server_config = ServerConfig::default().with_logging(false);
    let router = SandpitServer::new(orchestrator.clone(), server_config).build_router();
    (dir, orchestrator, router)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_endpoint_reports_healthy() {
    let (_dir, router) = router().await;
    let response = router.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "healthy");
}

#[tokio::test]
async fn version_lists_toolchains() {
    let (_dir, router) = router().await;
    let response = router.oneshot(get("/api/version")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["toolchains"], json!(["stable"]));
    assert_eq!(body["default_toolchain"], "stable");
}

#[tokio::test]
async fn compile_then_download_artifact() {
    let (_dir, router) = router().await;
    let source = "package main\nfunc main(){}";

    let response = router
        .clone()
        .oneshot(post_json("/api/compile", json!({ "source": source })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let first: CompileResponse = serde_json::from_value(body_json(response).await).unwrap();
    assert_eq!(first.exit_status, 0);
    assert!(!first.from_cache);
    let url = first.artifact_url.clone().unwrap();

    let response = router
        .clone()
        .oneshot(post_json("/api/compile", json!({ "source": source })))
        .await
        .unwrap();
    let second: CompileResponse = serde_json::from_value(body_json(response).await).unwrap();
    assert!(second.from_cache);
    assert_eq!(second.fingerprint, first.fingerprint);

    let response = router.oneshot(get(&url)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/wasm"
    );
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], source.as_bytes());
}

#[tokio::test]
async fn artifact_download_holds_reader_until_body_is_consumed() {
    let (_dir, orchestrator, router) = router_with_orchestrator().await;
    let response = router
        .clone()
        .oneshot(post_json("/api/compile", json!({ "source": "package main" })))
        .await
        .unwrap();
    let compiled: CompileResponse = serde_json::from_value(body_json(response).await).unwrap();
    let fingerprint = Fingerprint::parse(&compiled.fingerprint).unwrap();
    let readers = |snapshot: Vec<sandpit_core::store::EntrySnapshot>| {
        snapshot
            .into_iter()
            .find(|e| e.fingerprint == fingerprint)
            .map(|e| e.readers)
            .unwrap()
    };

    // The build task lets go of its own leases just after publishing.
    for _ in 0..100 {
        if readers(orchestrator.store().snapshot().await) == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let response = router
        .oneshot(get(&compiled.artifact_url.unwrap()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "12");
    assert_eq!(readers(orchestrator.store().snapshot().await), 1);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"package main");
    assert_eq!(readers(orchestrator.store().snapshot().await), 0);
}

#[tokio::test]
async fn compile_failure_is_a_normal_response() {
    let (_dir, router) = router().await;
    let response = router
        .oneshot(post_json(
            "/api/compile",
            json!({ "source": "package main\nfunc main(){ x }" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: CompileResponse = serde_json::from_value(body_json(response).await).unwrap();
    assert_ne!(body.exit_status, 0);
    assert!(body.stderr.contains("undefined: x"));
    assert!(body.artifact_url.is_none());
}

#[tokio::test]
async fn unknown_toolchain_is_bad_request() {
    let (_dir, router) = router().await;
    let response = router
        .oneshot(post_json(
            "/api/compile",
            json!({ "source": "package main", "toolchain": "nightly" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_request");
}

#[tokio::test]
async fn slow_build_is_gateway_timeout() {
    let (_dir, router) = router().await;
    let started = std::time::Instant::now();
    let response = router
        .oneshot(post_json(
            "/api/compile",
            json!({ "source": "package main // slow", "timeout_ms": 300 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn unknown_artifact_is_not_found() {
    let (_dir, router) = router().await;
    let missing = format!("/api/artifacts/{}", "0".repeat(64));
    let response = router.clone().oneshot(get(&missing)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = router.oneshot(get("/api/artifacts/not-hex")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn run_without_remote_backend_is_bad_request() {
    let (_dir, router) = router().await;
    let response = router
        .oneshot(post_json(
            "/api/run",
            json!({ "source": "package main", "backend": "tip" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn stats_count_builds() {
    let (_dir, router) = router().await;
    router
        .clone()
        .oneshot(post_json("/api/compile", json!({ "source": "package main" })))
        .await
        .unwrap();
    let response = router.oneshot(get("/api/stats")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["builds_spawned"], 1);
    assert_eq!(body["entries"], 1);
}
