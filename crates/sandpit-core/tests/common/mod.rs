#![allow(dead_code)]

use sandpit_core::config::ToolchainConfig;
use sandpit_core::{
    ArtifactStore, BuildConfig, BuildOrchestrator, BuildRequest, Clock, EnvironmentSpec,
    SystemClock,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A throwaway orchestrator whose toolchains are shell scripts.
///
/// Every script invocation appends a line to `count_file`, so tests can tell
/// how many compiler processes actually ran.
pub struct Harness {
    pub dir: TempDir,
    pub config: BuildConfig,
    pub orchestrator: BuildOrchestrator,
}

impl Harness {
    pub fn count_file(dir: &Path) -> PathBuf {
        dir.join("invocations")
    }

    /// `script` runs after the invocation is counted, inside the scratch
    /// directory holding `main.go`. Success means writing `main.wasm`.
    /// The count file is available to the script as `$COUNT_FILE`.
    pub fn toolchain(dir: &Path, script: &str) -> ToolchainConfig {
        let mut env = HashMap::new();
        env.insert("PATH".to_string(), "/usr/local/bin:/usr/bin:/bin".to_string());
        env.insert(
            "COUNT_FILE".to_string(),
            Self::count_file(dir).display().to_string(),
        );
        ToolchainConfig {
            program: "/bin/sh".to_string(),
            args: vec![
                "-c".to_string(),
                format!("echo run >> \"$COUNT_FILE\"; {}", script),
            ],
            env,
            source_file: "main.go".to_string(),
            artifact_file: "main.wasm".to_string(),
            allowed_flags: Vec::new(),
        }
    }

    pub fn config(dir: &Path, script: &str) -> BuildConfig {
        let mut config = BuildConfig {
            build_dir: dir.join("store"),
            work_dir: Some(dir.join("work")),
            ..Default::default()
        };
        config.toolchains.clear();
        config
            .toolchains
            .insert("stable".to_string(), Self::toolchain(dir, script));
        config
    }

    pub async fn new(script: &str) -> Self {
        Self::with_config(script, |_| {}).await
    }

    pub async fn with_config(script: &str, adjust: impl FnOnce(&mut BuildConfig)) -> Self {
        Self::with_clock(script, adjust, Arc::new(SystemClock)).await
    }

    pub async fn with_clock(
        script: &str,
        adjust: impl FnOnce(&mut BuildConfig),
        clock: Arc<dyn Clock>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Self::config(dir.path(), script);
        adjust(&mut config);
        let orchestrator = open(&config, clock).await;
        Self {
            dir,
            config,
            orchestrator,
        }
    }

    pub fn invocations(&self) -> usize {
        std::fs::read_to_string(Self::count_file(self.dir.path()))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    pub fn store(&self) -> &ArtifactStore {
        self.orchestrator.store()
    }
}

pub async fn open(config: &BuildConfig, clock: Arc<dyn Clock>) -> BuildOrchestrator {
    let store = ArtifactStore::new(&config.build_dir, clock);
    store.bootstrap().await.unwrap();
    BuildOrchestrator::new(config, store, EnvironmentSpec::default())
}

pub fn request(source: &str, timeout: Duration) -> BuildRequest {
    BuildRequest::new(source, "stable", timeout)
}

/// Compiles anything, except sources mentioning a bare ` x `, which fail the
/// way an undefined identifier would.
pub const FAKE_COMPILER: &str = "if grep -q ' x ' main.go; then \
     echo './main.go:2:15: undefined: x' >&2; exit 1; fi; \
     cp main.go main.wasm";
