//! Configuration type definitions
//!
//! Every section has defaults, so an empty YAML document yields a runnable
//! server. Durations are stored as plain integers and exposed through
//! `Duration` accessors.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SandpitConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub janitor: JanitorConfig,
    #[serde(default)]
    pub playground: PlaygroundConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl HttpConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Root of the artifact store.
    #[serde(default = "default_build_dir")]
    pub build_dir: PathBuf,
    /// Parent for per-build scratch directories; system temp dir when unset.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default = "default_build_timeout_secs")]
    pub build_timeout_secs: u64,
    /// Per stream.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_max_artifact_bytes")]
    pub max_artifact_bytes: u64,
    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: usize,
    /// Global ceiling on concurrently running compiler processes.
    #[serde(default = "default_max_concurrent_builds")]
    pub max_concurrent_builds: usize,
    #[serde(default = "default_env_allow_list")]
    pub env_allow_list: Vec<String>,
    #[serde(default = "default_toolchain_name")]
    pub default_toolchain: String,
    #[serde(default = "default_toolchains")]
    pub toolchains: BTreeMap<String, ToolchainConfig>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            build_dir: default_build_dir(),
            work_dir: None,
            build_timeout_secs: default_build_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            max_artifact_bytes: default_max_artifact_bytes(),
            max_source_bytes: default_max_source_bytes(),
            max_concurrent_builds: default_max_concurrent_builds(),
            env_allow_list: default_env_allow_list(),
            default_toolchain: default_toolchain_name(),
            toolchains: default_toolchains(),
        }
    }
}

impl BuildConfig {
    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }
}

/// How to invoke one compiler toolchain.
///
/// `args` may contain `{source}`, `{output}` and `{workdir}` anywhere inside an
/// argument; an argument that is exactly `{flags}` expands to the request flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolchainConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_source_file")]
    pub source_file: String,
    #[serde(default = "default_artifact_file")]
    pub artifact_file: String,
    #[serde(default)]
    pub allowed_flags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JanitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
    /// Idle time after the last access before an entry expires.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_store_bytes")]
    pub max_store_bytes: u64,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_sweep_interval_secs(),
            ttl_secs: default_ttl_secs(),
            max_store_bytes: default_max_store_bytes(),
        }
    }
}

impl JanitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaygroundConfig {
    #[serde(default = "default_playground_url")]
    pub url: String,
    #[serde(default = "default_tip_playground_url")]
    pub tip_url: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Extra attempts after a connection-level failure.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
}

impl Default for PlaygroundConfig {
    fn default() -> Self {
        Self {
            url: default_playground_url(),
            tip_url: default_tip_playground_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_retries: default_connect_retries(),
        }
    }
}

impl PlaygroundConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8000))
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_build_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("sandpit")
        .join("builds")
}

fn default_build_timeout_secs() -> u64 {
    30
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_max_artifact_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_max_source_bytes() -> usize {
    256 * 1024
}

fn default_max_concurrent_builds() -> usize {
    4
}

fn default_env_allow_list() -> Vec<String> {
    ["PATH", "HOME", "GOROOT", "GOPATH", "GOCACHE", "GOPROXY", "GOFLAGS"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_toolchain_name() -> String {
    "stable".to_string()
}

fn default_toolchains() -> BTreeMap<String, ToolchainConfig> {
    let mut env = HashMap::new();
    env.insert("GOOS".to_string(), "js".to_string());
    env.insert("GOARCH".to_string(), "wasm".to_string());

    let stable = ToolchainConfig {
        program: "go".to_string(),
        args: vec![
            "build".to_string(),
            "-o".to_string(),
            "{output}".to_string(),
            "{flags}".to_string(),
            "{source}".to_string(),
        ],
        env,
        source_file: default_source_file(),
        artifact_file: default_artifact_file(),
        allowed_flags: vec!["-trimpath".to_string()],
    };

    let mut toolchains = BTreeMap::new();
    toolchains.insert(default_toolchain_name(), stable);
    toolchains
}

fn default_source_file() -> String {
    "main.go".to_string()
}

fn default_artifact_file() -> String {
    "main.wasm".to_string()
}

fn default_true() -> bool {
    true
}

fn default_sweep_interval_secs() -> u64 {
    600
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_max_store_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_playground_url() -> String {
    "https://go.dev/_".to_string()
}

fn default_tip_playground_url() -> String {
    "https://gotipplay.golang.org".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_connect_retries() -> u32 {
    2
}
