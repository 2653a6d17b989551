//! Error types for the build pipeline
//!
//! Failures are split by who has to act on them. `StoreError` and the
//! infrastructure detail inside it stay on the server side and are logged;
//! `BuildError` is what a caller sees, and it deliberately carries no paths or
//! OS messages for internal faults. A toolchain rejecting a program is not an
//! error at all: it is a normal build result with a non-zero exit status.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised by the artifact store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O {operation} failed for {}: {source}", .path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Entry {0} is busy")]
    EntryBusy(String),
    #[error("Entry {0} not found")]
    NotFound(String),
    #[error("Timed out waiting for entry {0}")]
    Timeout(String),
    #[error("Invalid metadata for entry {fingerprint}: {message}")]
    Metadata { fingerprint: String, message: String },
}

impl StoreError {
    pub fn io(source: std::io::Error, path: impl AsRef<Path>, operation: &'static str) -> Self {
        StoreError::Io {
            operation,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn metadata(fingerprint: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Metadata {
            fingerprint: fingerprint.into(),
            message: message.into(),
        }
    }
}

/// Failures talking to a remote reference-execution backend.
#[derive(Error, Debug, Clone)]
pub enum RemoteError {
    #[error("Remote backend unreachable: {0}")]
    Transport(String),
    #[error("Remote backend timed out")]
    Timeout,
    #[error("Remote backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Failed to decode remote response: {0}")]
    Decode(String),
    #[error("Remote backend '{0}' is not configured")]
    NotConfigured(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RemoteError::Timeout
        } else if err.is_decode() {
            RemoteError::Decode(err.to_string())
        } else {
            RemoteError::Transport(err.to_string())
        }
    }
}

/// Caller-facing build errors.
#[derive(Error, Debug, Clone)]
pub enum BuildError {
    #[error("Build deadline exceeded")]
    Timeout,
    #[error("Request rejected: {0}")]
    Rejected(String),
    #[error("Internal build failure")]
    Internal,
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl BuildError {
    pub fn rejected(msg: impl Into<String>) -> Self {
        BuildError::Rejected(msg.into())
    }
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    Read { path: String, message: String },
    #[error("Failed to parse YAML config: {0}")]
    Parse(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}
