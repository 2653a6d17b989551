//! On-disk metadata record, one `meta.json` per entry directory.

use crate::errors::StoreError;
use crate::fingerprint::Fingerprint;
use crate::store::entry::{BuildLog, FailureKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

pub(crate) const METADATA_FILE: &str = "meta.json";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PersistedState {
    Reserved,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntryMetadata {
    pub fingerprint: Fingerprint,
    pub state: PersistedState,
    pub created_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub artifact: Option<String>,
    #[serde(default)]
    pub failure: Option<FailureKind>,
    #[serde(default)]
    pub log: Option<BuildLog>,
}

impl EntryMetadata {
    pub fn reserved(fingerprint: Fingerprint, now: DateTime<Utc>) -> Self {
        Self {
            fingerprint,
            state: PersistedState::Reserved,
            created_at: now,
            last_access_at: now,
            size_bytes: 0,
            artifact: None,
            failure: None,
            log: None,
        }
    }

    /// Entries worth keeping across a restart.
    pub fn is_restorable(&self) -> bool {
        match self.state {
            PersistedState::Reserved => false,
            PersistedState::Ready => self.artifact.is_some(),
            PersistedState::Failed => self.failure == Some(FailureKind::Compile),
        }
    }
}

pub(crate) fn metadata_path(dir: &Path) -> PathBuf {
    dir.join(METADATA_FILE)
}

pub(crate) async fn read(dir: &Path) -> Result<EntryMetadata, StoreError> {
    let path = metadata_path(dir);
    let bytes = fs::read(&path)
        .await
        .map_err(|e| StoreError::io(e, &path, "read"))?;
    serde_json::from_slice(&bytes).map_err(|e| {
        StoreError::metadata(
            dir.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            e.to_string(),
        )
    })
}

/// Writes `meta.json` via a temporary file and rename. Returns the byte size.
pub(crate) async fn write_atomic(dir: &Path, meta: &EntryMetadata) -> Result<u64, StoreError> {
    let json = serde_json::to_vec_pretty(meta)
        .map_err(|e| StoreError::metadata(meta.fingerprint.as_str(), e.to_string()))?;
    let tmp = dir.join(format!(".{}.{}", METADATA_FILE, uuid::Uuid::new_v4()));
    fs::write(&tmp, &json)
        .await
        .map_err(|e| StoreError::io(e, &tmp, "write"))?;

    let target = metadata_path(dir);
    if let Err(e) = fs::rename(&tmp, &target).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(StoreError::io(e, &target, "rename"));
    }
    Ok(json.len() as u64)
}
