//! Content-addressed artifact store
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/<fingerprint hex>/meta.json      state, timestamps, size, build log
//! <root>/<fingerprint hex>/output/<file>  published build output
//! <root>/.trash/                          directories being deleted
//! ```
//!
//! The index lock guards structural changes only (insert, replace, remove).
//! Builds run without it; waiters block on the entry's own watch channel.
//! Output is staged next to the entry and renamed into place before the entry
//! turns `Ready`, so a reader never sees a partial output directory.

pub mod entry;
pub mod metadata;

pub use entry::{
    ArtifactEntry, ArtifactLease, Attachment, BuildLog, BuildOutcome, BuildRecord, EntryState,
    FailureKind, InfraFailure, Reservation,
};
pub use metadata::{EntryMetadata, PersistedState};

use crate::clock::Clock;
use crate::errors::StoreError;
use crate::fingerprint::Fingerprint;
use chrono::{DateTime, Utc};
use entry::OUTPUT_DIR;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::time::Instant;

const TRASH_DIR: &str = ".trash";
const STAGING_PREFIX: &str = ".staging-";

/// Point-in-time view of one entry, used by the janitor and stats.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySnapshot {
    pub fingerprint: Fingerprint,
    pub terminal: bool,
    pub created_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub readers: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BootstrapReport {
    pub restored: usize,
    pub discarded: usize,
    pub total_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    root: PathBuf,
    index: Mutex<HashMap<Fingerprint, Arc<ArtifactEntry>>>,
    clock: Arc<dyn Clock>,
}

impl ArtifactStore {
    /// Creates a store handle. Nothing touches disk until [`bootstrap`](Self::bootstrap).
    pub fn new(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                root: root.into(),
                index: Mutex::new(HashMap::new()),
                clock,
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    fn entry_dir(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.inner.root.join(fingerprint.as_str())
    }

    fn trash_dir(&self) -> PathBuf {
        self.inner.root.join(TRASH_DIR)
    }

    /// Rebuilds the index from disk.
    ///
    /// Entries left `Reserved` by a crash, infrastructure failures, directories
    /// with unreadable metadata and leftover trash are deleted. Ready entries
    /// and cached compile failures are restored.
    pub async fn bootstrap(&self) -> Result<BootstrapReport, StoreError> {
        let root = self.root().to_path_buf();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| StoreError::io(e, &root, "create_dir_all"))?;
        remove_dir_if_exists(&self.trash_dir()).await?;

        let mut report = BootstrapReport::default();
        let mut restored = HashMap::new();

        let mut dir_entries = fs::read_dir(&root)
            .await
            .map_err(|e| StoreError::io(e, &root, "read_dir"))?;
        while let Some(item) = dir_entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(e, &root, "read_dir"))?
        {
            let path = item.path();
            let name = item.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let is_dir = item.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                log::warn!("Ignoring stray file in build store: {}", path.display());
                continue;
            }

            match self.restore_entry(&name, &path).await {
                Some(entry) => {
                    report.restored += 1;
                    report.total_bytes += entry.size_bytes();
                    restored.insert(entry.fingerprint().clone(), Arc::new(entry));
                }
                None => {
                    remove_dir_if_exists(&path).await?;
                    report.discarded += 1;
                }
            }
        }

        let mut index = self.inner.index.lock().await;
        *index = restored;
        drop(index);

        log::info!(
            "Build store at {} bootstrapped: {} restored, {} discarded, {} bytes",
            root.display(),
            report.restored,
            report.discarded,
            report.total_bytes
        );
        Ok(report)
    }

    async fn restore_entry(&self, name: &str, path: &Path) -> Option<ArtifactEntry> {
        let Some(fingerprint) = Fingerprint::parse(name) else {
            log::warn!("Discarding unrecognised store directory {}", path.display());
            return None;
        };
        let meta = match metadata::read(path).await {
            Ok(meta) => meta,
            Err(e) => {
                log::warn!("Discarding store entry {}: {}", fingerprint.short(), e);
                return None;
            }
        };
        if meta.fingerprint != fingerprint || !meta.is_restorable() {
            log::info!(
                "Discarding store entry {} left in state {:?}",
                fingerprint.short(),
                meta.state
            );
            return None;
        }
        if let Some(artifact) = &meta.artifact {
            let artifact_path = path.join(OUTPUT_DIR).join(artifact);
            if !fs::try_exists(&artifact_path).await.unwrap_or(false) {
                log::warn!(
                    "Discarding store entry {}: artifact missing",
                    fingerprint.short()
                );
                return None;
            }
        }
        remove_staging_leftovers(path).await;
        Some(ArtifactEntry::restored(path.to_path_buf(), meta))
    }

    /// The single-flight gate.
    ///
    /// Returns a [`Reservation`] when no usable entry exists (none at all, or
    /// one that failed for infrastructure reasons); otherwise attaches to the
    /// existing entry whatever its state.
    pub async fn reserve_or_attach(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Attachment, StoreError> {
        let mut index = self.inner.index.lock().await;

        let mut stale_trash = None;
        if let Some(existing) = index.get(fingerprint) {
            if !existing.is_retryable_failure() {
                log::debug!("Attaching to existing entry {}", fingerprint.short());
                return Ok(Attachment::Attached(ArtifactLease::acquire(existing.clone())));
            }
            log::info!(
                "Entry {} failed for infrastructure reasons, rebuilding",
                fingerprint.short()
            );
            let dir = existing.dir().to_path_buf();
            stale_trash = self.move_to_trash(&dir).await?;
            index.remove(fingerprint);
        }

        let dir = self.entry_dir(fingerprint);
        let entry = Arc::new(ArtifactEntry::reserved(
            fingerprint.clone(),
            dir.clone(),
            self.inner.clock.now(),
        ));
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(e, &dir, "create_dir_all"))?;
        let meta = entry.meta().clone();
        if let Err(e) = metadata::write_atomic(&dir, &meta).await {
            let _ = fs::remove_dir_all(&dir).await;
            return Err(e);
        }

        index.insert(fingerprint.clone(), entry.clone());
        let reservation = Reservation::new(ArtifactLease::acquire(entry));
        drop(index);

        if let Some(trash) = stale_trash {
            remove_trash(trash).await;
        }

        log::debug!("Reserved entry {}", fingerprint.short());
        Ok(Attachment::Reserved(reservation))
    }

    /// Attaches to an existing entry without ever reserving.
    pub async fn attach(&self, fingerprint: &Fingerprint) -> Option<ArtifactLease> {
        let index = self.inner.index.lock().await;
        index
            .get(fingerprint)
            .map(|entry| ArtifactLease::acquire(entry.clone()))
    }

    /// Waits until the entry is `Ready` or `Failed`, or until `deadline`.
    pub async fn await_terminal(
        &self,
        lease: &ArtifactLease,
        deadline: Instant,
    ) -> Result<EntryState, StoreError> {
        let mut rx = lease.entry().subscribe();
        let wait = tokio::time::timeout_at(deadline, rx.wait_for(|s| s.is_terminal()));
        let waited = match wait.await {
            Ok(Ok(state)) => Ok((*state).clone()),
            Ok(Err(_)) => Err(StoreError::NotFound(lease.fingerprint().to_string())),
            Err(_) => Err(StoreError::Timeout(lease.fingerprint().to_string())),
        };
        waited
    }

    /// Publishes the build outcome and moves the entry to its terminal state.
    ///
    /// The artifact is copied into a staging directory and renamed into place,
    /// then metadata is rewritten, and only then do waiters observe the new
    /// state. If publishing fails the entry is still failed so waiters are
    /// released. Completing an entry that is already terminal is a no-op.
    pub async fn complete(
        &self,
        mut reservation: Reservation,
        log: BuildLog,
        outcome: BuildOutcome,
    ) -> Result<EntryState, StoreError> {
        let entry = reservation.entry().clone();
        let current = entry.state();
        if current.is_terminal() {
            reservation.mark_settled();
            return Ok(current);
        }

        match self.publish(&entry, &log, outcome).await {
            Ok(state) => {
                entry.settle(state.clone());
                reservation.mark_settled();
                Ok(state)
            }
            Err(e) => {
                log::error!(
                    "Failed to publish build {} in {}: {}",
                    entry.fingerprint().short(),
                    entry.dir().display(),
                    e
                );
                reservation.fail_in_memory(InfraFailure::Io, log);
                Err(e)
            }
        }
    }

    async fn publish(
        &self,
        entry: &ArtifactEntry,
        log: &BuildLog,
        outcome: BuildOutcome,
    ) -> Result<EntryState, StoreError> {
        let dir = entry.dir();
        let (state, failure, artifact, artifact_bytes) = match outcome {
            BuildOutcome::Succeeded { artifact } => {
                let name = artifact
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| {
                        StoreError::metadata(entry.fingerprint().as_str(), "artifact has no file name")
                    })?;
                let bytes = self.stage_output(dir, &artifact, &name).await?;
                (PersistedState::Ready, None, Some(name), bytes)
            }
            BuildOutcome::CompileFailed => {
                (PersistedState::Failed, Some(FailureKind::Compile), None, 0)
            }
            BuildOutcome::Infrastructure(reason) => (
                PersistedState::Failed,
                Some(FailureKind::Infrastructure(reason)),
                None,
                0,
            ),
        };

        let _persist = entry.lock_persist().await;
        let now = self.inner.clock.now();
        let mut meta = entry.meta().clone();
        meta.state = state;
        meta.failure = failure;
        meta.artifact = artifact;
        meta.log = Some(log.clone());
        meta.last_access_at = now;
        meta.size_bytes = artifact_bytes;
        let meta_bytes = metadata::write_atomic(dir, &meta).await?;
        meta.size_bytes = artifact_bytes + meta_bytes;
        *entry.meta() = meta.clone();

        Ok(EntryState::from_metadata(&meta))
    }

    async fn stage_output(&self, dir: &Path, artifact: &Path, name: &str) -> Result<u64, StoreError> {
        let staging = dir.join(format!("{}{}", STAGING_PREFIX, uuid::Uuid::new_v4()));
        fs::create_dir(&staging)
            .await
            .map_err(|e| StoreError::io(e, &staging, "create_dir"))?;

        let staged = async {
            let target = staging.join(name);
            let bytes = fs::copy(artifact, &target)
                .await
                .map_err(|e| StoreError::io(e, &target, "copy"))?;
            let output = dir.join(OUTPUT_DIR);
            remove_dir_if_exists(&output).await?;
            fs::rename(&staging, &output)
                .await
                .map_err(|e| StoreError::io(e, &output, "rename"))?;
            Ok::<u64, StoreError>(bytes)
        }
        .await;

        if staged.is_err() {
            let _ = fs::remove_dir_all(&staging).await;
        }
        staged
    }

    /// Records a cache hit.
    pub async fn touch(&self, lease: &ArtifactLease) {
        let entry = lease.entry();
        if !entry.state().is_terminal() {
            return;
        }
        let _persist = entry.lock_persist().await;
        let meta = {
            let mut meta = entry.meta();
            meta.last_access_at = self.inner.clock.now();
            meta.clone()
        };
        if let Err(e) = metadata::write_atomic(entry.dir(), &meta).await {
            log::warn!(
                "Failed to persist access time for {}: {}",
                entry.fingerprint().short(),
                e
            );
        }
    }

    /// Removes a terminal entry with no readers. Returns the bytes freed.
    pub async fn evict(&self, fingerprint: &Fingerprint) -> Result<u64, StoreError> {
        self.evict_checked(fingerprint, None).await
    }

    /// Like [`evict`](Self::evict), but also refuses when the entry was
    /// accessed after `observed_access`.
    pub async fn evict_if_idle(
        &self,
        fingerprint: &Fingerprint,
        observed_access: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.evict_checked(fingerprint, Some(observed_access)).await
    }

    async fn evict_checked(
        &self,
        fingerprint: &Fingerprint,
        observed_access: Option<DateTime<Utc>>,
    ) -> Result<u64, StoreError> {
        let mut index = self.inner.index.lock().await;
        let entry = index
            .get(fingerprint)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(fingerprint.to_string()))?;

        if !entry.state().is_terminal() || entry.readers() > 0 {
            return Err(StoreError::EntryBusy(fingerprint.to_string()));
        }
        if let Some(observed) = observed_access {
            if entry.last_access_at() != observed {
                return Err(StoreError::EntryBusy(fingerprint.to_string()));
            }
        }

        let trash = self.move_to_trash(entry.dir()).await?;
        index.remove(fingerprint);
        drop(index);

        if let Some(trash) = trash {
            remove_trash(trash).await;
        }
        log::debug!("Evicted entry {}", fingerprint.short());
        Ok(entry.size_bytes())
    }

    /// Renames `dir` into the trash. `None` when it was already gone.
    async fn move_to_trash(&self, dir: &Path) -> Result<Option<PathBuf>, StoreError> {
        let trash_root = self.trash_dir();
        fs::create_dir_all(&trash_root)
            .await
            .map_err(|e| StoreError::io(e, &trash_root, "create_dir_all"))?;

        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let target = trash_root.join(format!("{}-{}", name, uuid::Uuid::new_v4()));
        match fs::rename(dir, &target).await {
            Ok(()) => Ok(Some(target)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(e, dir, "rename")),
        }
    }

    pub async fn snapshot(&self) -> Vec<EntrySnapshot> {
        let index = self.inner.index.lock().await;
        index
            .values()
            .map(|entry| {
                let meta = entry.meta();
                EntrySnapshot {
                    fingerprint: entry.fingerprint().clone(),
                    terminal: entry.state().is_terminal(),
                    created_at: meta.created_at,
                    last_access_at: meta.last_access_at,
                    size_bytes: meta.size_bytes,
                    readers: entry.readers(),
                }
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.index.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn total_bytes(&self) -> u64 {
        let index = self.inner.index.lock().await;
        index.values().map(|e| e.size_bytes()).sum()
    }
}

async fn remove_dir_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(e, path, "remove_dir_all")),
    }
}

async fn remove_trash(path: PathBuf) {
    if let Err(e) = fs::remove_dir_all(&path).await {
        log::warn!("Failed to remove {}: {}", path.display(), e);
    }
}

async fn remove_staging_leftovers(dir: &Path) {
    let Ok(mut items) = fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(item)) = items.next_entry().await {
        if item.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
            let _ = fs::remove_dir_all(item.path()).await;
        }
    }
}
