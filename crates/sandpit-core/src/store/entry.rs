//! Cache entries, reader leases and build reservations.

use crate::fingerprint::Fingerprint;
use crate::store::metadata::{EntryMetadata, PersistedState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

pub(crate) const OUTPUT_DIR: &str = "output";

/// Why a build attempt failed for reasons other than the program itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InfraFailure {
    DeadlineExceeded,
    SpawnFailed,
    /// The compiler was killed by a signal rather than exiting.
    Signalled,
    Io,
    OutputTooLarge,
    MissingArtifact,
    Cancelled,
    Abandoned,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum FailureKind {
    /// The toolchain rejected the program. Deterministic, so it is cached.
    Compile,
    Infrastructure(InfraFailure),
}

/// Captured compiler output.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BuildLog {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub duration_ms: u64,
}

/// What the reservation owner hands to [`ArtifactStore::complete`](super::ArtifactStore::complete).
#[derive(Debug, Clone)]
pub enum BuildOutcome {
    /// The artifact file to publish into the entry.
    Succeeded { artifact: PathBuf },
    CompileFailed,
    Infrastructure(InfraFailure),
}

/// Terminal payload of an entry.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildRecord {
    pub log: BuildLog,
    pub failure: Option<FailureKind>,
    pub artifact: Option<String>,
}

#[derive(Debug, Clone)]
pub enum EntryState {
    Reserved,
    Ready(Arc<BuildRecord>),
    Failed(Arc<BuildRecord>),
}

impl EntryState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EntryState::Reserved)
    }

    pub fn record(&self) -> Option<&Arc<BuildRecord>> {
        match self {
            EntryState::Reserved => None,
            EntryState::Ready(record) | EntryState::Failed(record) => Some(record),
        }
    }

    pub fn failure(&self) -> Option<FailureKind> {
        self.record().and_then(|r| r.failure)
    }

    pub(crate) fn from_metadata(meta: &EntryMetadata) -> Self {
        let record = || {
            Arc::new(BuildRecord {
                log: meta.log.clone().unwrap_or_default(),
                failure: meta.failure,
                artifact: meta.artifact.clone(),
            })
        };
        match meta.state {
            PersistedState::Reserved => EntryState::Reserved,
            PersistedState::Ready => EntryState::Ready(record()),
            PersistedState::Failed => EntryState::Failed(record()),
        }
    }
}

/// One fingerprint's slot in the store.
#[derive(Debug)]
pub struct ArtifactEntry {
    fingerprint: Fingerprint,
    dir: PathBuf,
    state: watch::Sender<EntryState>,
    meta: Mutex<EntryMetadata>,
    /// Held across a metadata update and its write to disk, so `meta.json`
    /// writes land in the order the updates were made.
    persist: tokio::sync::Mutex<()>,
    readers: AtomicUsize,
}

impl ArtifactEntry {
    pub(crate) fn reserved(fingerprint: Fingerprint, dir: PathBuf, now: DateTime<Utc>) -> Self {
        let meta = EntryMetadata::reserved(fingerprint.clone(), now);
        Self::from_parts(fingerprint, dir, meta)
    }

    pub(crate) fn restored(dir: PathBuf, meta: EntryMetadata) -> Self {
        Self::from_parts(meta.fingerprint.clone(), dir, meta)
    }

    fn from_parts(fingerprint: Fingerprint, dir: PathBuf, meta: EntryMetadata) -> Self {
        let (state, _) = watch::channel(EntryState::from_metadata(&meta));
        Self {
            fingerprint,
            dir,
            state,
            meta: Mutex::new(meta),
            persist: tokio::sync::Mutex::new(()),
            readers: AtomicUsize::new(0),
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state(&self) -> EntryState {
        self.state.borrow().clone()
    }

    pub fn readers(&self) -> usize {
        self.readers.load(Ordering::SeqCst)
    }

    pub fn last_access_at(&self) -> DateTime<Utc> {
        self.meta().last_access_at
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.meta().created_at
    }

    pub fn size_bytes(&self) -> u64 {
        self.meta().size_bytes
    }

    pub(crate) fn meta(&self) -> MutexGuard<'_, EntryMetadata> {
        self.meta.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) async fn lock_persist(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.persist.lock().await
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<EntryState> {
        self.state.subscribe()
    }

    /// An infrastructure failure is not a property of the input, so the next
    /// request for this fingerprint may replace it with a fresh reservation.
    pub(crate) fn is_retryable_failure(&self) -> bool {
        matches!(
            self.state().failure(),
            Some(FailureKind::Infrastructure(_))
        )
    }

    /// Moves `Reserved` to `next`. Returns false, leaving the state untouched,
    /// when the entry is already terminal.
    pub(crate) fn settle(&self, next: EntryState) -> bool {
        self.state.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            *current = next;
            true
        })
    }

    pub(crate) fn artifact_path(&self) -> Option<PathBuf> {
        match self.state() {
            EntryState::Ready(record) => record
                .artifact
                .as_ref()
                .map(|name| self.dir.join(OUTPUT_DIR).join(name)),
            _ => None,
        }
    }
}

/// Keeps the janitor away from an entry while held.
///
/// Leases are only created while the store index lock is held, which is what
/// makes the reader count a reliable eviction guard.
#[derive(Debug)]
pub struct ArtifactLease {
    entry: Arc<ArtifactEntry>,
}

impl ArtifactLease {
    pub(crate) fn acquire(entry: Arc<ArtifactEntry>) -> Self {
        entry.readers.fetch_add(1, Ordering::SeqCst);
        Self { entry }
    }

    pub fn entry(&self) -> &Arc<ArtifactEntry> {
        &self.entry
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        self.entry.fingerprint()
    }

    pub fn state(&self) -> EntryState {
        self.entry.state()
    }

    /// Path of the published artifact, only for `Ready` entries.
    pub fn artifact_path(&self) -> Option<PathBuf> {
        self.entry.artifact_path()
    }
}

impl Drop for ArtifactLease {
    fn drop(&mut self) {
        self.entry.readers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Exclusive right to build one fingerprint.
///
/// Must be consumed by [`ArtifactStore::complete`](super::ArtifactStore::complete).
/// Dropping it on any other path fails the entry so waiters are released.
#[derive(Debug)]
pub struct Reservation {
    lease: ArtifactLease,
    settled: bool,
}

impl Reservation {
    pub(crate) fn new(lease: ArtifactLease) -> Self {
        Self {
            lease,
            settled: false,
        }
    }

    pub fn entry(&self) -> &Arc<ArtifactEntry> {
        self.lease.entry()
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        self.lease.fingerprint()
    }

    /// An extra reader lease on the reserved entry, so the owner's caller can
    /// wait on it like any other attacher. The reservation already pins the
    /// entry, so this does not need the index lock.
    pub fn reader(&self) -> ArtifactLease {
        ArtifactLease::acquire(self.lease.entry.clone())
    }

    pub(crate) fn mark_settled(&mut self) {
        self.settled = true;
    }

    /// Settles the entry as an infrastructure failure without touching disk.
    pub(crate) fn fail_in_memory(&mut self, reason: InfraFailure, log: BuildLog) {
        self.settled = true;
        self.lease.entry.settle(EntryState::Failed(Arc::new(BuildRecord {
            log,
            failure: Some(FailureKind::Infrastructure(reason)),
            artifact: None,
        })));
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled {
            log::warn!(
                "Reservation for {} dropped before completion, marking it failed",
                self.lease.fingerprint().short()
            );
            self.fail_in_memory(InfraFailure::Abandoned, BuildLog::default());
        }
    }
}

/// Outcome of [`ArtifactStore::reserve_or_attach`](super::ArtifactStore::reserve_or_attach).
#[derive(Debug)]
pub enum Attachment {
    /// The caller owns the build.
    Reserved(Reservation),
    /// Someone else built or is building it.
    Attached(ArtifactLease),
}

impl Attachment {
    pub fn is_new_reservation(&self) -> bool {
        matches!(self, Attachment::Reserved(_))
    }

    pub fn entry(&self) -> &Arc<ArtifactEntry> {
        match self {
            Attachment::Reserved(reservation) => reservation.entry(),
            Attachment::Attached(lease) => lease.entry(),
        }
    }
}
