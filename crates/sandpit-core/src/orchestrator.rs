//! Build orchestration
//!
//! [`BuildOrchestrator::execute`] turns a request into a [`BuildResult`]:
//!
//! 1. validate the request and compute its [`Fingerprint`]
//! 2. reserve or attach to the store entry
//! 3. as reservation owner, start the build on a tracked background task
//! 4. wait, with the caller's deadline, for the entry to become terminal
//!
//! The build itself is not tied to the calling future. A caller that times out
//! or disconnects only stops waiting; the build finishes for whoever asks next.
//! Build processes are limited by one global pool of slots shared by all
//! toolchains.

use crate::config::{BuildConfig, JanitorConfig};
use crate::environment::EnvironmentSpec;
use crate::errors::{BuildError, StoreError};
use crate::fingerprint::Fingerprint;
use crate::janitor::{interval_ticker, EvictionPolicy, Janitor};
use crate::playground::{PlaygroundServices, RemoteBackend, RemoteRunRequest, RemoteRunResponse};
use crate::process::{run_process, CapturedOutput, ProcessOutcome, ProcessSpec};
use crate::store::{
    ArtifactLease, ArtifactStore, Attachment, BuildLog, BuildOutcome, BuildRecord, EntryState,
    FailureKind, InfraFailure, Reservation,
};
use crate::toolchain::{Toolchain, ToolchainRegistry};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Grace given to cancelled builds to kill their children and settle.
const CANCEL_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub source: String,
    /// Toolchain name. Empty selects the default toolchain.
    pub toolchain: String,
    pub flags: Vec<String>,
    pub deadline: Instant,
}

impl BuildRequest {
    pub fn new(source: impl Into<String>, toolchain: impl Into<String>, timeout: Duration) -> Self {
        Self {
            source: source.into(),
            toolchain: toolchain.into(),
            flags: Vec::new(),
            deadline: Instant::now() + timeout,
        }
    }

    pub fn with_flags(mut self, flags: Vec<String>) -> Self {
        self.flags = flags;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildResult {
    pub fingerprint: Fingerprint,
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    /// True when this call did not run the compiler itself.
    pub from_cache: bool,
    /// File name of the published artifact, for successful builds.
    pub artifact: Option<String>,
}

impl BuildResult {
    fn from_record(fingerprint: Fingerprint, record: &BuildRecord, from_cache: bool) -> Self {
        Self {
            fingerprint,
            exit_status: record.log.exit_status,
            stdout: record.log.stdout.clone(),
            stderr: record.log.stderr.clone(),
            truncated: record.log.truncated,
            from_cache,
            artifact: record.artifact.clone(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_status == 0 && self.artifact.is_some()
    }
}

#[derive(Debug, Default)]
struct Stats {
    builds_spawned: AtomicU64,
    cache_hits: AtomicU64,
    compile_failures: AtomicU64,
    infra_failures: AtomicU64,
    timeouts: AtomicU64,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub builds_spawned: u64,
    pub cache_hits: u64,
    pub compile_failures: u64,
    pub infra_failures: u64,
    pub timeouts: u64,
    pub active_builds: usize,
    pub peak_active_builds: usize,
    pub entries: usize,
    pub store_bytes: u64,
}

/// Counts a running build for as long as it is held.
struct ActiveBuild<'a> {
    stats: &'a Stats,
    _permit: OwnedSemaphorePermit,
}

impl<'a> ActiveBuild<'a> {
    fn start(stats: &'a Stats, permit: OwnedSemaphorePermit) -> Self {
        let active = stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        stats.peak_active.fetch_max(active, Ordering::SeqCst);
        Self {
            stats,
            _permit: permit,
        }
    }
}

impl Drop for ActiveBuild<'_> {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct BuildOrchestrator {
    inner: Arc<OrchestratorInner>,
}

#[derive(Debug)]
struct OrchestratorInner {
    store: ArtifactStore,
    registry: ToolchainRegistry,
    env: EnvironmentSpec,
    work_dir: PathBuf,
    build_timeout: Duration,
    max_output_bytes: usize,
    max_artifact_bytes: u64,
    max_source_bytes: usize,
    slots: Arc<Semaphore>,
    tasks: TaskTracker,
    /// Stops new work and the janitor.
    shutdown: CancellationToken,
    /// Kills running builds.
    abort_builds: CancellationToken,
    playground: PlaygroundServices,
    stats: Stats,
}

impl BuildOrchestrator {
    pub fn new(config: &BuildConfig, store: ArtifactStore, env: EnvironmentSpec) -> Self {
        Self::with_playground(config, store, env, PlaygroundServices::default())
    }

    pub fn with_playground(
        config: &BuildConfig,
        store: ArtifactStore,
        env: EnvironmentSpec,
        playground: PlaygroundServices,
    ) -> Self {
        log::info!(
            "Build orchestrator ready: {} build slots, toolchains {:?}, environment {:?}",
            config.max_concurrent_builds,
            config.toolchains.keys().collect::<Vec<_>>(),
            env.names()
        );
        Self {
            inner: Arc::new(OrchestratorInner {
                store,
                registry: ToolchainRegistry::from_config(config),
                env,
                work_dir: config.work_dir.clone().unwrap_or_else(std::env::temp_dir),
                build_timeout: config.build_timeout(),
                max_output_bytes: config.max_output_bytes,
                max_artifact_bytes: config.max_artifact_bytes,
                max_source_bytes: config.max_source_bytes,
                slots: Arc::new(Semaphore::new(config.max_concurrent_builds.max(1))),
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                abort_builds: CancellationToken::new(),
                playground,
                stats: Stats::default(),
            }),
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.inner.store
    }

    pub fn registry(&self) -> &ToolchainRegistry {
        &self.inner.registry
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    fn check_accepting(&self) -> Result<(), BuildError> {
        if self.is_shutting_down() {
            return Err(BuildError::rejected("server is shutting down"));
        }
        Ok(())
    }

    fn check_source_size(&self, source: &str) -> Result<(), BuildError> {
        if source.len() > self.inner.max_source_bytes {
            return Err(BuildError::rejected(format!(
                "source is {} bytes, limit is {}",
                source.len(),
                self.inner.max_source_bytes
            )));
        }
        Ok(())
    }

    /// Builds `request`, or returns the cached outcome for its fingerprint.
    ///
    /// A compile failure is a successful call with a non-zero exit status.
    pub async fn execute(&self, request: BuildRequest) -> Result<BuildResult, BuildError> {
        self.check_accepting()?;
        self.check_source_size(&request.source)?;
        let toolchain = self.inner.registry.resolve(&request.toolchain)?;
        toolchain.validate_flags(&request.flags)?;

        let fingerprint = Fingerprint::compute(&request.source, toolchain.name(), &request.flags);
        let attachment = self
            .inner
            .store
            .reserve_or_attach(&fingerprint)
            .await
            .map_err(|e| self.internal(&fingerprint, e))?;

        match attachment {
            Attachment::Reserved(reservation) => {
                let lease = reservation.reader();
                let BuildRequest {
                    source,
                    flags,
                    deadline,
                    ..
                } = request;
                let build_deadline = deadline.min(Instant::now() + self.inner.build_timeout);
                let inner = self.inner.clone();
                self.inner.tasks.spawn(async move {
                    inner
                        .build_owned(reservation, toolchain, source, flags, build_deadline)
                        .await;
                });
                self.wait_for(lease, deadline, false).await
            }
            Attachment::Attached(lease) => self.wait_for(lease, request.deadline, true).await,
        }
    }

    async fn wait_for(
        &self,
        lease: ArtifactLease,
        deadline: Instant,
        attached: bool,
    ) -> Result<BuildResult, BuildError> {
        let fingerprint = lease.fingerprint().clone();
        let state = match self.inner.store.await_terminal(&lease, deadline).await {
            Ok(state) => state,
            Err(StoreError::Timeout(_)) => {
                self.inner.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                log::info!("Deadline passed waiting for build {}", fingerprint.short());
                return Err(BuildError::Timeout);
            }
            Err(e) => return Err(self.internal(&fingerprint, e)),
        };

        match &state {
            EntryState::Ready(record) => {
                if attached {
                    self.record_hit(&lease).await;
                }
                Ok(BuildResult::from_record(fingerprint, record, attached))
            }
            EntryState::Failed(record) => match record.failure {
                Some(FailureKind::Compile) | None => {
                    if attached {
                        self.record_hit(&lease).await;
                    }
                    Ok(BuildResult::from_record(fingerprint, record, attached))
                }
                Some(FailureKind::Infrastructure(InfraFailure::DeadlineExceeded)) => {
                    self.inner.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    Err(BuildError::Timeout)
                }
                Some(FailureKind::Infrastructure(reason)) => {
                    log::debug!(
                        "Build {} failed for infrastructure reasons: {:?}",
                        fingerprint.short(),
                        reason
                    );
                    Err(BuildError::Internal)
                }
            },
            EntryState::Reserved => Err(self.internal(
                &fingerprint,
                StoreError::NotFound(fingerprint.to_string()),
            )),
        }
    }

    async fn record_hit(&self, lease: &ArtifactLease) {
        self.inner.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
        log::debug!("Cache hit for {}", lease.fingerprint().short());
        self.inner.store.touch(lease).await;
    }

    fn internal(&self, fingerprint: &Fingerprint, err: StoreError) -> BuildError {
        log::error!("Store failure for build {}: {}", fingerprint.short(), err);
        BuildError::Internal
    }

    /// Opens the artifact of a `Ready` entry for reading.
    ///
    /// The returned lease keeps the janitor away until it is dropped.
    pub async fn open_artifact(&self, fingerprint: &Fingerprint) -> Option<(ArtifactLease, PathBuf)> {
        let lease = self.inner.store.attach(fingerprint).await?;
        let path = lease.artifact_path()?;
        self.inner.store.touch(&lease).await;
        Some((lease, path))
    }

    /// Runs `source` on a remote reference backend.
    pub async fn run_remote(
        &self,
        backend: RemoteBackend,
        request: RemoteRunRequest,
    ) -> Result<RemoteRunResponse, BuildError> {
        self.check_accepting()?;
        self.check_source_size(&request.source)?;
        let client = self.inner.playground.get(backend)?;
        client.compile(&request).await.map_err(|e| {
            log::warn!("Remote {} backend failed: {}", backend, e);
            BuildError::Remote(e)
        })
    }

    /// Starts the janitor under this orchestrator's shutdown token.
    pub fn spawn_janitor(&self, config: &JanitorConfig) {
        if !config.enabled {
            log::info!("Janitor disabled by configuration");
            return;
        }
        let janitor = Janitor::new(self.inner.store.clone(), EvictionPolicy::from_config(config));
        let ticker = interval_ticker(config.interval());
        let cancel = self.inner.shutdown.child_token();
        self.inner.tasks.spawn(janitor.run(ticker, cancel));
    }

    /// Stops accepting work, stops the janitor and waits up to `grace` for
    /// running builds. Builds still running after that are killed and their
    /// entries failed.
    pub async fn shutdown(&self, grace: Duration) {
        log::info!("Shutting down build orchestrator (grace {:?})", grace);
        self.inner.shutdown.cancel();
        self.inner.tasks.close();

        if tokio::time::timeout(grace, self.inner.tasks.wait()).await.is_ok() {
            log::info!("All builds finished");
            return;
        }

        log::warn!(
            "{} builds still running after grace period, cancelling",
            self.inner.stats.active.load(Ordering::SeqCst)
        );
        self.inner.abort_builds.cancel();
        if tokio::time::timeout(CANCEL_SETTLE_TIMEOUT, self.inner.tasks.wait())
            .await
            .is_err()
        {
            log::error!("Cancelled builds did not settle in time");
        }
    }

    pub async fn stats(&self) -> StatsSnapshot {
        let stats = &self.inner.stats;
        StatsSnapshot {
            builds_spawned: stats.builds_spawned.load(Ordering::Relaxed),
            cache_hits: stats.cache_hits.load(Ordering::Relaxed),
            compile_failures: stats.compile_failures.load(Ordering::Relaxed),
            infra_failures: stats.infra_failures.load(Ordering::Relaxed),
            timeouts: stats.timeouts.load(Ordering::Relaxed),
            active_builds: stats.active.load(Ordering::SeqCst),
            peak_active_builds: stats.peak_active.load(Ordering::SeqCst),
            entries: self.inner.store.len().await,
            store_bytes: self.inner.store.total_bytes().await,
        }
    }
}

impl OrchestratorInner {
    /// Runs the build for a reservation and publishes its outcome.
    ///
    /// The scratch directory lives until the outcome is published, then is
    /// removed when it goes out of scope, on every path.
    async fn build_owned(
        &self,
        reservation: Reservation,
        toolchain: Arc<Toolchain>,
        source: String,
        flags: Vec<String>,
        deadline: Instant,
    ) {
        let fingerprint = reservation.fingerprint().clone();
        let (log, outcome, _workdir) = self
            .run_build(&fingerprint, &toolchain, &source, &flags, deadline)
            .await;

        match &outcome {
            BuildOutcome::Succeeded { .. } => {}
            BuildOutcome::CompileFailed => {
                self.stats.compile_failures.fetch_add(1, Ordering::Relaxed);
            }
            BuildOutcome::Infrastructure(_) => {
                self.stats.infra_failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        if let Err(e) = self.store.complete(reservation, log, outcome).await {
            self.stats.infra_failures.fetch_add(1, Ordering::Relaxed);
            log::error!("Failed to complete build {}: {}", fingerprint.short(), e);
        }
    }

    async fn run_build(
        &self,
        fingerprint: &Fingerprint,
        toolchain: &Toolchain,
        source: &str,
        flags: &[String],
        deadline: Instant,
    ) -> (BuildLog, BuildOutcome, Option<tempfile::TempDir>) {
        if source.trim().is_empty() {
            let log = BuildLog {
                exit_status: 1,
                stderr: format!("{}: source is empty\n", toolchain.source_file()),
                ..Default::default()
            };
            return (log, BuildOutcome::CompileFailed, None);
        }

        let permit = tokio::select! {
            permit = tokio::time::timeout_at(deadline, self.slots.clone().acquire_owned()) => permit,
            _ = self.abort_builds.cancelled() => {
                return infra(InfraFailure::Cancelled, None);
            }
        };
        let permit = match permit {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return infra(InfraFailure::Cancelled, None),
            Err(_) => {
                log::info!("Build {} timed out waiting for a slot", fingerprint.short());
                return infra(InfraFailure::DeadlineExceeded, None);
            }
        };
        let _active = ActiveBuild::start(&self.stats, permit);

        let workdir = match self.prepare_workdir(toolchain, source).await {
            Ok(dir) => dir,
            Err(e) => {
                log::error!(
                    "Failed to prepare scratch directory for {} under {}: {}",
                    fingerprint.short(),
                    self.work_dir.display(),
                    e
                );
                return infra(InfraFailure::Io, None);
            }
        };

        let command = toolchain.command(workdir.path(), flags);
        let mut env = self.env.vars().to_vec();
        env.push(("TMPDIR".to_string(), workdir.path().display().to_string()));
        env.extend(command.env);
        let spec = ProcessSpec {
            program: command.program,
            args: command.args,
            env,
            cwd: workdir.path().to_path_buf(),
            deadline,
            max_output_bytes: self.max_output_bytes,
        };

        self.stats.builds_spawned.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "Building {} with toolchain {} in {}",
            fingerprint.short(),
            toolchain.name(),
            workdir.path().display()
        );

        let output = match run_process(&spec, &self.abort_builds).await {
            Ok(ProcessOutcome::Exited(output)) => output,
            Ok(ProcessOutcome::TimedOut) => {
                log::warn!("Build {} killed at its deadline", fingerprint.short());
                return infra(InfraFailure::DeadlineExceeded, Some(workdir));
            }
            Ok(ProcessOutcome::Cancelled) => {
                log::warn!("Build {} cancelled", fingerprint.short());
                return infra(InfraFailure::Cancelled, Some(workdir));
            }
            Err(e) => {
                log::error!(
                    "Failed to start {} for build {} in {}: {}",
                    spec.program,
                    fingerprint.short(),
                    workdir.path().display(),
                    e
                );
                return infra(InfraFailure::SpawnFailed, Some(workdir));
            }
        };

        let log = build_log(&output);
        let outcome = self
            .classify(fingerprint, &output, &workdir.path().join(toolchain.artifact_file()))
            .await;
        (log, outcome, Some(workdir))
    }

    async fn prepare_workdir(
        &self,
        toolchain: &Toolchain,
        source: &str,
    ) -> std::io::Result<tempfile::TempDir> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        let workdir = tempfile::Builder::new()
            .prefix("sandpit-build-")
            .tempdir_in(&self.work_dir)?;
        tokio::fs::write(workdir.path().join(toolchain.source_file()), source).await?;
        Ok(workdir)
    }

    async fn classify(
        &self,
        fingerprint: &Fingerprint,
        output: &CapturedOutput,
        artifact: &Path,
    ) -> BuildOutcome {
        if output.exit_status < 0 {
            log::warn!("Build {} terminated by a signal", fingerprint.short());
            return BuildOutcome::Infrastructure(InfraFailure::Signalled);
        }
        if output.exit_status != 0 {
            return BuildOutcome::CompileFailed;
        }

        match tokio::fs::metadata(artifact).await {
            Ok(meta) if meta.len() > self.max_artifact_bytes => {
                log::warn!(
                    "Build {} produced a {} byte artifact, limit is {}",
                    fingerprint.short(),
                    meta.len(),
                    self.max_artifact_bytes
                );
                BuildOutcome::Infrastructure(InfraFailure::OutputTooLarge)
            }
            Ok(meta) if meta.is_file() => BuildOutcome::Succeeded {
                artifact: artifact.to_path_buf(),
            },
            _ => {
                log::error!(
                    "Build {} exited cleanly but {} is missing",
                    fingerprint.short(),
                    artifact.display()
                );
                BuildOutcome::Infrastructure(InfraFailure::MissingArtifact)
            }
        }
    }
}

fn infra(
    reason: InfraFailure,
    workdir: Option<tempfile::TempDir>,
) -> (BuildLog, BuildOutcome, Option<tempfile::TempDir>) {
    let log = BuildLog {
        exit_status: -1,
        ..Default::default()
    };
    (log, BuildOutcome::Infrastructure(reason), workdir)
}

fn build_log(output: &CapturedOutput) -> BuildLog {
    BuildLog {
        exit_status: output.exit_status,
        stdout: output.stdout.clone(),
        stderr: output.stderr.clone(),
        truncated: output.truncated,
        duration_ms: output.duration.as_millis() as u64,
    }
}
