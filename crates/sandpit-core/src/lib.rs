//! Build orchestration and artifact caching for an untrusted-code playground.
//!
//! This crate turns submitted source text into isolated compiler runs and keeps
//! their outcomes in a content-addressed store on disk, so identical submissions
//! are built once and served from cache afterwards.
//!
//! # Architecture Overview
//!
//! - **Environment filtering**: the allow-listed process environment handed to every build
//! - **Fingerprinting**: deterministic digests over source, toolchain and flags
//! - **Artifact store**: on-disk cache with single-flight reservations and reader leases
//! - **Janitor**: background sweep evicting expired and over-budget entries
//! - **Build orchestration**: deadline-bound compiler processes behind a global concurrency ceiling
//! - **Playground proxy**: alternate execution through remote reference backends

pub mod clock;
pub mod config;
pub mod environment;
pub mod errors;
pub mod fingerprint;
pub mod janitor;
pub mod orchestrator;
pub mod playground;
pub mod process;
pub mod store;
pub mod toolchain;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BuildConfig, ConfigLoader, JanitorConfig, PlaygroundConfig, SandpitConfig};
pub use environment::EnvironmentSpec;
pub use errors::{BuildError, ConfigError, RemoteError, StoreError};
pub use fingerprint::Fingerprint;
pub use janitor::{EvictionPolicy, Janitor, SweepReport, Ticker};
pub use orchestrator::{BuildOrchestrator, BuildRequest, BuildResult, StatsSnapshot};
pub use playground::{
    HttpPlaygroundClient, PlaygroundClient, PlaygroundServices, RemoteBackend, RemoteRunRequest,
    RemoteRunResponse,
};
pub use store::{ArtifactLease, ArtifactStore, Attachment, EntryState, Reservation};
pub use toolchain::{Toolchain, ToolchainRegistry};
