//! Configuration for the build server
//!
//! A single [`SandpitConfig`] is loaded once at startup (YAML file plus command
//! line overrides) and handed by reference to each component's constructor.

pub mod loader;
pub mod types;
pub mod validation;

pub use loader::*;
pub use types::*;
