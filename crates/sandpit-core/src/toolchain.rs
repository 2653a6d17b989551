//! Toolchain registry and command construction
//!
//! A toolchain describes how to turn a source file in a scratch directory into
//! a single artifact file. The registry is built once from configuration and
//! validates request flags before anything is spawned.

use crate::config::{BuildConfig, ToolchainConfig};
use crate::errors::BuildError;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

const FLAGS_PLACEHOLDER: &str = "{flags}";

#[derive(Debug, Clone)]
pub struct Toolchain {
    name: String,
    config: ToolchainConfig,
}

/// Program, arguments and toolchain-specific environment for one build.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolchainCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Toolchain {
    pub fn new(name: impl Into<String>, config: ToolchainConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_file(&self) -> &str {
        &self.config.source_file
    }

    pub fn artifact_file(&self) -> &str {
        &self.config.artifact_file
    }

    fn accepts_flags(&self) -> bool {
        self.config.args.iter().any(|a| a == FLAGS_PLACEHOLDER)
    }

    pub fn validate_flags(&self, flags: &[String]) -> Result<(), BuildError> {
        if flags.is_empty() {
            return Ok(());
        }
        if !self.accepts_flags() {
            return Err(BuildError::rejected(format!(
                "toolchain '{}' does not accept build flags",
                self.name
            )));
        }
        if let Some(flag) = flags
            .iter()
            .find(|f| !self.config.allowed_flags.contains(f))
        {
            return Err(BuildError::rejected(format!(
                "flag '{}' is not allowed for toolchain '{}'",
                flag, self.name
            )));
        }
        Ok(())
    }

    /// Expands the argument template for a build in `workdir`.
    pub fn command(&self, workdir: &Path, flags: &[String]) -> ToolchainCommand {
        let workdir_str = workdir.display().to_string();
        let source = workdir.join(&self.config.source_file).display().to_string();
        let output = workdir.join(&self.config.artifact_file).display().to_string();

        let mut args = Vec::with_capacity(self.config.args.len() + flags.len());
        for arg in &self.config.args {
            if arg == FLAGS_PLACEHOLDER {
                args.extend(flags.iter().cloned());
                continue;
            }
            args.push(
                arg.replace("{source}", &source)
                    .replace("{output}", &output)
                    .replace("{workdir}", &workdir_str),
            );
        }

        let mut env: Vec<(String, String)> = self
            .config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.sort();

        ToolchainCommand {
            program: self.config.program.clone(),
            args,
            env,
        }
    }
}

/// Immutable set of configured toolchains.
#[derive(Debug, Clone)]
pub struct ToolchainRegistry {
    toolchains: Arc<BTreeMap<String, Arc<Toolchain>>>,
    default: String,
}

impl ToolchainRegistry {
    pub fn from_config(config: &BuildConfig) -> Self {
        let toolchains = config
            .toolchains
            .iter()
            .map(|(name, cfg)| (name.clone(), Arc::new(Toolchain::new(name, cfg.clone()))))
            .collect();
        Self {
            toolchains: Arc::new(toolchains),
            default: config.default_toolchain.clone(),
        }
    }

    /// Looks up `name`, or the default toolchain when `name` is empty.
    pub fn resolve(&self, name: &str) -> Result<Arc<Toolchain>, BuildError> {
        let name = if name.is_empty() { &self.default } else { name };
        self.toolchains
            .get(name)
            .cloned()
            .ok_or_else(|| BuildError::rejected(format!("unknown toolchain '{}'", name)))
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    pub fn names(&self) -> Vec<&str> {
        self.toolchains.keys().map(|k| k.as_str()).collect()
    }
}
