//! Configuration validation

use crate::config::types::*;
use crate::errors::ConfigError;

impl SandpitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.http.validate()?;
        self.build.validate()?;
        self.janitor.validate()?;
        self.playground.validate()?;
        Ok(())
    }
}

impl HttpConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_body_bytes == 0 {
            return Err(ConfigError::Invalid(
                "http.max_body_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl BuildConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.build_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "build.build_dir cannot be empty".to_string(),
            ));
        }
        if self.build_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "build.build_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent_builds == 0 {
            return Err(ConfigError::Invalid(
                "build.max_concurrent_builds must be greater than zero".to_string(),
            ));
        }
        if self.max_output_bytes == 0 || self.max_source_bytes == 0 || self.max_artifact_bytes == 0
        {
            return Err(ConfigError::Invalid(
                "build size limits must be greater than zero".to_string(),
            ));
        }
        if self.toolchains.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one toolchain must be configured".to_string(),
            ));
        }
        if !self.toolchains.contains_key(&self.default_toolchain) {
            return Err(ConfigError::Invalid(format!(
                "default toolchain '{}' is not configured",
                self.default_toolchain
            )));
        }
        for (name, toolchain) in &self.toolchains {
            toolchain.validate(name)?;
        }
        Ok(())
    }
}

impl ToolchainConfig {
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.program.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "toolchain '{}' has no program",
                name
            )));
        }
        for (field, file) in [
            ("source_file", &self.source_file),
            ("artifact_file", &self.artifact_file),
        ] {
            if !is_plain_file_name(file) {
                return Err(ConfigError::Invalid(format!(
                    "toolchain '{}': {} must be a plain file name, got '{}'",
                    name, field, file
                )));
            }
        }
        if self.source_file == self.artifact_file {
            return Err(ConfigError::Invalid(format!(
                "toolchain '{}': source_file and artifact_file must differ",
                name
            )));
        }
        Ok(())
    }
}

impl JanitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "janitor.interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl PlaygroundConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        // An empty URL disables that backend.
        for (field, url) in [("playground.url", &self.url), ("playground.tip_url", &self.tip_url)] {
            if !url.is_empty() && !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be an http(s) URL, got '{}'",
                    field, url
                )));
            }
        }
        Ok(())
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
}
