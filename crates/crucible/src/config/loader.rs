//! Configuration file loading for Crucible
//!
//! Handles loading and parsing configuration files using the config crate.

use std::path::Path;

use config::{Config as ConfigBuilder, File, FileFormat};

use crate::config::{Config, ConfigError, MAX_SECONDS};

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = ConfigBuilder::builder()
            .add_source(File::from(path))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for candidate in &self.compilers {
            let id = &candidate.id;
            if id.is_empty() {
                return Err(ConfigError::Invalid("compiler with empty id".to_owned()));
            }
            if candidate.lang.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "compiler '{id}' has empty lang"
                )));
            }
            if candidate.exe.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "compiler '{id}' has empty exe"
                )));
            }
            if let Some(timeout) = candidate
                .probe_timeout
                .filter(|timeout| !(0.0..=MAX_SECONDS).contains(timeout))
            {
                return Err(ConfigError::Invalid(format!(
                    "compiler '{id}' has out of range probe_timeout {timeout}"
                )));
            }
        }

        let durations = [
            ("registry.probe_timeout", Some(self.registry.probe_timeout)),
            ("registry.rescan_interval", self.registry.rescan_interval),
            ("queue.queue_timeout", Some(self.queue.queue_timeout)),
            ("queue.kill_timeout", Some(self.queue.kill_timeout)),
            ("remote.max_wait", Some(self.remote.max_wait)),
            ("remote.visibility_timeout", Some(self.remote.visibility_timeout)),
            ("remote.message_ttl", Some(self.remote.message_ttl)),
            ("worker.poll_interval", Some(self.worker.poll_interval)),
            ("worker.heartbeat_interval", Some(self.worker.heartbeat_interval)),
            ("worker.registration_ttl", Some(self.worker.registration_ttl)),
            ("execution.timeout", Some(self.execution.timeout)),
        ];
        for (name, value) in durations {
            if let Some(value) = value.filter(|value| !(0.0..=MAX_SECONDS).contains(value)) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be between 0 and {MAX_SECONDS} seconds, got {value}"
                )));
            }
        }

        if self.queue.max_concurrent == Some(0) {
            return Err(ConfigError::Invalid(
                "queue.max_concurrent must be at least 1".to_owned(),
            ));
        }
        if self.registry.probe_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "registry.probe_concurrency must be at least 1".to_owned(),
            ));
        }
        if self.remote.visibility_timeout <= 0.0 {
            return Err(ConfigError::Invalid(
                "remote.visibility_timeout must be positive".to_owned(),
            ));
        }
        if self.queue.kill_timeout <= 0.0 {
            return Err(ConfigError::Invalid(
                "queue.kill_timeout must be positive".to_owned(),
            ));
        }
        if self.worker.is_worker && self.worker.heartbeat_interval >= self.worker.registration_ttl {
            return Err(ConfigError::Invalid(
                "worker.heartbeat_interval must be shorter than worker.registration_ttl"
                    .to_owned(),
            ));
        }

        Ok(())
    }
}
