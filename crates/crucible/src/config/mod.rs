use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub use crate::config::compiler::CompilerCandidate;

pub mod compiler;
mod loader;

/// Example configuration embedded at compile time.
///
/// Library users can access this to generate a starter config file.
pub const EXAMPLE_CONFIG: &str = include_str!("../../crucible.example.toml");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("compiler '{0}' not found in configuration")]
    CompilerNotFound(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Config for Crucible
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Compiler discovery settings
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Local compilation queue settings
    #[serde(default)]
    pub queue: QueueConfig,

    /// Remote execution queue settings
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Execution worker settings
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Readiness thresholds
    #[serde(default)]
    pub health: HealthConfig,

    /// Local execution settings
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Compile result cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Candidate toolchains probed during discovery
    #[serde(default)]
    pub compilers: Vec<CompilerCandidate>,
}

impl Config {
    /// Create a config with the embedded example toolchains
    pub fn example() -> Result<Self, ConfigError> {
        Self::parse_toml(EXAMPLE_CONFIG)
    }

    /// Create an empty config with no candidate toolchains
    pub fn empty() -> Self {
        Self::default()
    }

    /// Get a candidate toolchain by ID (first one wins if IDs repeat)
    pub fn get_compiler(&self, id: &str) -> Result<&CompilerCandidate, ConfigError> {
        self.compilers
            .iter()
            .find(|candidate| candidate.id == id)
            .ok_or_else(|| ConfigError::CompilerNotFound(id.to_string()))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Fail discovery when two candidates resolve to the same ID
    pub strict_clash: bool,

    /// Maximum number of probe subprocesses running at once
    pub probe_concurrency: usize,

    /// Per-probe timeout in seconds
    pub probe_timeout: f64,

    /// Seconds between background rescans (disabled when unset or zero)
    pub rescan_interval: Option<f64>,
}

impl RegistryConfig {
    pub fn probe_timeout(&self) -> Duration {
        seconds(self.probe_timeout)
    }

    pub fn rescan_interval(&self) -> Option<Duration> {
        self.rescan_interval
            .map(seconds)
            .filter(|interval| !interval.is_zero())
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            strict_clash: false,
            probe_concurrency: 8,
            probe_timeout: 10.0,
            rescan_interval: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum concurrent compiler subprocesses (defaults to the host CPU count)
    pub max_concurrent: Option<usize>,

    /// Seconds a job may wait for a slot before it is shed
    pub queue_timeout: f64,

    /// Seconds a started compiler may run before it is killed
    pub kill_timeout: f64,
}

impl QueueConfig {
    pub fn concurrency(&self) -> usize {
        self.max_concurrent.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn queue_timeout(&self) -> Duration {
        seconds(self.queue_timeout)
    }

    pub fn kill_timeout(&self) -> Duration {
        seconds(self.kill_timeout)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: None,
            queue_timeout: 30.0,
            kill_timeout: 60.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Seconds a submitter waits for a result before giving up
    pub max_wait: f64,

    /// Seconds a claimed message stays hidden from other workers
    pub visibility_timeout: f64,

    /// Seconds an unclaimed message is kept before it is dropped
    pub message_ttl: f64,

    /// Depth at which submissions fail fast when no worker matches
    pub max_depth_per_specialty: usize,

    /// Deliveries after which a message is failed instead of executed
    pub max_receive_count: u32,
}

impl RemoteConfig {
    pub fn max_wait(&self) -> Duration {
        seconds(self.max_wait)
    }

    pub fn visibility_timeout(&self) -> Duration {
        seconds(self.visibility_timeout)
    }

    pub fn message_ttl(&self) -> Duration {
        seconds(self.message_ttl)
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            max_wait: 30.0,
            visibility_timeout: 30.0,
            message_ttl: 300.0,
            max_depth_per_specialty: 100,
            max_receive_count: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Run an execution worker on this host
    pub is_worker: bool,

    /// Tags added to the detected `os:`/`arch:` specialty
    pub extra_specialties: Vec<String>,

    /// Seconds to sleep after an empty poll
    pub poll_interval: f64,

    /// Seconds between specialty re-registrations
    pub heartbeat_interval: f64,

    /// Seconds a registration stays valid without a heartbeat
    pub registration_ttl: f64,
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        seconds(self.poll_interval)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        seconds(self.heartbeat_interval)
    }

    pub fn registration_ttl(&self) -> Duration {
        seconds(self.registration_ttl)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            is_worker: false,
            extra_specialties: Vec::new(),
            poll_interval: 0.5,
            heartbeat_interval: 30.0,
            registration_ttl: 90.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Queue depth at or above which the host reports not ready
    pub max_queue_depth: usize,

    /// File that must exist for the host to report ready
    pub health_check_file: Option<PathBuf>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: 64,
            health_check_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Execute on this host when its specialty matches
    pub local: bool,

    /// Isolation command prefixed to every execution (e.g. `["nsjail", "--"]`)
    pub wrapper: Vec<String>,

    /// Wall time limit in seconds for an executed program
    pub timeout: f64,

    /// Maximum captured bytes per output stream
    pub max_output: usize,

    /// Shared directory holding artifacts handed to remote workers
    pub artifact_dir: PathBuf,
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        seconds(self.timeout)
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            local: true,
            wrapper: Vec::new(),
            timeout: 10.0,
            max_output: 64 * 1024,
            artifact_dir: std::env::temp_dir().join("crucible-artifacts"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of compile results kept in memory (0 disables caching)
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

/// Longest duration any setting may ask for
pub(crate) const MAX_SECONDS: f64 = 365.0 * 24.0 * 60.0 * 60.0;

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.clamp(0.0, MAX_SECONDS)).unwrap_or_default()
}
