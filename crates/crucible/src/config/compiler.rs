use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::MAX_SECONDS;
use crate::discovery::CompilerKind;

/// A configured toolchain that discovery will try to probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilerCandidate {
    /// Identifier, expected to be unique and stable across restarts
    pub id: String,

    /// Human-readable name (derived from the probed version if unset)
    #[serde(default)]
    pub name: Option<String>,

    /// Language key (e.g., "c++", "rust")
    pub lang: String,

    /// Path to the compiler executable; bare names are resolved against PATH
    pub exe: PathBuf,

    /// Which family of command-line quirks applies
    #[serde(default)]
    pub kind: CompilerKind,

    /// Group used for ordering within a language
    #[serde(default)]
    pub group: Option<String>,

    /// Version override; when unset the probed version is used
    #[serde(default)]
    pub semver: Option<String>,

    /// Options always passed before user flags
    #[serde(default)]
    pub options: Vec<String>,

    /// Whether the produced binary may be executed
    #[serde(default = "default_true")]
    pub supports_execution: bool,

    /// Whether the compiler writes an executable to its output path
    /// (false for tools that only emit assembly or IR)
    #[serde(default = "default_true")]
    pub supports_binary: bool,

    /// Tags a host needs to execute this compiler's binaries
    #[serde(default)]
    pub specialty: Vec<String>,

    /// Probe timeout override in seconds
    #[serde(default)]
    pub probe_timeout: Option<f64>,
}

impl CompilerCandidate {
    pub fn new(id: impl Into<String>, lang: impl Into<String>, exe: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            name: None,
            lang: lang.into(),
            exe: exe.into(),
            kind: CompilerKind::default(),
            group: None,
            semver: None,
            options: Vec::new(),
            supports_execution: true,
            supports_binary: true,
            specialty: Vec::new(),
            probe_timeout: None,
        }
    }

    pub fn kind(mut self, kind: CompilerKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn specialty(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.specialty = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Effective probe timeout given the registry-wide default
    pub fn probe_timeout(&self, default: Duration) -> Duration {
        self.probe_timeout
            .and_then(|secs| Duration::try_from_secs_f64(secs.clamp(0.0, MAX_SECONDS)).ok())
            .unwrap_or(default)
    }
}

fn default_true() -> bool {
    true
}
