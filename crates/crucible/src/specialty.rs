//! Host capability tags used to route execution requests to workers.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A set of capability tags such as `os:linux` or `arch:aarch64`.
///
/// A specialty is not an identity: any number of workers may advertise the
/// same tags, and any of them may claim a request that requires them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerSpecialty(BTreeSet<String>);

impl WorkerSpecialty {
    pub fn new(tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(
            tags.into_iter()
                .map(Into::into)
                .map(|tag: String| tag.trim().to_owned())
                .filter(|tag| !tag.is_empty())
                .collect(),
        )
    }

    /// Tags describing the running host, plus any configured extras
    pub fn detect_host(extra: &[String]) -> Self {
        let mut tags = vec![
            format!("os:{}", std::env::consts::OS),
            format!("arch:{}", std::env::consts::ARCH),
        ];
        tags.extend(extra.iter().cloned());
        Self::new(tags)
    }

    /// Whether a host with these tags can serve a request requiring `required`
    pub fn satisfies(&self, required: &WorkerSpecialty) -> bool {
        required.0.is_subset(&self.0)
    }

    /// Stable routing key, independent of the order tags were given in
    pub fn key(&self) -> String {
        if self.0.is_empty() {
            "any".to_owned()
        } else {
            self.0.iter().cloned().collect::<Vec<_>>().join(",")
        }
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for WorkerSpecialty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}
