use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::discovery::CompilerKind;
use crate::specialty::WorkerSpecialty;

/// One option a compiler reported in its help output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PossibleArgument {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// A probed, validated compiler. Never mutated after it is published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerInfo {
    pub id: String,
    pub name: String,
    pub lang: String,
    pub exe: PathBuf,
    pub kind: CompilerKind,

    #[serde(default)]
    pub group: Option<String>,

    #[serde(default)]
    pub semver: Option<String>,

    /// Options always passed before user flags
    #[serde(default)]
    pub options: Vec<String>,

    /// Whether the produced binary may be executed
    pub supports_execution: bool,

    /// Whether the compiler writes an executable artifact
    pub supports_binary: bool,

    /// Tags a host needs to execute this compiler's binaries
    #[serde(default)]
    pub specialty: WorkerSpecialty,

    /// Cached result of help introspection
    #[serde(default, rename = "cachedPossibleArguments")]
    pub possible_arguments: Vec<PossibleArgument>,
}

/// One immutable view of every discovered compiler.
///
/// Equality compares the compiler list only, so two passes that probed
/// identical toolchains compare equal even if they ran at different times.
#[derive(Debug, Clone, Default)]
pub struct DiscoverySnapshot {
    compilers: Vec<Arc<CompilerInfo>>,
    by_id: HashMap<String, usize>,
    clashes: Vec<String>,
}

impl DiscoverySnapshot {
    /// Build a snapshot, keeping the first compiler seen for each ID
    pub fn from_compilers(compilers: impl IntoIterator<Item = CompilerInfo>) -> Self {
        let mut snapshot = Self::default();
        for info in compilers {
            if snapshot.by_id.contains_key(&info.id) {
                if !snapshot.clashes.contains(&info.id) {
                    snapshot.clashes.push(info.id.clone());
                }
                continue;
            }
            snapshot
                .by_id
                .insert(info.id.clone(), snapshot.compilers.len());
            snapshot.compilers.push(Arc::new(info));
        }
        snapshot
    }

    /// Decode a snapshot written by [`to_json`](Self::to_json)
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let compilers: Vec<CompilerInfo> = serde_json::from_slice(bytes)?;
        Ok(Self::from_compilers(compilers))
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        let compilers: Vec<&CompilerInfo> = self.compilers.iter().map(Arc::as_ref).collect();
        serde_json::to_vec_pretty(&compilers)
    }

    pub fn find(&self, lang: &str, id: &str) -> Option<&Arc<CompilerInfo>> {
        self.by_id
            .get(id)
            .map(|&index| &self.compilers[index])
            .filter(|info| info.lang == lang)
    }

    pub fn compilers(&self) -> &[Arc<CompilerInfo>] {
        &self.compilers
    }

    /// Compilers for one language, newest version first within each group
    pub fn for_language(&self, lang: &str) -> Vec<Arc<CompilerInfo>> {
        let mut matching: Vec<_> = self
            .compilers
            .iter()
            .filter(|info| info.lang == lang)
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            a.group.cmp(&b.group).then_with(|| {
                compare_versions(
                    b.semver.as_deref().unwrap_or(""),
                    a.semver.as_deref().unwrap_or(""),
                )
            })
        });
        matching
    }

    /// IDs that more than one candidate resolved to
    pub fn clashes(&self) -> &[String] {
        &self.clashes
    }

    pub fn has_clash(&self) -> bool {
        !self.clashes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.compilers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compilers.is_empty()
    }
}

impl PartialEq for DiscoverySnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.compilers == other.compilers
    }
}

impl Eq for DiscoverySnapshot {}

/// Compare dotted versions numerically (`12.10` > `12.9`); non-numeric parts compare as text
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(x), Some(y)) => {
                let ordering = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    _ => x.cmp(y),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn test_info(id: &str, lang: &str) -> CompilerInfo {
    CompilerInfo {
        id: id.to_owned(),
        name: id.to_owned(),
        lang: lang.to_owned(),
        exe: PathBuf::from(format!("/usr/bin/{id}")),
        kind: CompilerKind::Gcc,
        group: None,
        semver: None,
        options: Vec::new(),
        supports_execution: true,
        supports_binary: true,
        specialty: WorkerSpecialty::default(),
        possible_arguments: Vec::new(),
    }
}
