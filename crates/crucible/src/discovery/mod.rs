//! Compiler discovery
//!
//! The registry probes configured candidates, publishes the result as an
//! immutable [`DiscoverySnapshot`], and swaps in a new snapshot only when a
//! rescan found something different. Readers always see a complete snapshot.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use crate::discovery::info::{
    CompilerInfo, DiscoverySnapshot, PossibleArgument, compare_versions,
};
pub use crate::discovery::kind::CompilerKind;
pub use crate::discovery::probe::{probe_candidate, resolve_executable};

use crate::config::{CompilerCandidate, RegistryConfig};

mod info;
mod kind;
mod probe;

#[cfg(test)]
pub(crate) use crate::discovery::info::test_info;

/// Why a single candidate could not be used. Never fatal to a discovery pass.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("compiler executable not found: {0}")]
    NotFound(PathBuf),

    #[error("compiler is not executable: {0}")]
    NotExecutable(PathBuf),

    #[error("failed to run {exe}: {source}")]
    Spawn {
        exe: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("probe of {exe} timed out after {timeout:?}")]
    ProbeTimedOut { exe: PathBuf, timeout: Duration },

    #[error("probe of {exe} exited with {code:?}: {stderr}")]
    ProbeFailed {
        exe: PathBuf,
        code: Option<i32>,
        stderr: String,
    },
}

/// Failures of the registry as a whole
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("clashing compiler ids found: {}", .0.join(", "))]
    Clash(Vec<String>),

    #[error("no compilers found")]
    EmptySnapshot,

    #[error("unknown compiler '{id}' for language '{lang}'")]
    UnknownCompiler { lang: String, id: String },

    #[error("malformed discovery snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of the last completed rescan, shared with callers that joined it
#[derive(Debug, Default)]
struct RescanState {
    completed: u64,
    changed: Option<Arc<DiscoverySnapshot>>,
    failed: bool,
}

/// Registry of discovered compilers
pub struct CompilerRegistry {
    settings: RegistryConfig,
    candidates: ArcSwap<Vec<CompilerCandidate>>,
    current: ArcSwap<DiscoverySnapshot>,
    changes: watch::Sender<Arc<DiscoverySnapshot>>,
    rescan_state: Mutex<RescanState>,
    rescans_completed: AtomicU64,
}

impl CompilerRegistry {
    pub fn new(settings: RegistryConfig, candidates: Vec<CompilerCandidate>) -> Self {
        let empty = Arc::new(DiscoverySnapshot::default());
        let (changes, _) = watch::channel(empty.clone());
        Self {
            settings,
            candidates: ArcSwap::from_pointee(candidates),
            current: ArcSwap::new(empty),
            changes,
            rescan_state: Mutex::new(RescanState::default()),
            rescans_completed: AtomicU64::new(0),
        }
    }

    /// Probe `candidates` and build a snapshot without publishing it.
    ///
    /// Unusable candidates are logged and skipped. Clashing IDs keep the
    /// first-seen entry unless strict mode is on, in which case the pass fails.
    #[instrument(skip(self, candidates), fields(candidates = candidates.len()))]
    pub async fn discover(
        &self,
        candidates: &[CompilerCandidate],
    ) -> Result<DiscoverySnapshot, RegistryError> {
        let probed = self.probe_all(candidates).await;
        let snapshot = DiscoverySnapshot::from_compilers(probed);

        if snapshot.has_clash() {
            warn!(ids = ?snapshot.clashes(), "clashing compiler ids");
            if self.settings.strict_clash {
                return Err(RegistryError::Clash(snapshot.clashes().to_vec()));
            }
        }

        info!(compilers = snapshot.len(), "discovery complete");
        Ok(snapshot)
    }

    /// Run discovery over the configured candidates and publish the result.
    ///
    /// An empty result is fatal unless `allow_empty` is set (execution-only hosts).
    pub async fn initialize(&self, allow_empty: bool) -> Result<Arc<DiscoverySnapshot>, RegistryError> {
        let candidates = self.candidates.load_full();
        let snapshot = self.discover(&candidates).await?;
        if snapshot.is_empty() && !allow_empty {
            return Err(RegistryError::EmptySnapshot);
        }
        let snapshot = Arc::new(snapshot);
        self.publish(snapshot.clone());
        Ok(snapshot)
    }

    /// Publish a snapshot exported by an earlier discovery, skipping all probes
    pub fn load_prediscovered(&self, bytes: &[u8]) -> Result<Arc<DiscoverySnapshot>, RegistryError> {
        let snapshot = DiscoverySnapshot::from_json(bytes)?;
        if snapshot.is_empty() {
            return Err(RegistryError::EmptySnapshot);
        }
        if snapshot.has_clash() {
            warn!(ids = ?snapshot.clashes(), "clashing compiler ids in prediscovered snapshot");
            if self.settings.strict_clash {
                return Err(RegistryError::Clash(snapshot.clashes().to_vec()));
            }
        }

        info!(compilers = snapshot.len(), "loaded prediscovered compilers");
        let snapshot = Arc::new(snapshot);
        self.publish(snapshot.clone());
        Ok(snapshot)
    }

    pub async fn load_prediscovered_file(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<Arc<DiscoverySnapshot>, RegistryError> {
        let bytes = tokio::fs::read(path.as_ref()).await?;
        self.load_prediscovered(&bytes)
    }

    /// Serialize the current snapshot, including cached possible arguments
    pub fn export(&self) -> Result<Vec<u8>, RegistryError> {
        Ok(self.current.load().to_json()?)
    }

    pub async fn export_to_file(&self, path: impl AsRef<Path>) -> Result<(), RegistryError> {
        let bytes = self.export()?;
        tokio::fs::write(path.as_ref(), bytes).await?;
        Ok(())
    }

    /// Whether two distinct probed compilers resolve to the same ID
    pub fn detect_clash(compilers: &[CompilerInfo]) -> bool {
        compilers
            .iter()
            .enumerate()
            .any(|(i, info)| compilers[..i].iter().any(|earlier| earlier.id == info.id))
    }

    /// Re-run discovery and publish the result if it differs from the current snapshot.
    ///
    /// Returns `None` when nothing changed. Concurrent callers share the
    /// outcome of the rescan already in flight instead of starting another.
    pub async fn rescan(&self) -> Result<Option<Arc<DiscoverySnapshot>>, RegistryError> {
        let observed = self.rescans_completed.load(Ordering::Acquire);
        let mut state = self.rescan_state.lock().await;

        if state.completed > observed && !state.failed {
            debug!("joined in-flight rescan");
            return Ok(state.changed.clone());
        }

        let candidates = self.candidates.load_full();
        let outcome = self.discover(&candidates).await;

        state.completed += 1;
        self.rescans_completed.store(state.completed, Ordering::Release);

        match outcome {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                let changed = self.publish(snapshot.clone()).then_some(snapshot);
                state.changed = changed.clone();
                state.failed = false;
                Ok(changed)
            }
            Err(e) => {
                state.changed = None;
                state.failed = true;
                Err(e)
            }
        }
    }

    /// Replace the candidate list used by future rescans
    pub fn set_candidates(&self, candidates: Vec<CompilerCandidate>) {
        self.candidates.store(Arc::new(candidates));
    }

    /// O(1) lookup in the current snapshot
    pub fn find_compiler(&self, lang: &str, id: &str) -> Option<Arc<CompilerInfo>> {
        self.current.load().find(lang, id).cloned()
    }

    pub fn snapshot(&self) -> Arc<DiscoverySnapshot> {
        self.current.load_full()
    }

    /// Receive a notification each time a rescan publishes a changed snapshot
    pub fn subscribe(&self) -> watch::Receiver<Arc<DiscoverySnapshot>> {
        self.changes.subscribe()
    }

    /// Rescan every `interval` until `token` is cancelled. Failures are logged and retried.
    ///
    /// A zero interval disables rescans and the task exits at once.
    pub fn spawn_rescan_loop(
        self: Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            if interval.is_zero() {
                warn!("rescan interval is zero, periodic rescans disabled");
                return;
            }
            info!(?interval, "rescanning compilers periodically");
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match self.rescan().await {
                    Ok(Some(snapshot)) => info!(compilers = snapshot.len(), "compiler set changed"),
                    Ok(None) => debug!("compiler set unchanged"),
                    Err(e) => warn!(error = %e, "rescan failed, keeping previous compilers"),
                }
            }
        })
    }

    /// Swap in `snapshot` if it differs from the current one; returns whether it did
    fn publish(&self, snapshot: Arc<DiscoverySnapshot>) -> bool {
        if *self.current.load_full() == *snapshot {
            return false;
        }
        self.current.store(snapshot.clone());
        self.changes.send_replace(snapshot);
        true
    }

    /// Probe all candidates with bounded concurrency, preserving candidate order
    async fn probe_all(&self, candidates: &[CompilerCandidate]) -> Vec<CompilerInfo> {
        let slots = Arc::new(Semaphore::new(self.settings.probe_concurrency.max(1)));
        let timeout = self.settings.probe_timeout();
        let mut probes = JoinSet::new();

        for (index, candidate) in candidates.iter().cloned().enumerate() {
            let slots = slots.clone();
            probes.spawn(async move {
                let _permit = slots.acquire_owned().await.ok();
                (index, candidate.id.clone(), probe_candidate(&candidate, timeout).await)
            });
        }

        let mut found: Vec<Option<CompilerInfo>> = vec![None; candidates.len()];
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((index, _, Ok(info))) => found[index] = Some(info),
                Ok((_, id, Err(e))) => warn!(%id, error = %e, "skipping compiler"),
                Err(e) => warn!(error = %e, "probe task failed"),
            }
        }

        found.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(strict: bool) -> CompilerRegistry {
        let settings = RegistryConfig {
            strict_clash: strict,
            ..Default::default()
        };
        CompilerRegistry::new(settings, Vec::new())
    }

    fn snapshot_bytes(compilers: &[CompilerInfo]) -> Vec<u8> {
        serde_json::to_vec(compilers).unwrap()
    }

    #[test]
    fn detect_clash_on_shared_id() {
        let mut other = test_info("gcc-12", "c++");
        other.exe = PathBuf::from("/opt/gcc/bin/g++");
        assert!(CompilerRegistry::detect_clash(&[test_info("gcc-12", "c++"), other]));
        assert!(!CompilerRegistry::detect_clash(&[
            test_info("gcc-12", "c++"),
            test_info("gcc-13", "c++"),
        ]));
    }

    #[test]
    fn strict_mode_rejects_clashing_snapshot() {
        let bytes = snapshot_bytes(&[test_info("gcc-12", "c++"), test_info("gcc-12", "c++")]);
        let result = registry(true).load_prediscovered(&bytes);
        match result {
            Err(RegistryError::Clash(ids)) => assert_eq!(ids, vec!["gcc-12"]),
            other => panic!("expected Clash, got {other:?}"),
        }
    }

    #[test]
    fn permissive_mode_keeps_one_entry() {
        let bytes = snapshot_bytes(&[test_info("gcc-12", "c++"), test_info("gcc-12", "c++")]);
        let registry = registry(false);
        let snapshot = registry.load_prediscovered(&bytes).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(registry.find_compiler("c++", "gcc-12").is_some());
    }

    #[test]
    fn empty_prediscovered_snapshot_rejected() {
        let result = registry(false).load_prediscovered(b"[]");
        assert!(matches!(result, Err(RegistryError::EmptySnapshot)));
    }

    #[test]
    fn malformed_prediscovered_snapshot_rejected() {
        let result = registry(false).load_prediscovered(b"{not json");
        assert!(matches!(result, Err(RegistryError::Snapshot(_))));
    }

    #[test]
    fn export_round_trips_through_prediscovered() {
        let source = registry(false);
        source
            .load_prediscovered(&snapshot_bytes(&[test_info("gcc-12", "c++"), test_info("rustc", "rust")]))
            .unwrap();
        let exported = source.export().unwrap();

        let target = registry(false);
        let loaded = target.load_prediscovered(&exported).unwrap();
        assert_eq!(*loaded, *source.snapshot());
    }

    #[test]
    fn publish_notifies_only_on_change() {
        let registry = registry(false);
        let mut changes = registry.subscribe();
        let bytes = snapshot_bytes(&[test_info("gcc-12", "c++")]);

        registry.load_prediscovered(&bytes).unwrap();
        assert!(changes.has_changed().unwrap());
        changes.borrow_and_update();

        registry.load_prediscovered(&bytes).unwrap();
        assert!(!changes.has_changed().unwrap());
    }

    #[tokio::test]
    async fn discover_skips_missing_candidates() {
        let registry = registry(false);
        let candidates = vec![CompilerCandidate::new("ghost", "c++", "/nonexistent/g++")];
        let snapshot = registry.discover(&candidates).await.unwrap();
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn initialize_fails_on_empty_discovery() {
        let registry = CompilerRegistry::new(
            RegistryConfig::default(),
            vec![CompilerCandidate::new("ghost", "c++", "/nonexistent/g++")],
        );
        assert!(matches!(
            registry.initialize(false).await,
            Err(RegistryError::EmptySnapshot)
        ));
        assert!(registry.initialize(true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_rescan_interval_exits_cleanly() {
        let registry = Arc::new(registry(false));
        let task = registry.spawn_rescan_loop(Duration::ZERO, CancellationToken::new());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn rescan_of_unchanged_candidates_reports_nothing() {
        let registry = CompilerRegistry::new(
            RegistryConfig::default(),
            vec![CompilerCandidate::new("ghost", "c++", "/nonexistent/g++")],
        );
        registry.initialize(true).await.unwrap();
        assert!(registry.rescan().await.unwrap().is_none());
    }
}
