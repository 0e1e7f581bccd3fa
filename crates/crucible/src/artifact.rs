//! Shared directory of compiled binaries awaiting remote execution.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::remote::ArtifactRef;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("invalid artifact reference: {0}")]
    InvalidRef(String),

    #[error("artifact not found: {0}")]
    NotFound(ArtifactRef),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy a binary into the store under a fresh unique name
    #[instrument(skip(self))]
    pub async fn put(&self, binary: &Path) -> Result<ArtifactRef, ArtifactError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let artifact = ArtifactRef(Uuid::new_v4().simple().to_string());
        let target = self.root.join(&artifact.0);
        tokio::fs::copy(binary, &target).await?;
        debug!(%artifact, "stored artifact");
        Ok(artifact)
    }

    /// Path of a stored artifact. References that could escape the store are rejected.
    pub fn resolve(&self, artifact: &ArtifactRef) -> Result<PathBuf, ArtifactError> {
        let name = artifact.0.as_str();
        if name.is_empty() || name.contains("..") || name.contains('/') || name.contains('\\') {
            return Err(ArtifactError::InvalidRef(name.to_owned()));
        }
        let path = self.root.join(name);
        if !path.is_file() {
            return Err(ArtifactError::NotFound(artifact.clone()));
        }
        Ok(path)
    }

    /// Like [`put`](ArtifactStore::put), but the artifact is removed when the guard is dropped
    pub async fn put_guarded(&self, binary: &Path) -> Result<ArtifactGuard, ArtifactError> {
        let artifact = self.put(binary).await?;
        Ok(ArtifactGuard {
            store: self.clone(),
            artifact,
            armed: true,
        })
    }

    pub async fn remove(&self, artifact: &ArtifactRef) -> Result<(), ArtifactError> {
        let path = self.resolve(artifact)?;
        tokio::fs::remove_file(path).await?;
        debug!(%artifact, "removed artifact");
        Ok(())
    }
}

/// A stored artifact that is deleted however its owner finishes
#[derive(Debug)]
pub struct ArtifactGuard {
    store: ArtifactStore,
    artifact: ArtifactRef,
    armed: bool,
}

impl ArtifactGuard {
    pub fn artifact(&self) -> &ArtifactRef {
        &self.artifact
    }

    /// Remove the artifact now and report the outcome
    pub async fn remove(mut self) -> Result<(), ArtifactError> {
        let removed = self.store.remove(&self.artifact).await;
        self.armed = false;
        removed
    }
}

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let store = self.store.clone();
        let artifact = self.artifact.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = store.remove(&artifact).await {
                        warn!(%artifact, error = %e, "failed to remove abandoned artifact");
                    }
                });
            }
            Err(_) => {
                let removed = store
                    .resolve(&artifact)
                    .and_then(|path| std::fs::remove_file(path).map_err(ArtifactError::from));
                if let Err(e) = removed {
                    warn!(%artifact, error = %e, "failed to remove abandoned artifact");
                }
            }
        }
    }
}
