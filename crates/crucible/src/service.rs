//! Compile-and-optionally-execute entry point
//!
//! Resolves the compiler, runs the job through the compilation queue, then
//! executes the binary either locally or on a remote worker depending on
//! whether this host has the compiler's required specialty. Mistakes in user
//! code always come back as a normal [`CompileResponse`]; only infrastructure
//! problems become a [`ServiceError`].

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::artifact::{ArtifactError, ArtifactStore};
use crate::compile::{CompilationJob, CompilationQueue, CompileCache, CompileError, CompileResult, QueueError};
use crate::config::Config;
use crate::discovery::{CompilerInfo, CompilerRegistry, RegistryError};
use crate::remote::{RemoteError, RemoteExecutionQueue};
use crate::specialty::WorkerSpecialty;
use crate::types::{ExecutionParams, ExecutionResult};
use crate::worker::{ExecuteError, Executor};

/// Who ran a binary that executed on this host
pub const LOCAL_EXECUTOR: &str = "local";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileRequest {
    pub lang: String,
    pub compiler_id: String,
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
    /// Run the produced binary with these parameters
    #[serde(default)]
    pub execute: Option<ExecutionParams>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileResponse {
    pub compiler: String,
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    pub cached: bool,
    pub timing: Timing,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionReport>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Timing {
    pub compile_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_ms: Option<u64>,
    pub total_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    /// [`LOCAL_EXECUTOR`] or the id of the remote worker
    pub executed_by: String,
    #[serde(flatten)]
    pub result: ExecutionResult,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("compiler '{0}' does not support execution")]
    ExecutionUnsupported(String),

    #[error(transparent)]
    Queue(QueueError),

    #[error(transparent)]
    Compile(CompileError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Execute(#[from] ExecuteError),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl From<CompileError> for ServiceError {
    fn from(error: CompileError) -> Self {
        match error {
            CompileError::Queue(error) => ServiceError::Queue(error),
            other => ServiceError::Compile(other),
        }
    }
}

/// Structured failure returned across the service boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureResponse {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

impl ServiceError {
    /// Stable machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Registry(RegistryError::UnknownCompiler { .. }) => "unknown_compiler",
            ServiceError::Registry(_) => "registry_error",
            ServiceError::ExecutionUnsupported(_) => "execution_unsupported",
            ServiceError::Queue(QueueError::Timeout { .. }) => "queue_timeout",
            ServiceError::Queue(QueueError::Closed) => "shutting_down",
            ServiceError::Compile(_) => "compile_error",
            ServiceError::Artifact(_) | ServiceError::Execute(_) => "execution_error",
            ServiceError::Remote(RemoteError::NoWorkerAvailable { .. }) => "no_worker_available",
            ServiceError::Remote(RemoteError::QueueSaturated { .. }) => "queue_saturated",
            ServiceError::Remote(RemoteError::ExecutionTimeout { .. }) => "execution_timeout",
            ServiceError::Remote(_) => "remote_error",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Queue(QueueError::Timeout { .. }) => true,
            ServiceError::Remote(error) => error.is_retryable(),
            _ => false,
        }
    }

    pub fn to_failure(&self) -> FailureResponse {
        FailureResponse {
            kind: self.kind().to_owned(),
            message: self.to_string(),
            retryable: self.is_retryable(),
        }
    }
}

pub struct CompilationService {
    registry: Arc<CompilerRegistry>,
    queue: Arc<CompilationQueue>,
    cache: CompileCache,
    executor: Arc<dyn Executor>,
    artifacts: ArtifactStore,
    remote: Option<Arc<RemoteExecutionQueue>>,
    host: WorkerSpecialty,
    local_execution: bool,
}

impl CompilationService {
    pub fn new(
        registry: Arc<CompilerRegistry>,
        queue: Arc<CompilationQueue>,
        executor: Arc<dyn Executor>,
        config: &Config,
    ) -> Self {
        Self {
            registry,
            queue,
            cache: CompileCache::new(config.cache.capacity),
            executor,
            artifacts: ArtifactStore::new(&config.execution.artifact_dir),
            remote: None,
            host: WorkerSpecialty::detect_host(&config.worker.extra_specialties),
            local_execution: config.execution.local,
        }
    }

    /// Offload executions this host cannot run to `remote`
    pub fn with_remote(mut self, remote: Arc<RemoteExecutionQueue>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn host_specialty(&self) -> &WorkerSpecialty {
        &self.host
    }

    pub fn queue(&self) -> &Arc<CompilationQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<CompilerRegistry> {
        &self.registry
    }

    /// Whether binaries needing `required` would run on this host
    pub fn executes_locally(&self, required: &WorkerSpecialty) -> bool {
        self.local_execution && self.host.satisfies(required)
    }

    #[instrument(skip(self, request), fields(lang = %request.lang, compiler = %request.compiler_id))]
    pub async fn handle(&self, request: CompileRequest) -> Result<CompileResponse, ServiceError> {
        let started = Instant::now();
        let compiler = self
            .registry
            .find_compiler(&request.lang, &request.compiler_id)
            .ok_or_else(|| RegistryError::UnknownCompiler {
                lang: request.lang.clone(),
                id: request.compiler_id.clone(),
            })?;

        if request.execute.is_some() && !(compiler.supports_execution && compiler.supports_binary) {
            return Err(ServiceError::ExecutionUnsupported(compiler.id.clone()));
        }

        let job = CompilationJob::new(compiler.clone(), request.source, request.options);

        let Some(params) = request.execute else {
            if let Some(result) = self.cache.get(&job.cache_key) {
                debug!("compile cache hit");
                return Ok(response(&compiler, result, true, None, started, None));
            }
            let result = match self.queue.enqueue(&job).await {
                Ok(output) => output.result,
                Err(e) => e.into_result()?,
            };
            self.cache.insert(job.cache_key.clone(), result.clone());
            return Ok(response(&compiler, result, false, None, started, None));
        };

        let output = match self.queue.enqueue(&job).await {
            Ok(output) => output,
            Err(e) => {
                let result = e.into_result()?;
                return Ok(response(&compiler, result, false, None, started, None));
            }
        };

        let Some(binary) = output.artifact_path() else {
            debug!(code = output.result.code, "nothing to execute");
            return Ok(response(&compiler, output.result.clone(), false, None, started, None));
        };

        let execution_started = Instant::now();
        let report = if self.executes_locally(&compiler.specialty) {
            ExecutionReport {
                executed_by: LOCAL_EXECUTOR.to_owned(),
                result: self.execute_locally(binary, &params).await?,
            }
        } else {
            self.execute_remotely(&compiler, binary, params).await?
        };
        let execution_ms = execution_started.elapsed().as_millis() as u64;

        Ok(response(
            &compiler,
            output.result.clone(),
            false,
            Some(report),
            started,
            Some(execution_ms),
        ))
    }

    /// Run a binary on this host, sharing the queue's slots with compiler subprocesses
    async fn execute_locally(
        &self,
        binary: &Path,
        params: &ExecutionParams,
    ) -> Result<ExecutionResult, ServiceError> {
        let result = self
            .queue
            .run(None, || self.executor.execute(binary, params))
            .await
            .map_err(ServiceError::Queue)?;
        Ok(result?)
    }

    async fn execute_remotely(
        &self,
        compiler: &CompilerInfo,
        binary: &Path,
        params: ExecutionParams,
    ) -> Result<ExecutionReport, ServiceError> {
        let Some(remote) = &self.remote else {
            return Err(RemoteError::NoWorkerAvailable {
                specialty: compiler.specialty.clone(),
                waited: Duration::ZERO,
            }
            .into());
        };

        let guard = self.artifacts.put_guarded(binary).await?;
        let artifact = guard.artifact().clone();
        let request = remote.request(artifact.clone(), compiler.specialty.clone(), params);
        debug!(correlation_id = %request.correlation_id, specialty = %compiler.specialty, "offloading execution");

        let outcome = remote.execute(request).await;
        if let Err(e) = guard.remove().await {
            warn!(%artifact, error = %e, "failed to remove artifact");
        }

        let (worker_id, result) = outcome?;
        Ok(ExecutionReport {
            executed_by: worker_id,
            result,
        })
    }

    /// Drop cached results whenever a rescan publishes a different compiler set
    pub fn spawn_cache_invalidation(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let mut changes = self.registry.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        info!(compilers = changes.borrow_and_update().len(), "compiler set changed, clearing compile cache");
                        service.cache.clear();
                    }
                }
            }
        })
    }
}

fn response(
    compiler: &CompilerInfo,
    result: CompileResult,
    cached: bool,
    execution: Option<ExecutionReport>,
    started: Instant,
    execution_ms: Option<u64>,
) -> CompileResponse {
    CompileResponse {
        compiler: compiler.id.clone(),
        code: result.code,
        stdout: result.stdout,
        stderr: result.stderr,
        cached,
        timing: Timing {
            compile_ms: result.duration_ms,
            execution_ms,
            total_ms: started.elapsed().as_millis() as u64,
        },
        execution,
    }
}
