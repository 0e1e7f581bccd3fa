//! Remote execution queue
//!
//! Ships execution requests to a fleet of workers through a [`QueueBackend`]
//! and correlates their results back to the submitter. Delivery is
//! at-least-once, so the same correlation id can produce more than one
//! result: the first one resolves the submission and later ones are dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use crate::remote::backend::{BackendError, QueueBackend};
pub use crate::remote::memory::InMemoryQueue;
pub use crate::remote::message::{
    ArtifactRef, Delivery, ExecutionOutcome, ExecutionRequest, ExecutionResponse, ReceiptHandle,
};

use crate::config::RemoteConfig;
use crate::specialty::WorkerSpecialty;
use crate::types::{ExecutionParams, ExecutionResult};

mod backend;
mod memory;
mod message;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("no worker with specialty '{specialty}' picked up the request within {waited:?}")]
    NoWorkerAvailable {
        specialty: WorkerSpecialty,
        waited: Duration,
    },

    #[error("queue for specialty '{specialty}' is saturated ({depth} waiting, no live workers)")]
    QueueSaturated {
        specialty: WorkerSpecialty,
        depth: usize,
    },

    #[error("execution {correlation_id} did not finish in time")]
    ExecutionTimeout { correlation_id: String },

    #[error("execution request {correlation_id} expired before submission")]
    Expired { correlation_id: String },

    #[error("worker failed to execute {correlation_id}: {message}")]
    WorkerFailed {
        correlation_id: String,
        message: String,
    },

    #[error("execution request was cancelled")]
    Cancelled,

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl RemoteError {
    /// Whether the caller may reasonably try again later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::NoWorkerAvailable { .. }
                | RemoteError::QueueSaturated { .. }
                | RemoteError::ExecutionTimeout { .. }
                | RemoteError::Backend(_)
        )
    }
}

impl ExecutionResponse {
    /// Split a response into the executing worker and its result, failing on terminal outcomes
    pub fn into_result(self) -> Result<(String, ExecutionResult), RemoteError> {
        match self.outcome {
            ExecutionOutcome::Completed(result) => Ok((self.worker_id, result)),
            ExecutionOutcome::TimedOut { attempts } => {
                debug!(correlation_id = %self.correlation_id, attempts, "worker gave up on request");
                Err(RemoteError::ExecutionTimeout {
                    correlation_id: self.correlation_id,
                })
            }
            ExecutionOutcome::Failed { message } => Err(RemoteError::WorkerFailed {
                correlation_id: self.correlation_id,
                message,
            }),
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<ExecutionResponse>>>>;

/// Submitting side of the remote execution protocol
pub struct RemoteExecutionQueue {
    backend: Arc<dyn QueueBackend>,
    settings: RemoteConfig,
    pending: PendingMap,
    router: CancellationToken,
}

impl RemoteExecutionQueue {
    /// Create the queue and start routing results. Must be called inside a tokio runtime.
    pub fn new(backend: Arc<dyn QueueBackend>, settings: RemoteConfig) -> Self {
        let pending: PendingMap = Arc::default();
        let router = CancellationToken::new();
        tokio::spawn(route_results(backend.clone(), pending.clone(), router.clone()));
        Self {
            backend,
            settings,
            pending,
            router,
        }
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    pub fn settings(&self) -> &RemoteConfig {
        &self.settings
    }

    /// Build a request for `artifact` using the configured message TTL
    pub fn request(
        &self,
        artifact: ArtifactRef,
        specialty: WorkerSpecialty,
        params: ExecutionParams,
    ) -> ExecutionRequest {
        ExecutionRequest::new(artifact, specialty, params, self.settings.message_ttl())
    }

    /// Enqueue `request` and return a handle that resolves with its result.
    ///
    /// Fails fast when the specialty has no live workers and its queue is
    /// already at the configured ceiling.
    #[instrument(skip(self, request), fields(correlation_id = %request.correlation_id, specialty = %request.specialty))]
    pub async fn submit(&self, request: ExecutionRequest) -> Result<Submission, RemoteError> {
        if request.is_expired() {
            return Err(RemoteError::Expired {
                correlation_id: request.correlation_id,
            });
        }

        if self.backend.live_workers(&request.specialty).await? == 0 {
            let depth = self.backend.depth(&request.specialty).await?;
            if depth >= self.settings.max_depth_per_specialty {
                warn!(depth, "rejecting request, no live workers and queue is full");
                return Err(RemoteError::QueueSaturated {
                    specialty: request.specialty,
                    depth,
                });
            }
            debug!(depth, "no live workers for specialty, queueing anyway");
        }

        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(request.correlation_id.clone(), tx);

        if let Err(e) = self.backend.send(&request).await {
            self.lock_pending().remove(&request.correlation_id);
            return Err(e.into());
        }

        let wait = self.settings.max_wait().min(request.remaining());
        Ok(Submission {
            correlation_id: request.correlation_id,
            specialty: request.specialty,
            wait,
            rx,
            backend: self.backend.clone(),
            pending: self.pending.clone(),
            settled: false,
        })
    }

    /// Submit and wait, returning the executing worker's id and the program's result
    pub async fn execute(&self, request: ExecutionRequest) -> Result<(String, ExecutionResult), RemoteError> {
        self.submit(request).await?.wait().await?.into_result()
    }

    pub async fn depth(&self, specialty: &WorkerSpecialty) -> Result<usize, RemoteError> {
        Ok(self.backend.depth(specialty).await?)
    }

    pub async fn live_workers(&self, specialty: &WorkerSpecialty) -> Result<usize, RemoteError> {
        Ok(self.backend.live_workers(specialty).await?)
    }

    /// Submissions still waiting for a result
    pub fn in_flight(&self) -> usize {
        self.lock_pending().len()
    }

    pub fn shutdown(&self) {
        self.router.cancel();
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<ExecutionResponse>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for RemoteExecutionQueue {
    fn drop(&mut self) {
        self.router.cancel();
    }
}

/// Handle to one submitted request.
///
/// Dropping it before [`wait`](Submission::wait) or
/// [`cancel`](Submission::cancel) settles withdraws the request in the
/// background if no worker has claimed it yet.
pub struct Submission {
    correlation_id: String,
    specialty: WorkerSpecialty,
    wait: Duration,
    rx: oneshot::Receiver<ExecutionResponse>,
    backend: Arc<dyn QueueBackend>,
    pending: PendingMap,
    settled: bool,
}

impl Submission {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Wait for the first result.
    ///
    /// On timeout the request is withdrawn if no worker has claimed it yet
    /// ([`RemoteError::NoWorkerAvailable`]); a claimed request cannot be
    /// withdrawn and yields [`RemoteError::ExecutionTimeout`].
    pub async fn wait(mut self) -> Result<ExecutionResponse, RemoteError> {
        let received = tokio::time::timeout(self.wait, &mut self.rx).await;
        if received.is_ok() {
            self.settled = true;
        }
        match received {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RemoteError::Cancelled),
            Err(_) => {
                let withdrawn = self.backend.cancel(&self.correlation_id).await;
                self.settled = true;
                if withdrawn? {
                    warn!(correlation_id = %self.correlation_id, specialty = %self.specialty, "no worker claimed request");
                    Err(RemoteError::NoWorkerAvailable {
                        specialty: self.specialty.clone(),
                        waited: self.wait,
                    })
                } else {
                    warn!(correlation_id = %self.correlation_id, "claimed request did not finish in time");
                    Err(RemoteError::ExecutionTimeout {
                        correlation_id: self.correlation_id.clone(),
                    })
                }
            }
        }
    }

    /// Withdraw the request. Returns `false` if a worker has already claimed it.
    pub async fn cancel(mut self) -> Result<bool, RemoteError> {
        let withdrawn = self.backend.cancel(&self.correlation_id).await;
        self.settled = true;
        Ok(withdrawn?)
    }
}

impl Drop for Submission {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.correlation_id);

        if self.settled {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(correlation_id = %self.correlation_id, "no runtime to withdraw abandoned request");
            return;
        };
        let backend = self.backend.clone();
        let correlation_id = std::mem::take(&mut self.correlation_id);
        runtime.spawn(async move {
            match backend.cancel(&correlation_id).await {
                Ok(true) => debug!(%correlation_id, "withdrew abandoned request"),
                Ok(false) => debug!(%correlation_id, "abandoned request already claimed"),
                Err(e) => warn!(%correlation_id, error = %e, "failed to withdraw abandoned request"),
            }
        });
    }
}

/// Deliver each result to its waiting submission; results nobody waits for are dropped
async fn route_results(backend: Arc<dyn QueueBackend>, pending: PendingMap, token: CancellationToken) {
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = backend.next_result() => next,
        };

        match next {
            Ok(Some(response)) => {
                let waiter = pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&response.correlation_id);
                match waiter {
                    Some(tx) => {
                        let correlation_id = response.correlation_id.clone();
                        if tx.send(response).is_err() {
                            debug!(%correlation_id, "submitter gave up before result arrived");
                        }
                    }
                    None => debug!(
                        correlation_id = %response.correlation_id,
                        worker_id = %response.worker_id,
                        "discarding duplicate or late result"
                    ),
                }
            }
            Ok(None) => {
                info!("result channel closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "failed to read result, retrying");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
            }
        }
    }
}
