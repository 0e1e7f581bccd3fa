//! Execution worker
//!
//! A long-lived loop that advertises this host's specialty, claims matching
//! requests, runs them and posts results:
//!
//! ```text
//! Idle -> Polling -> Claimed -> Executing -> Acknowledging -> Idle
//!                                   |
//!                                   +-- deadline passed --> Idle (abandoned)
//! ```
//!
//! While executing, the worker keeps extending the message's visibility so a
//! long but healthy job is not redelivered. Once the request deadline passes
//! the worker stops extending, but the program is left to finish; only the
//! executor's wall-time limit kills it. The late result is dropped and the
//! message deleted.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub use crate::worker::executor::{ExecuteError, Executor, ProcessExecutor};

use crate::artifact::ArtifactStore;
use crate::config::{RemoteConfig, WorkerConfig};
use crate::remote::{BackendError, Delivery, ExecutionOutcome, ExecutionResponse, QueueBackend};
use crate::specialty::WorkerSpecialty;
use crate::types::ExecutionResult;

mod executor;

/// How the claim on a message stood when its program finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lease {
    Held,
    Lost,
    Expired,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to register worker: {0}")]
    Registration(#[source] BackendError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Polling = 1,
    Claimed = 2,
    Executing = 3,
    Acknowledging = 4,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerState::Polling,
            2 => WorkerState::Claimed,
            3 => WorkerState::Executing,
            4 => WorkerState::Acknowledging,
            _ => WorkerState::Idle,
        }
    }
}

/// Live view of a worker, shared with the health check
#[derive(Debug)]
pub struct WorkerStatus {
    state: AtomicU8,
    registered: AtomicBool,
    last_poll: Mutex<Option<Instant>>,
    processed: AtomicU64,
    abandoned: AtomicU64,
}

impl WorkerStatus {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(WorkerState::Idle as u8),
            registered: AtomicBool::new(false),
            last_poll: Mutex::new(None),
            processed: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Time since the worker last asked the queue for work
    pub fn last_poll_age(&self) -> Option<Duration> {
        let last_poll = *self.last_poll.lock().unwrap_or_else(PoisonError::into_inner);
        last_poll.map(|at| at.elapsed())
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn mark_polled(&self) {
        *self.last_poll.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }
}

pub struct ExecutionWorker {
    id: String,
    specialty: WorkerSpecialty,
    backend: Arc<dyn QueueBackend>,
    executor: Arc<dyn Executor>,
    artifacts: ArtifactStore,
    settings: WorkerConfig,
    visibility: Duration,
    max_receive_count: u32,
    status: Arc<WorkerStatus>,
}

impl ExecutionWorker {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        executor: Arc<dyn Executor>,
        artifacts: ArtifactStore,
        settings: WorkerConfig,
        remote: &RemoteConfig,
    ) -> Self {
        let specialty = WorkerSpecialty::detect_host(&settings.extra_specialties);
        Self {
            id: format!("worker-{}", Uuid::new_v4().simple()),
            specialty,
            backend,
            executor,
            artifacts,
            settings,
            visibility: remote.visibility_timeout(),
            max_receive_count: remote.max_receive_count,
            status: Arc::new(WorkerStatus::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn specialty(&self) -> &WorkerSpecialty {
        &self.specialty
    }

    pub fn status(&self) -> Arc<WorkerStatus> {
        self.status.clone()
    }

    /// Register, then poll until `token` is cancelled. Only the first registration is fatal.
    #[instrument(skip(self, token), fields(worker_id = %self.id, specialty = %self.specialty))]
    pub async fn run(&self, token: CancellationToken) -> Result<(), WorkerError> {
        self.register().await.map_err(WorkerError::Registration)?;
        info!("worker registered");

        let heartbeat = self.settings.heartbeat_interval();
        let mut next_heartbeat = Instant::now() + heartbeat;

        while !token.is_cancelled() {
            if Instant::now() >= next_heartbeat {
                if let Err(e) = self.register().await {
                    warn!(error = %e, "failed to refresh worker registration");
                }
                next_heartbeat = Instant::now() + heartbeat;
            }

            let idle = match self.poll_once().await {
                Ok(handled) => !handled,
                Err(e) => {
                    warn!(error = %e, "poll failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.poll_interval()) => {}
                }
            }
        }

        self.status.set_state(WorkerState::Idle);
        self.status.registered.store(false, Ordering::Release);
        if let Err(e) = self.backend.deregister_worker(&self.id).await {
            warn!(error = %e, "failed to deregister worker");
        }
        info!("worker stopped");
        Ok(())
    }

    /// Claim and handle at most one message. Returns whether a message was claimed.
    pub async fn poll_once(&self) -> Result<bool, WorkerError> {
        self.status.set_state(WorkerState::Polling);
        self.status.mark_polled();

        let delivery = match self.backend.receive(&self.specialty, self.visibility).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                self.status.set_state(WorkerState::Idle);
                return Ok(false);
            }
            Err(e) => {
                self.status.set_state(WorkerState::Idle);
                return Err(e.into());
            }
        };

        self.status.set_state(WorkerState::Claimed);
        let handled = self.handle(delivery).await;
        self.status.set_state(WorkerState::Idle);
        handled.map(|()| true)
    }

    #[instrument(skip(self, delivery), fields(correlation_id = %delivery.request.correlation_id, receive_count = delivery.receive_count))]
    async fn handle(&self, delivery: Delivery) -> Result<(), WorkerError> {
        let request = &delivery.request;

        if delivery.receive_count > self.max_receive_count {
            warn!("delivered too many times, giving up");
            let attempts = delivery.receive_count - 1;
            return self
                .finish(&delivery, ExecutionOutcome::TimedOut { attempts })
                .await;
        }

        if request.is_expired() {
            debug!("dropping expired request");
            self.backend.ack(&delivery.handle).await?;
            return Ok(());
        }

        let binary = match self.artifacts.resolve(&request.artifact) {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "cannot resolve artifact");
                let outcome = ExecutionOutcome::Failed {
                    message: e.to_string(),
                };
                return self.finish(&delivery, outcome).await;
            }
        };

        self.status.set_state(WorkerState::Executing);
        let (result, lease) = self.execute_with_lease(&delivery, &binary).await;
        if lease == Lease::Expired {
            self.status.abandoned.fetch_add(1, Ordering::Relaxed);
            warn!("request expired while executing, dropping result");
            if !self.backend.ack(&delivery.handle).await? {
                debug!("claim lapsed before the expired request was deleted");
            }
            return Ok(());
        }

        let outcome = match result {
            Ok(result) => ExecutionOutcome::Completed(result),
            Err(e) => ExecutionOutcome::Failed {
                message: e.to_string(),
            },
        };
        self.finish(&delivery, outcome).await
    }

    /// Execute to completion, extending the claim until the deadline passes or the claim is lost
    async fn execute_with_lease(
        &self,
        delivery: &Delivery,
        binary: &Path,
    ) -> (Result<ExecutionResult, ExecuteError>, Lease) {
        let execution = self.executor.execute(binary, &delivery.request.params);
        tokio::pin!(execution);

        let deadline = tokio::time::sleep(delivery.request.remaining());
        tokio::pin!(deadline);

        let period = (self.visibility / 2).max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        let mut lease = Lease::Held;

        loop {
            tokio::select! {
                result = &mut execution => return (result, lease),
                _ = &mut deadline, if lease == Lease::Held => {
                    warn!("deadline passed while executing, no longer extending the claim");
                    lease = Lease::Expired;
                }
                _ = ticker.tick(), if lease == Lease::Held => {
                    match self.backend.extend_visibility(&delivery.handle, self.visibility).await {
                        Ok(true) => debug!("extended visibility"),
                        Ok(false) => {
                            warn!("claim lost while executing, a duplicate result may follow");
                            lease = Lease::Lost;
                        }
                        Err(e) => warn!(error = %e, "failed to extend visibility"),
                    }
                }
            }
        }
    }

    /// Post the outcome, then delete the message
    async fn finish(&self, delivery: &Delivery, outcome: ExecutionOutcome) -> Result<(), WorkerError> {
        self.status.set_state(WorkerState::Acknowledging);
        let response = ExecutionResponse {
            correlation_id: delivery.request.correlation_id.clone(),
            worker_id: self.id.clone(),
            outcome,
        };
        self.backend.publish_result(&response).await?;

        if !self.backend.ack(&delivery.handle).await? {
            warn!("claim expired before acknowledgement, a duplicate result may follow");
        }
        self.status.processed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn register(&self) -> Result<(), BackendError> {
        self.backend
            .register_worker(&self.id, &self.specialty, self.settings.registration_ttl())
            .await?;
        self.status.registered.store(true, Ordering::Release);
        Ok(())
    }
}
