use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::remote::{Delivery, ExecutionRequest, ExecutionResponse, ReceiptHandle};
use crate::specialty::WorkerSpecialty;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("queue backend unavailable: {0}")]
    Unavailable(String),

    #[error("malformed queue message: {0}")]
    Codec(#[from] serde_json::Error),
}

/// At-least-once message queue partitioned by specialty.
///
/// Implementations must hide a received message from other pollers until its
/// visibility window ends, then make it visible again unless it was acked.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn send(&self, request: &ExecutionRequest) -> Result<(), BackendError>;

    /// Claim one visible message whose required specialty `worker` satisfies
    async fn receive(
        &self,
        worker: &WorkerSpecialty,
        visibility: Duration,
    ) -> Result<Option<Delivery>, BackendError>;

    /// Delete a claimed message. Returns `false` if the handle is stale.
    async fn ack(&self, handle: &ReceiptHandle) -> Result<bool, BackendError>;

    /// Push back the visibility deadline of a claimed message
    async fn extend_visibility(
        &self,
        handle: &ReceiptHandle,
        visibility: Duration,
    ) -> Result<bool, BackendError>;

    /// Remove a message that no worker has claimed yet. Returns `false` once claimed.
    async fn cancel(&self, correlation_id: &str) -> Result<bool, BackendError>;

    /// Messages waiting for workers of exactly this specialty
    async fn depth(&self, specialty: &WorkerSpecialty) -> Result<usize, BackendError>;

    async fn register_worker(
        &self,
        worker_id: &str,
        specialty: &WorkerSpecialty,
        ttl: Duration,
    ) -> Result<(), BackendError>;

    async fn deregister_worker(&self, worker_id: &str) -> Result<(), BackendError>;

    /// Registered, unexpired workers able to serve `required`
    async fn live_workers(&self, required: &WorkerSpecialty) -> Result<usize, BackendError>;

    async fn publish_result(&self, response: &ExecutionResponse) -> Result<(), BackendError>;

    /// Next result from the response channel, `None` once the channel is closed
    async fn next_result(&self) -> Result<Option<ExecutionResponse>, BackendError>;
}
