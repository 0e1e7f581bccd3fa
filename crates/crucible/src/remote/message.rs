use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::specialty::WorkerSpecialty;
use crate::types::{ExecutionParams, ExecutionResult};

/// Name of a compiled binary in the shared artifact directory
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(pub String);

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handle identifying one delivery of a message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptHandle(pub String);

impl ReceiptHandle {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Queue message body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub correlation_id: String,
    pub artifact: ArtifactRef,
    pub specialty: WorkerSpecialty,
    #[serde(default)]
    pub params: ExecutionParams,
    /// Milliseconds since the Unix epoch
    pub enqueued_at_ms: u64,
    pub deadline_ms: u64,
}

impl ExecutionRequest {
    /// Build a request with a fresh correlation id that expires after `ttl`
    pub fn new(
        artifact: ArtifactRef,
        specialty: WorkerSpecialty,
        params: ExecutionParams,
        ttl: Duration,
    ) -> Self {
        let now = now_ms();
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            artifact,
            specialty,
            params,
            enqueued_at_ms: now,
            deadline_ms: now.saturating_add(ttl.as_millis() as u64),
        }
    }

    pub fn is_expired(&self) -> bool {
        now_ms() >= self.deadline_ms
    }

    /// Time left before the deadline, zero once expired
    pub fn remaining(&self) -> Duration {
        Duration::from_millis(self.deadline_ms.saturating_sub(now_ms()))
    }
}

/// Result posted by a worker for one correlation id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResponse {
    pub correlation_id: String,
    pub worker_id: String,
    pub outcome: ExecutionOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExecutionOutcome {
    /// The binary ran; its own exit status is inside the result
    Completed(ExecutionResult),

    /// Gave up after the message was delivered too many times
    TimedOut { attempts: u32 },

    /// The worker could not run the binary at all
    Failed { message: String },
}

/// A claimed message, hidden from other pollers until its visibility window ends
#[derive(Debug, Clone)]
pub struct Delivery {
    pub handle: ReceiptHandle,
    pub request: ExecutionRequest,
    /// How many times this message has been handed out, including this one
    pub receive_count: u32,
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
