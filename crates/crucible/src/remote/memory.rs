//! In-process queue backend
//!
//! Stores message bodies as JSON, so everything that crosses it goes through
//! the same encoding a networked backend would use.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::remote::{
    BackendError, Delivery, ExecutionRequest, ExecutionResponse, QueueBackend, ReceiptHandle,
};
use crate::specialty::WorkerSpecialty;

#[derive(Debug)]
struct StoredMessage {
    correlation_id: String,
    specialty: WorkerSpecialty,
    body: String,
    receive_count: u32,
    claim: Option<Claim>,
    expires_at: Instant,
}

#[derive(Debug)]
struct Claim {
    handle: ReceiptHandle,
    visible_at: Instant,
}

impl StoredMessage {
    fn in_flight(&self, now: Instant) -> bool {
        self.claim.as_ref().is_some_and(|claim| claim.visible_at > now)
    }

    /// Past its TTL with no worker holding it
    fn expired(&self, now: Instant) -> bool {
        self.expires_at <= now && !self.in_flight(now)
    }
}

#[derive(Debug, Default)]
struct State {
    messages: VecDeque<StoredMessage>,
    workers: HashMap<String, (WorkerSpecialty, Instant)>,
}

impl State {
    fn purge_expired(&mut self, now: Instant) {
        let before = self.messages.len();
        self.messages.retain(|message| {
            let expired = message.expired(now);
            if expired {
                debug!(correlation_id = %message.correlation_id, specialty = %message.specialty, "dropping expired message");
            }
            !expired
        });
        if self.messages.len() < before {
            debug!(dropped = before - self.messages.len(), "purged expired messages");
        }
    }
}

pub struct InMemoryQueue {
    state: Mutex<State>,
    results_tx: mpsc::UnboundedSender<String>,
    results_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(State::default()),
            results_tx,
            results_rx: tokio::sync::Mutex::new(results_rx),
        }
    }

    /// Messages currently stored, claimed or not
    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueue {
    async fn send(&self, request: &ExecutionRequest) -> Result<(), BackendError> {
        let body = serde_json::to_string(request)?;
        let now = Instant::now();
        let mut state = self.lock();
        state.purge_expired(now);
        state.messages.push_back(StoredMessage {
            correlation_id: request.correlation_id.clone(),
            specialty: request.specialty.clone(),
            body,
            receive_count: 0,
            claim: None,
            expires_at: now + request.remaining(),
        });
        Ok(())
    }

    async fn receive(
        &self,
        worker: &WorkerSpecialty,
        visibility: Duration,
    ) -> Result<Option<Delivery>, BackendError> {
        let now = Instant::now();
        let mut state = self.lock();
        state.purge_expired(now);

        let Some(message) = state
            .messages
            .iter_mut()
            .find(|message| !message.in_flight(now) && worker.satisfies(&message.specialty))
        else {
            return Ok(None);
        };

        let request: ExecutionRequest = serde_json::from_str(&message.body)?;
        let handle = ReceiptHandle::generate();
        message.receive_count += 1;
        message.claim = Some(Claim {
            handle: handle.clone(),
            visible_at: now + visibility,
        });
        if message.receive_count > 1 {
            debug!(correlation_id = %message.correlation_id, receive_count = message.receive_count, "redelivering message");
        }

        Ok(Some(Delivery {
            handle,
            request,
            receive_count: message.receive_count,
        }))
    }

    async fn ack(&self, handle: &ReceiptHandle) -> Result<bool, BackendError> {
        let mut state = self.lock();
        let position = state
            .messages
            .iter()
            .position(|message| message.claim.as_ref().is_some_and(|claim| &claim.handle == handle));
        Ok(position.and_then(|index| state.messages.remove(index)).is_some())
    }

    async fn extend_visibility(
        &self,
        handle: &ReceiptHandle,
        visibility: Duration,
    ) -> Result<bool, BackendError> {
        let now = Instant::now();
        let mut state = self.lock();
        let claim = state
            .messages
            .iter_mut()
            .filter_map(|message| message.claim.as_mut())
            .find(|claim| &claim.handle == handle && claim.visible_at > now);
        Ok(match claim {
            Some(claim) => {
                claim.visible_at = now + visibility;
                true
            }
            None => false,
        })
    }

    async fn cancel(&self, correlation_id: &str) -> Result<bool, BackendError> {
        let now = Instant::now();
        let mut state = self.lock();
        state.purge_expired(now);
        let position = state
            .messages
            .iter()
            .position(|message| message.correlation_id == correlation_id && !message.in_flight(now));
        Ok(position.and_then(|index| state.messages.remove(index)).is_some())
    }

    async fn depth(&self, specialty: &WorkerSpecialty) -> Result<usize, BackendError> {
        let now = Instant::now();
        let mut state = self.lock();
        state.purge_expired(now);
        Ok(state
            .messages
            .iter()
            .filter(|message| &message.specialty == specialty && !message.in_flight(now))
            .count())
    }

    async fn register_worker(
        &self,
        worker_id: &str,
        specialty: &WorkerSpecialty,
        ttl: Duration,
    ) -> Result<(), BackendError> {
        self.lock()
            .workers
            .insert(worker_id.to_owned(), (specialty.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn deregister_worker(&self, worker_id: &str) -> Result<(), BackendError> {
        self.lock().workers.remove(worker_id);
        Ok(())
    }

    async fn live_workers(&self, required: &WorkerSpecialty) -> Result<usize, BackendError> {
        let now = Instant::now();
        let mut state = self.lock();
        state.workers.retain(|_, (_, expires)| *expires > now);
        Ok(state
            .workers
            .values()
            .filter(|(specialty, _)| specialty.satisfies(required))
            .count())
    }

    async fn publish_result(&self, response: &ExecutionResponse) -> Result<(), BackendError> {
        let body = serde_json::to_string(response)?;
        self.results_tx
            .send(body)
            .map_err(|_| BackendError::Unavailable("result channel closed".to_owned()))
    }

    async fn next_result(&self) -> Result<Option<ExecutionResponse>, BackendError> {
        let body = self.results_rx.lock().await.recv().await;
        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }
}
