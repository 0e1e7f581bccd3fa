//! Bounded-concurrency compile scheduler
//!
//! At most `limit` jobs hold a slot at once; the rest wait in FIFO order on a
//! fair semaphore. A job whose deadline passes while it is still waiting is
//! shed without ever starting.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::compile::runner::{self, CompileOutput};
use crate::compile::{CompilationJob, CompileError};
use crate::config::QueueConfig;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("compile job timed out after waiting {waited:?} in the queue")]
    Timeout { waited: Duration },

    #[error("compilation queue is closed")]
    Closed,
}

/// Point-in-time view of the queue used for health signalling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub limit: usize,
    /// Jobs waiting for a slot
    pub depth: usize,
    pub running: usize,
    /// How long the oldest waiting job has been queued
    pub oldest_wait: Option<Duration>,
    pub peak_running: usize,
    pub completed: u64,
    pub shed: u64,
}

#[derive(Debug)]
pub struct CompilationQueue {
    slots: Semaphore,
    limit: usize,
    default_timeout: Duration,
    kill_timeout: Duration,
    waiting: Mutex<BTreeMap<u64, Instant>>,
    next_ticket: AtomicU64,
    running: AtomicUsize,
    peak: AtomicUsize,
    completed: AtomicU64,
    shed: AtomicU64,
}

impl CompilationQueue {
    pub fn new(limit: usize, default_timeout: Duration, kill_timeout: Duration) -> Self {
        let limit = limit.max(1);
        Self {
            slots: Semaphore::new(limit),
            limit,
            default_timeout,
            kill_timeout,
            waiting: Mutex::new(BTreeMap::new()),
            next_ticket: AtomicU64::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            shed: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.concurrency(), config.queue_timeout(), config.kill_timeout())
    }

    /// Queue a compile job and wait for its result.
    ///
    /// The job's own deadline wins over the queue-wide timeout.
    pub async fn enqueue(&self, job: &CompilationJob) -> Result<CompileOutput, CompileError> {
        let kill_timeout = self.kill_timeout;
        self.run(job.deadline, || runner::compile(job, kill_timeout)).await?
    }

    /// Run `work` once a slot is free, unless `deadline` passes first
    pub async fn run<F, Fut, T>(&self, deadline: Option<Instant>, work: F) -> Result<T, QueueError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let enqueued = Instant::now();
        let deadline = deadline.unwrap_or(enqueued + self.default_timeout);
        if deadline <= enqueued {
            self.shed.fetch_add(1, Ordering::Relaxed);
            debug!("rejecting job whose deadline already passed");
            return Err(QueueError::Timeout {
                waited: Duration::ZERO,
            });
        }

        let waiting = self.register_waiter(enqueued);
        let permit = match tokio::time::timeout_at(deadline, self.slots.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(QueueError::Closed),
            Err(_) => {
                let waited = enqueued.elapsed();
                self.shed.fetch_add(1, Ordering::Relaxed);
                warn!(?waited, "shedding compile job that waited past its deadline");
                return Err(QueueError::Timeout { waited });
            }
        };
        drop(waiting);

        let _running = RunningGuard::enter(self);
        debug!(waited = ?enqueued.elapsed(), "compile job started");
        let output = work().await;
        drop(permit);

        self.completed.fetch_add(1, Ordering::Relaxed);
        Ok(output)
    }

    pub fn stats(&self) -> QueueStats {
        let waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
        let oldest_wait = waiting.values().min().map(|since| since.elapsed());
        QueueStats {
            limit: self.limit,
            depth: waiting.len(),
            running: self.running.load(Ordering::Relaxed),
            oldest_wait,
            peak_running: self.peak.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            shed: self.shed.load(Ordering::Relaxed),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Stop admitting work. Waiting jobs fail with [`QueueError::Closed`].
    pub fn close(&self) {
        self.slots.close();
    }

    fn register_waiter(&self, since: Instant) -> WaitingGuard<'_> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ticket, since);
        WaitingGuard { queue: self, ticket }
    }
}

/// Removes a waiting entry however the wait ends, including cancellation
struct WaitingGuard<'a> {
    queue: &'a CompilationQueue,
    ticket: u64,
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.queue
            .waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.ticket);
    }
}

struct RunningGuard<'a> {
    queue: &'a CompilationQueue,
}

impl<'a> RunningGuard<'a> {
    fn enter(queue: &'a CompilationQueue) -> Self {
        let now = queue.running.fetch_add(1, Ordering::AcqRel) + 1;
        queue.peak.fetch_max(now, Ordering::AcqRel);
        Self { queue }
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.queue.running.fetch_sub(1, Ordering::AcqRel);
    }
}
