//! Readiness and liveness
//!
//! A read-only aggregation over the compilation queue, the registry and,
//! on worker hosts, the execution worker.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::compile::CompilationQueue;
use crate::config::HealthConfig;
use crate::discovery::CompilerRegistry;
use crate::worker::{WorkerState, WorkerStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub live: bool,
    pub ready: bool,
    pub queue_depth: usize,
    pub running_jobs: usize,
    pub oldest_job_age_ms: Option<u64>,
    pub compilers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerHealth>,
    /// Why the host is not ready, empty when it is
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHealth {
    pub registered: bool,
    pub polling: bool,
    pub processed: u64,
    pub abandoned: u64,
}

struct WorkerProbe {
    status: Arc<WorkerStatus>,
    max_poll_age: Duration,
}

pub struct HealthCheck {
    queue: Arc<CompilationQueue>,
    registry: Arc<CompilerRegistry>,
    worker: Option<WorkerProbe>,
    max_queue_depth: usize,
    health_check_file: Option<PathBuf>,
}

impl HealthCheck {
    pub fn new(queue: Arc<CompilationQueue>, registry: Arc<CompilerRegistry>, config: &HealthConfig) -> Self {
        Self {
            queue,
            registry,
            worker: None,
            max_queue_depth: config.max_queue_depth,
            health_check_file: config.health_check_file.clone(),
        }
    }

    /// Also require the worker to be registered and to have polled within `max_poll_age`
    pub fn with_worker(mut self, status: Arc<WorkerStatus>, max_poll_age: Duration) -> Self {
        self.worker = Some(WorkerProbe { status, max_poll_age });
        self
    }

    pub fn check(&self) -> HealthReport {
        let stats = self.queue.stats();
        let compilers = self.registry.snapshot().len();
        let mut reasons = Vec::new();

        if stats.depth >= self.max_queue_depth {
            reasons.push(format!(
                "compilation queue depth {} at or above {}",
                stats.depth, self.max_queue_depth
            ));
        }

        if let Some(path) = &self.health_check_file
            && !path.exists()
        {
            reasons.push(format!("health check file {} is missing", path.display()));
        }

        let worker = self.worker.as_ref().map(|probe| {
            let status = &probe.status;
            let busy = matches!(
                status.state(),
                WorkerState::Claimed | WorkerState::Executing | WorkerState::Acknowledging
            );
            let polled_recently = status
                .last_poll_age()
                .is_some_and(|age| age <= probe.max_poll_age);
            WorkerHealth {
                registered: status.is_registered(),
                polling: busy || polled_recently,
                processed: status.processed(),
                abandoned: status.abandoned(),
            }
        });

        match &worker {
            Some(worker) => {
                if !worker.registered {
                    reasons.push("execution worker is not registered".to_owned());
                }
                if !worker.polling {
                    reasons.push("execution worker is not polling".to_owned());
                }
            }
            None if compilers == 0 => reasons.push("no compilers discovered".to_owned()),
            None => {}
        }

        HealthReport {
            live: true,
            ready: reasons.is_empty(),
            queue_depth: stats.depth,
            running_jobs: stats.running,
            oldest_job_age_ms: stats.oldest_wait.map(|age| age.as_millis() as u64),
            compilers,
            worker,
            reasons,
        }
    }
}
