use std::sync::Arc;
use std::time::Duration;

use crucible::config::{RemoteConfig, WorkerConfig};
use crucible::{
    ArtifactRef, ArtifactStore, ExecutionParams, ExecutionWorker, InMemoryQueue, ProcessExecutor,
    QueueBackend, RemoteError, RemoteExecutionQueue, WorkerSpecialty,
};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::write_script;

struct Fleet {
    backend: Arc<InMemoryQueue>,
    remote: RemoteExecutionQueue,
    store: ArtifactStore,
    settings: RemoteConfig,
    _artifacts: TempDir,
}

fn fleet(settings: RemoteConfig) -> Fleet {
    let artifacts = tempfile::tempdir().unwrap();
    let backend = Arc::new(InMemoryQueue::new());
    Fleet {
        remote: RemoteExecutionQueue::new(backend.clone(), settings.clone()),
        backend,
        store: ArtifactStore::new(artifacts.path()),
        settings,
        _artifacts: artifacts,
    }
}

impl Fleet {
    fn start_worker(&self, token: &CancellationToken) -> (Arc<ExecutionWorker>, JoinHandle<()>) {
        let settings = WorkerConfig {
            is_worker: true,
            poll_interval: 0.02,
            ..Default::default()
        };
        let worker = Arc::new(ExecutionWorker::new(
            self.backend.clone(),
            Arc::new(ProcessExecutor::new(Vec::new(), Duration::from_secs(5), 4096)),
            ArtifactStore::new(self.store.root()),
            settings,
            &self.settings,
        ));
        let running = {
            let worker = worker.clone();
            let token = token.clone();
            tokio::spawn(async move {
                worker.run(token).await.unwrap();
            })
        };
        (worker, running)
    }

    async fn store_program(&self, body: &str) -> ArtifactRef {
        let scratch = tempfile::tempdir().unwrap();
        let program = write_script(scratch.path(), "program", body);
        self.store.put(&program).await.unwrap()
    }
}

fn settings(visibility_timeout: f64, max_receive_count: u32) -> RemoteConfig {
    RemoteConfig {
        max_wait: 5.0,
        visibility_timeout,
        max_receive_count,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_missing_artifact_fails_request() {
    let fleet = fleet(settings(30.0, 3));
    let token = CancellationToken::new();
    let (_, running) = fleet.start_worker(&token);

    let request = fleet.remote.request(
        ArtifactRef("0123456789abcdef".to_owned()),
        WorkerSpecialty::default(),
        ExecutionParams::new(),
    );
    let correlation_id = request.correlation_id.clone();

    match fleet.remote.execute(request).await {
        Err(RemoteError::WorkerFailed {
            correlation_id: failed,
            message,
        }) => {
            assert_eq!(failed, correlation_id);
            assert!(message.contains("not found"), "{message}");
        }
        other => panic!("expected worker failure, got {other:?}"),
    }
    assert!(fleet.backend.is_empty());

    token.cancel();
    running.await.unwrap();
}

#[tokio::test]
async fn test_crashed_claim_is_redelivered() {
    let fleet = fleet(settings(0.2, 3));
    let artifact = fleet.store_program("echo survived").await;

    let request = fleet
        .remote
        .request(artifact, WorkerSpecialty::default(), ExecutionParams::new());
    let submission = fleet.remote.submit(request).await.unwrap();

    // A worker claims the message and dies without acknowledging it.
    let host = WorkerSpecialty::detect_host(&[]);
    let crashed = fleet
        .backend
        .receive(&host, Duration::from_millis(200))
        .await
        .unwrap()
        .expect("message not delivered");
    assert_eq!(crashed.receive_count, 1);

    let token = CancellationToken::new();
    let (worker, running) = fleet.start_worker(&token);

    let response = submission.wait().await.unwrap();
    let (executed_by, result) = response.into_result().unwrap();
    assert_eq!(executed_by, worker.id());
    assert!(result.is_success());
    assert_eq!(result.stdout.trim(), "survived");

    // The stale receipt no longer matches the redelivered claim.
    assert!(!fleet.backend.ack(&crashed.handle).await.unwrap());

    token.cancel();
    running.await.unwrap();
}

#[tokio::test]
async fn test_poison_message_times_out() {
    let fleet = fleet(settings(0.1, 1));
    let artifact = fleet.store_program("exit 0").await;

    let request = fleet
        .remote
        .request(artifact, WorkerSpecialty::default(), ExecutionParams::new());
    let correlation_id = request.correlation_id.clone();
    let submission = fleet.remote.submit(request).await.unwrap();

    let host = WorkerSpecialty::detect_host(&[]);
    fleet
        .backend
        .receive(&host, Duration::from_millis(100))
        .await
        .unwrap()
        .expect("message not delivered");
    tokio::time::sleep(Duration::from_millis(150)).await;

    let token = CancellationToken::new();
    let (_, running) = fleet.start_worker(&token);

    let response = submission.wait().await.unwrap();
    match response.into_result() {
        Err(RemoteError::ExecutionTimeout { correlation_id: timed_out }) => {
            assert_eq!(timed_out, correlation_id);
        }
        other => panic!("expected execution timeout, got {other:?}"),
    }
    assert!(fleet.backend.is_empty());

    token.cancel();
    running.await.unwrap();
}

#[tokio::test]
async fn test_cancel_withdraws_unclaimed_request() {
    let fleet = fleet(settings(30.0, 3));
    let artifact = fleet.store_program("exit 0").await;

    let request = fleet
        .remote
        .request(artifact, WorkerSpecialty::new(["arch:riscv-nonexistent"]), ExecutionParams::new());
    let submission = fleet.remote.submit(request).await.unwrap();
    assert_eq!(fleet.backend.len(), 1);
    assert_eq!(fleet.remote.in_flight(), 1);

    assert!(submission.cancel().await.unwrap());
    assert!(fleet.backend.is_empty());
    assert_eq!(fleet.remote.in_flight(), 0);
}
