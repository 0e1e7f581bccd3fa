use std::sync::Arc;
use std::time::Duration;

use crucible::{
    ArtifactStore, CompilationQueue, CompilationService, CompileRequest, CompilerRegistry, Config,
    ExecutionParams, ExecutionStatus, ExecutionWorker, Executor, InMemoryQueue, ProcessExecutor,
    RemoteError, RemoteExecutionQueue, ServiceError,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::{fake_gcc, gcc_candidate};

const RISCV: &str = "arch:riscv-nonexistent";

/// A host with one native and one cross compiler, both fakes
struct Host {
    service: Arc<CompilationService>,
    backend: Arc<InMemoryQueue>,
    config: Config,
    _tools: TempDir,
    artifacts: TempDir,
}

async fn host(configure: impl FnOnce(&mut Config)) -> Host {
    let tools = tempfile::tempdir().unwrap();
    let artifacts = tempfile::tempdir().unwrap();

    let mut config = Config::empty();
    config.compilers = vec![
        gcc_candidate("gcc-12", fake_gcc(tools.path(), "g++-12", "12.2.0")),
        gcc_candidate("gcc-riscv", fake_gcc(tools.path(), "riscv64-g++", "13.1.0")).specialty([RISCV]),
    ];
    config.execution.artifact_dir = artifacts.path().to_path_buf();
    config.remote.max_wait = 0.2;
    config.worker.poll_interval = 0.02;
    configure(&mut config);

    let registry = Arc::new(CompilerRegistry::new(
        config.registry.clone(),
        config.compilers.clone(),
    ));
    registry.initialize(false).await.expect("discovery failed");

    let backend = Arc::new(InMemoryQueue::new());
    let remote = Arc::new(RemoteExecutionQueue::new(backend.clone(), config.remote.clone()));
    let service = CompilationService::new(
        registry,
        Arc::new(CompilationQueue::from_config(&config.queue)),
        Arc::new(ProcessExecutor::from_config(&config.execution)),
        &config,
    )
    .with_remote(remote);

    Host {
        service: Arc::new(service),
        backend,
        config,
        _tools: tools,
        artifacts,
    }
}

fn request(compiler: &str, execute: Option<ExecutionParams>) -> CompileRequest {
    CompileRequest {
        lang: "c++".to_owned(),
        compiler_id: compiler.to_owned(),
        source: "int main() { return 3; }".to_owned(),
        options: Vec::new(),
        execute,
    }
}

fn artifact_count(host: &Host) -> usize {
    std::fs::read_dir(host.artifacts.path()).unwrap().count()
}

#[tokio::test]
async fn test_compile_only_is_cached() {
    let host = host(|_| {}).await;

    let first = host.service.handle(request("gcc-12", None)).await.unwrap();
    assert_eq!(first.compiler, "gcc-12");
    assert_eq!(first.code, 0);
    assert!(!first.cached);
    assert!(first.execution.is_none());
    assert_eq!(first.timing.execution_ms, None);

    let second = host.service.handle(request("gcc-12", None)).await.unwrap();
    assert!(second.cached);
    assert_eq!(second.code, 0);

    let mut flagged = request("gcc-12", None);
    flagged.options = vec!["-O3".to_owned()];
    assert!(!host.service.handle(flagged).await.unwrap().cached);
}

#[tokio::test]
async fn test_compile_error_is_a_result() {
    let host = host(|_| {}).await;

    let mut bad = request("gcc-12", Some(ExecutionParams::new()));
    bad.options = vec!["-fail".to_owned()];
    let response = host.service.handle(bad).await.unwrap();

    assert_eq!(response.code, 1);
    assert!(response.stderr.contains("example.cpp:1:1: error"));
    assert!(response.execution.is_none());
}

#[tokio::test]
async fn test_local_execution() {
    let host = host(|_| {}).await;

    let params = ExecutionParams::new()
        .with_args(["a", "b"])
        .with_stdin("world\n");
    let response = host
        .service
        .handle(request("gcc-12", Some(params)))
        .await
        .unwrap();

    assert_eq!(response.code, 0);
    let execution = response.execution.expect("program did not run");
    assert_eq!(execution.executed_by, "local");
    assert_eq!(execution.result.status, ExecutionStatus::RuntimeError);
    assert_eq!(execution.result.exit_code, Some(3));
    assert_eq!(execution.result.stdout.trim(), "hello a b world");
    assert!(response.timing.execution_ms.is_some());
}

#[tokio::test]
async fn test_foreign_specialty_without_workers() {
    let host = host(|_| {}).await;

    let started = std::time::Instant::now();
    let error = host
        .service
        .handle(request("gcc-riscv", Some(ExecutionParams::new())))
        .await
        .unwrap_err();

    match &error {
        ServiceError::Remote(RemoteError::NoWorkerAvailable { specialty, .. }) => {
            assert_eq!(specialty.key(), RISCV);
        }
        other => panic!("expected no worker available, got {other:?}"),
    }
    assert!(error.is_retryable());
    assert!(started.elapsed() >= Duration::from_millis(200));

    // The request was withdrawn and its artifact cleaned up.
    assert!(host.backend.is_empty());
    assert_eq!(artifact_count(&host), 0);
}

#[tokio::test]
async fn test_cancelled_request_cleans_up() {
    let host = host(|config| config.remote.max_wait = 30.0).await;

    let abandoned = tokio::time::timeout(
        Duration::from_millis(500),
        host.service.handle(request("gcc-riscv", Some(ExecutionParams::new()))),
    )
    .await;
    assert!(abandoned.is_err(), "request should still be waiting for a worker");

    let mut cleaned = false;
    for _ in 0..100 {
        if host.backend.is_empty() && artifact_count(&host) == 0 {
            cleaned = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(cleaned, "abandoned request left a message or artifact behind");
}

#[tokio::test]
async fn test_worker_executes_foreign_specialty() {
    let host = host(|config| {
        config.remote.max_wait = 10.0;
        config.worker.is_worker = true;
        config.worker.extra_specialties = vec![RISCV.to_owned()];
        config.execution.local = false;
    })
    .await;

    let executor: Arc<dyn Executor> = Arc::new(ProcessExecutor::from_config(&host.config.execution));
    let worker = Arc::new(ExecutionWorker::new(
        host.backend.clone(),
        executor,
        ArtifactStore::new(host.artifacts.path()),
        host.config.worker.clone(),
        &host.config.remote,
    ));
    let token = CancellationToken::new();
    let running = {
        let worker = worker.clone();
        let token = token.clone();
        tokio::spawn(async move { worker.run(token).await })
    };

    let params = ExecutionParams::new().with_args(["remote"]);
    let response = host
        .service
        .handle(request("gcc-riscv", Some(params)))
        .await
        .unwrap();

    let execution = response.execution.expect("program did not run");
    assert_eq!(execution.executed_by, worker.id());
    assert_eq!(execution.result.exit_code, Some(3));
    assert!(execution.result.stdout.starts_with("hello remote"));
    assert_eq!(artifact_count(&host), 0);

    token.cancel();
    running.await.unwrap().unwrap();
}
