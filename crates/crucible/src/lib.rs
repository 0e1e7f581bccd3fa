//! A library for orchestrating compilation and execution.
//!
//! Crucible accepts source code, compiles it with one of many installed
//! toolchains and optionally runs the result, either on the local host or on
//! a fleet of execution workers reached through an at-least-once queue.
//!
//! # Features
//!
//! - **Compiler discovery** with bounded parallel probing, clash detection, snapshot export/import and single-flight rescans.
//! - **Compilation queue** with a global concurrency ceiling, FIFO admission and deadline-based load shedding.
//! - **Remote execution** routed by worker specialty, with visibility timeouts, redelivery and result correlation.
//! - **Execution workers** that keep their claims alive while running and give up cleanly.
//! - **Health reporting** built from queue depth, oldest job age and worker liveness.

pub use artifact::{ArtifactError, ArtifactGuard, ArtifactStore};
pub use compile::{
    CompilationJob, CompilationQueue, CompileCache, CompileError, CompileOutput, CompileResult,
    QueueError, QueueStats,
};
pub use config::{Config, ConfigError, EXAMPLE_CONFIG};
pub use discovery::{
    CompilerInfo, CompilerKind, CompilerRegistry, DiscoveryError, DiscoverySnapshot,
    RegistryError,
};
pub use health::{HealthCheck, HealthReport};
pub use remote::{
    ArtifactRef, ExecutionOutcome, ExecutionRequest, ExecutionResponse, InMemoryQueue,
    QueueBackend, RemoteError, RemoteExecutionQueue, Submission,
};
pub use service::{
    CompilationService, CompileRequest, CompileResponse, ExecutionReport, FailureResponse,
    ServiceError,
};
pub use specialty::WorkerSpecialty;
pub use types::{ExecutionParams, ExecutionResult, ExecutionStatus};
pub use worker::{ExecuteError, ExecutionWorker, Executor, ProcessExecutor, WorkerError, WorkerStatus};

pub mod artifact;
pub mod compile;
pub mod config;
pub mod discovery;
pub mod health;
pub mod remote;
pub mod service;
pub mod specialty;
pub mod types;
pub mod worker;
