//! Running compiled binaries
//!
//! Isolation is delegated to an optional wrapper command (for example
//! `nsjail --quiet --`) that is prepended to the program's command line.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::config::ExecutionConfig;
use crate::types::{ExecutionParams, ExecutionResult};

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("artifact missing: {0}")]
    ArtifactMissing(PathBuf),

    #[error("failed to start program: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs one binary and reports how it ended
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, binary: &Path, params: &ExecutionParams) -> Result<ExecutionResult, ExecuteError>;
}

/// Executes binaries as local subprocesses in a scratch directory
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    wrapper: Vec<String>,
    timeout: Duration,
    max_output: usize,
}

impl ProcessExecutor {
    pub fn new(wrapper: Vec<String>, timeout: Duration, max_output: usize) -> Self {
        Self {
            wrapper,
            timeout,
            max_output,
        }
    }

    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self::new(config.wrapper.clone(), config.timeout(), config.max_output)
    }

    fn command(&self, program: &Path, params: &ExecutionParams) -> Command {
        let mut command = match self.wrapper.split_first() {
            Some((wrapper, wrapper_args)) => {
                let mut command = Command::new(wrapper);
                command.args(wrapper_args).arg(program);
                command
            }
            None => Command::new(program),
        };
        command.args(&params.args);
        command
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    #[instrument(skip(self, params))]
    async fn execute(&self, binary: &Path, params: &ExecutionParams) -> Result<ExecutionResult, ExecuteError> {
        if !binary.is_file() {
            return Err(ExecuteError::ArtifactMissing(binary.to_path_buf()));
        }

        // The scratch copy keeps the shared artifact untouched and is removed on every path.
        let scratch = tempfile::Builder::new().prefix("crucible-run-").tempdir()?;
        let program = scratch.path().join("program");
        tokio::fs::copy(binary, &program).await?;
        make_executable(&program)?;

        let mut child = self
            .command(&program, params)
            .current_dir(scratch.path())
            .stdin(if params.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ExecuteError::Spawn)?;

        if let (Some(input), Some(mut stdin)) = (params.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    debug!(error = %e, "program closed stdin early");
                }
            });
        }

        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => ExecutionResult::from_output(&output?, started.elapsed(), self.max_output),
            Err(_) => {
                warn!(timeout = ?self.timeout, "program exceeded wall time, killed");
                ExecutionResult::timed_out(started.elapsed())
            }
        };

        debug!(status = ?result.status, exit_code = ?result.exit_code, "program finished");
        Ok(result)
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::types::ExecutionStatus;

    fn program(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("prog");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        path
    }

    fn executor(timeout: Duration) -> ProcessExecutor {
        ProcessExecutor::new(Vec::new(), timeout, 1024)
    }

    #[tokio::test]
    async fn captures_exit_code_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let binary = program(dir.path(), "echo \"$1\"; exit 3");
        let params = ExecutionParams::new().with_args(["hello"]);

        let result = executor(Duration::from_secs(5)).execute(&binary, &params).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::RuntimeError);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stdout, "hello\n");
    }

    #[tokio::test]
    async fn stdin_is_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let binary = program(dir.path(), "cat");
        let params = ExecutionParams::new().with_stdin("42\n");

        let result = executor(Duration::from_secs(5)).execute(&binary, &params).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.stdout, "42\n");
    }

    #[tokio::test]
    async fn wall_time_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let binary = program(dir.path(), "sleep 5");

        let result = executor(Duration::from_millis(100))
            .execute(&binary, &ExecutionParams::default())
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::TimeLimitExceeded);
    }

    #[tokio::test]
    async fn wrapper_prefixes_program() {
        let dir = tempfile::tempdir().unwrap();
        let binary = program(dir.path(), "exit 0");
        let wrapper = ProcessExecutor::new(
            vec!["/bin/sh".to_owned(), "-c".to_owned(), "echo wrapped; exec \"$0\"".to_owned()],
            Duration::from_secs(5),
            1024,
        );

        let result = wrapper.execute(&binary, &ExecutionParams::default()).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.stdout, "wrapped\n");
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let result = executor(Duration::from_secs(1))
            .execute(Path::new("/nonexistent/prog"), &ExecutionParams::default())
            .await;
        assert!(matches!(result, Err(ExecuteError::ArtifactMissing(_))));
    }
}
