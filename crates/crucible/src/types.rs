use std::process::Output;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Arguments and input handed to an executed program
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionParams {
    /// Command-line arguments passed to the program
    #[serde(default)]
    pub args: Vec<String>,

    /// Data written to the program's stdin
    #[serde(default)]
    pub stdin: Option<String>,
}

impl ExecutionParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

/// Result of an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Execution status
    pub status: ExecutionStatus,

    /// Exit code if the program exited normally
    pub exit_code: Option<i32>,

    /// Signal number if the program was killed by a signal
    pub signal: Option<i32>,

    /// Captured standard output
    pub stdout: String,

    /// Captured standard error
    pub stderr: String,

    /// Whether stdout or stderr was cut at the output limit
    #[serde(default)]
    pub truncated: bool,

    /// Wall clock time used in milliseconds
    pub wall_time_ms: u64,
}

impl ExecutionResult {
    /// Check if the execution was successful (exited with code 0)
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.status, ExecutionStatus::Ok) && self.exit_code == Some(0)
    }

    /// Build a result from a finished process, capping each stream at `max_output` bytes
    pub fn from_output(output: &Output, elapsed: Duration, max_output: usize) -> Self {
        let (stdout, stdout_cut) = capture(&output.stdout, max_output);
        let (stderr, stderr_cut) = capture(&output.stderr, max_output);
        let exit_code = output.status.code();
        let signal = exit_signal(&output.status);

        let status = match (exit_code, signal) {
            (Some(0), _) => ExecutionStatus::Ok,
            (Some(_), _) => ExecutionStatus::RuntimeError,
            (None, Some(_)) => ExecutionStatus::Signaled,
            (None, None) => ExecutionStatus::InternalError,
        };

        Self {
            status,
            exit_code,
            signal,
            stdout,
            stderr,
            truncated: stdout_cut || stderr_cut,
            wall_time_ms: elapsed.as_millis() as u64,
        }
    }

    /// Result for a program killed after exceeding its wall time
    pub fn timed_out(elapsed: Duration) -> Self {
        Self {
            status: ExecutionStatus::TimeLimitExceeded,
            wall_time_ms: elapsed.as_millis() as u64,
            ..Default::default()
        }
    }
}

impl Default for ExecutionResult {
    fn default() -> Self {
        Self {
            status: ExecutionStatus::Ok,
            exit_code: None,
            signal: None,
            stdout: String::new(),
            stderr: String::new(),
            truncated: false,
            wall_time_ms: 0,
        }
    }
}

/// Status of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Program exited normally
    #[serde(rename = "OK")]
    Ok,

    /// Runtime error (non-zero exit code)
    #[serde(rename = "RE")]
    RuntimeError,

    /// Wall time limit exceeded
    #[serde(rename = "TO")]
    TimeLimitExceeded,

    /// Program was killed by a signal
    #[serde(rename = "SG")]
    Signaled,

    /// The process could not be observed to exit normally
    #[serde(rename = "XX")]
    InternalError,
}

fn capture(bytes: &[u8], max_output: usize) -> (String, bool) {
    if bytes.len() > max_output {
        (String::from_utf8_lossy(&bytes[..max_output]).into_owned(), true)
    } else {
        (String::from_utf8_lossy(bytes).into_owned(), false)
    }
}

#[cfg(unix)]
pub(crate) fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
pub(crate) fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
