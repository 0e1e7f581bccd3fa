//! Local compilation
//!
//! Jobs are admitted through the [`CompilationQueue`], which bounds how many
//! compiler subprocesses run at once, and executed by [`compile`].

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub use crate::compile::cache::CompileCache;
pub use crate::compile::job::{CompilationJob, cache_key};
pub use crate::compile::queue::{CompilationQueue, QueueError, QueueStats};
pub use crate::compile::runner::{CompileOutput, CompileResult, compile, source_name};

mod cache;
mod job;
mod queue;
mod runner;

/// Failures of the compile step itself, as opposed to errors in user code
#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("failed to start compiler {exe}: {source}")]
    Spawn {
        exe: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("compiler killed after exceeding {0:?}")]
    KillTimeout(Duration),

    #[error("compiler crashed (signal {signal:?})")]
    Crashed {
        signal: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CompileError {
    /// Convert a crash into the result shown to the caller, keeping captured output
    pub fn into_result(self) -> Result<CompileResult, CompileError> {
        match self {
            CompileError::Crashed {
                signal,
                stdout,
                mut stderr,
            } => {
                if !stderr.is_empty() {
                    stderr.push('\n');
                }
                stderr.push_str(&match signal {
                    Some(signal) => format!("Compiler crashed with signal {signal}"),
                    None => "Compiler crashed".to_owned(),
                });
                Ok(CompileResult {
                    code: -1,
                    stdout,
                    stderr,
                    duration_ms: 0,
                })
            }
            other => Err(other),
        }
    }
}
