//! Running one compiler invocation
//!
//! Every job gets its own temporary directory holding the source and the
//! produced binary. The directory lives as long as the returned
//! [`CompileOutput`] and is removed on every exit path.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::compile::{CompilationJob, CompileError};
use crate::types::exit_signal;

const OUTPUT_NAME: &str = "output";

/// Compiler outcome as returned to callers. User mistakes show up here, never as errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileResult {
    /// Compiler exit code, `-1` if it was killed by a signal
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CompileResult {
    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

/// A finished compilation together with its working directory
#[derive(Debug)]
pub struct CompileOutput {
    pub result: CompileResult,
    workdir: TempDir,
    artifact: Option<PathBuf>,
}

impl CompileOutput {
    /// Path of the produced executable, if the compiler wrote one
    pub fn artifact_path(&self) -> Option<&Path> {
        self.artifact.as_deref()
    }

    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }
}

/// File name the source is written to, chosen so compilers infer the language
pub fn source_name(lang: &str) -> &'static str {
    match lang {
        "c++" | "cpp" => "example.cpp",
        "c" => "example.c",
        "rust" => "example.rs",
        "go" => "example.go",
        _ => "example.src",
    }
}

/// Compile `job` in a fresh directory. The compiler is killed if it runs past `kill_timeout`.
#[instrument(skip(job), fields(compiler = %job.compiler.id))]
pub async fn compile(job: &CompilationJob, kill_timeout: Duration) -> Result<CompileOutput, CompileError> {
    let compiler = &job.compiler;
    let workdir = tempfile::Builder::new().prefix("crucible-").tempdir()?;

    let source_path = workdir.path().join(source_name(&compiler.lang));
    let output_path = workdir.path().join(OUTPUT_NAME);
    tokio::fs::write(&source_path, job.source.as_bytes()).await?;

    let args = compiler
        .kind
        .build_command_line(&compiler.options, &job.options, &source_path, &output_path);
    debug!(exe = %compiler.exe.display(), ?args, "running compiler");

    let started = Instant::now();
    let child = Command::new(&compiler.exe)
        .args(&args)
        .current_dir(workdir.path())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| CompileError::Spawn {
            exe: compiler.exe.clone(),
            source,
        })?;

    let output = match tokio::time::timeout(kill_timeout, child.wait_with_output()).await {
        Ok(output) => output?,
        Err(_) => {
            warn!(?kill_timeout, "compiler exceeded kill timeout");
            return Err(CompileError::KillTimeout(kill_timeout));
        }
    };
    let elapsed = started.elapsed();

    let stdout = compiler
        .kind
        .parse_output(&String::from_utf8_lossy(&output.stdout), workdir.path());
    let stderr = compiler
        .kind
        .parse_output(&String::from_utf8_lossy(&output.stderr), workdir.path());

    let Some(code) = output.status.code() else {
        return Err(CompileError::Crashed {
            signal: exit_signal(&output.status),
            stdout,
            stderr,
        });
    };

    let artifact = (code == 0 && compiler.supports_binary && output_path.is_file()).then_some(output_path);
    debug!(code, has_artifact = artifact.is_some(), ?elapsed, "compilation finished");

    Ok(CompileOutput {
        result: CompileResult {
            code,
            stdout,
            stderr,
            duration_ms: elapsed.as_millis() as u64,
        },
        workdir,
        artifact,
    })
}
