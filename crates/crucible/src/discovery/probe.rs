//! Probing candidate toolchains
//!
//! Each probe spawns the candidate once for its version and once for its
//! help text. Both runs are bounded by the candidate's probe timeout.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, instrument};

use crate::config::CompilerCandidate;
use crate::discovery::{CompilerInfo, DiscoveryError};
use crate::specialty::WorkerSpecialty;

/// Probe one candidate and build its validated record
#[instrument(skip(candidate), fields(id = %candidate.id))]
pub async fn probe_candidate(
    candidate: &CompilerCandidate,
    default_timeout: Duration,
) -> Result<CompilerInfo, DiscoveryError> {
    let exe = resolve_executable(&candidate.exe)?;
    ensure_executable(&exe)?;

    let timeout = candidate.probe_timeout(default_timeout);
    let kind = candidate.kind;

    let version_output = run_probe(&exe, kind.version_args(), timeout).await?;
    let semver = candidate
        .semver
        .clone()
        .or_else(|| kind.parse_version(&version_output));

    // A compiler that cannot describe its options is still usable.
    let possible_arguments = match run_probe(&exe, kind.help_args(), timeout).await {
        Ok(help) => kind.parse_possible_arguments(&help),
        Err(e) => {
            debug!(error = %e, "help probe failed, caching no arguments");
            Vec::new()
        }
    };

    let name = candidate.name.clone().unwrap_or_else(|| match &semver {
        Some(version) => format!("{kind} {version}"),
        None => candidate.id.clone(),
    });

    debug!(?semver, arguments = possible_arguments.len(), "probed compiler");

    Ok(CompilerInfo {
        id: candidate.id.clone(),
        name,
        lang: candidate.lang.clone(),
        exe,
        kind,
        group: candidate.group.clone(),
        semver,
        options: candidate.options.clone(),
        supports_execution: candidate.supports_execution,
        supports_binary: candidate.supports_binary,
        specialty: WorkerSpecialty::new(candidate.specialty.iter().cloned()),
        possible_arguments,
    })
}

/// Run the executable with `args`, returning combined stdout and stderr
async fn run_probe(exe: &Path, args: &[&str], timeout: Duration) -> Result<String, DiscoveryError> {
    let child = Command::new(exe)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| DiscoveryError::Spawn {
            exe: exe.to_path_buf(),
            source,
        })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output.map_err(|source| DiscoveryError::Spawn {
            exe: exe.to_path_buf(),
            source,
        })?,
        Err(_) => {
            return Err(DiscoveryError::ProbeTimedOut {
                exe: exe.to_path_buf(),
                timeout,
            });
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() {
        return Err(DiscoveryError::ProbeFailed {
            exe: exe.to_path_buf(),
            code: output.status.code(),
            stderr: stderr.trim().to_owned(),
        });
    }

    let mut combined = stdout.into_owned();
    if !stderr.is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(&stderr);
    }
    Ok(combined)
}

/// Resolve a bare executable name (like `g++-12`) against the host's PATH.
///
/// Paths that already contain a separator are returned unchanged if they
/// exist. Symlinks are canonicalized so the recorded path is stable.
pub fn resolve_executable(exe: &Path) -> Result<PathBuf, DiscoveryError> {
    if exe.components().count() > 1 || exe.is_absolute() {
        if exe.exists() {
            return Ok(exe.to_path_buf());
        }
        return Err(DiscoveryError::NotFound(exe.to_path_buf()));
    }

    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(exe);
        if candidate.is_file() {
            return Ok(std::fs::canonicalize(&candidate).unwrap_or(candidate));
        }
    }

    Err(DiscoveryError::NotFound(exe.to_path_buf()))
}

#[cfg(unix)]
fn ensure_executable(exe: &Path) -> Result<(), DiscoveryError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(exe).map_err(|_| DiscoveryError::NotFound(exe.to_path_buf()))?;
    if !metadata.is_file() || metadata.permissions().mode() & 0o111 == 0 {
        return Err(DiscoveryError::NotExecutable(exe.to_path_buf()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_executable(exe: &Path) -> Result<(), DiscoveryError> {
    if !exe.is_file() {
        return Err(DiscoveryError::NotExecutable(exe.to_path_buf()));
    }
    Ok(())
}
