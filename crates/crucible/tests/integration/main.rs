//! Integration tests for crucible
//!
//! Real toolchains are replaced by small shell scripts that answer the
//! version and help probes and write an executable to the `-o` path, so
//! these tests run anywhere with a POSIX shell.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crucible::config::CompilerCandidate;
use crucible::CompilerKind;

mod config_loading;
mod discovery;
mod end_to_end;
mod remote_execution;

const FIXTURES_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

/// Write an executable shell script to `dir/name`
pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n"))
        .unwrap_or_else(|e| panic!("Failed to write script {}: {e}", path.display()));
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A gcc look-alike reporting `version`.
///
/// Passing `-fail` makes it print a diagnostic and exit 1. Otherwise the
/// program it "compiles" prints `hello` followed by its arguments and the
/// first line of stdin, then exits with status 3.
pub(crate) fn fake_gcc(dir: &Path, name: &str, version: &str) -> PathBuf {
    let body = format!(
        r#"case "$1" in
  --version) echo "g++ (GCC) {version}"; echo "Copyright (C) 2022 Free Software Foundation, Inc."; exit 0 ;;
  --help=common)
    echo "  -O<number>                  Set optimization level to <number>."
    echo "  -Wall                       Enable most warning messages."
    exit 0 ;;
esac
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) shift; out="$1" ;;
    -fail) echo "$PWD/example.cpp:1:1: error: expected declaration" >&2; exit 1 ;;
  esac
  shift
done
printf '#!/bin/sh\nread line\necho "hello $* $line"\nexit 3\n' > "$out"
chmod +x "$out""#
    );
    write_script(dir, name, &body)
}

pub(crate) fn gcc_candidate(id: &str, exe: PathBuf) -> CompilerCandidate {
    CompilerCandidate::new(id, "c++", exe).kind(CompilerKind::Gcc)
}
