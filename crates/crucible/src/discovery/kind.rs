//! Per-family compiler quirks
//!
//! Every family knows how to be probed, how to build its command line, and
//! how to clean up its diagnostics. The family is chosen by configuration,
//! not inferred from the binary.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::discovery::PossibleArgument;

/// Placeholder for the source path in generic command lines
pub const SOURCE_PLACEHOLDER: &str = "{source}";

/// Placeholder for the output path in generic command lines
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompilerKind {
    Gcc,
    Clang,
    Rustc,
    Go,
    /// Any other tool; options may use `{source}` and `{output}` placeholders
    #[default]
    Generic,
}

impl CompilerKind {
    /// Arguments that make the compiler print its version
    pub fn version_args(&self) -> &'static [&'static str] {
        match self {
            CompilerKind::Go => &["version"],
            _ => &["--version"],
        }
    }

    /// Arguments that make the compiler list the options it accepts
    pub fn help_args(&self) -> &'static [&'static str] {
        match self {
            CompilerKind::Gcc => &["--help=common"],
            CompilerKind::Clang | CompilerKind::Generic => &["--help"],
            CompilerKind::Rustc => &["-C", "help"],
            CompilerKind::Go => &["help", "build"],
        }
    }

    /// Extract a dotted version from the first line of the version output
    pub fn parse_version(&self, output: &str) -> Option<String> {
        let first = output.lines().find(|line| !line.trim().is_empty())?;
        first
            .split(|c: char| c.is_whitespace() || matches!(c, '(' | ')' | ','))
            .map(|token| match self {
                CompilerKind::Go => token.trim_start_matches("go"),
                _ => token.trim_start_matches('v'),
            })
            .find_map(version_prefix)
    }

    /// Parse help output into the list of accepted arguments
    pub fn parse_possible_arguments(&self, help: &str) -> Vec<PossibleArgument> {
        let mut arguments: Vec<PossibleArgument> = Vec::new();
        for line in help.lines() {
            let line = line.trim();
            if !line.starts_with('-') {
                continue;
            }

            let parsed = match self {
                CompilerKind::Rustc => parse_rustc_codegen_line(line),
                _ => parse_flag_line(line),
            };

            if let Some(argument) = parsed
                && !arguments.iter().any(|a| a.name == argument.name)
            {
                arguments.push(argument);
            }
        }
        arguments
    }

    /// Build the full argument list (excluding the executable itself)
    pub fn build_command_line(
        &self,
        options: &[String],
        user_flags: &[String],
        source: &Path,
        output: &Path,
    ) -> Vec<String> {
        let source = source.to_string_lossy().into_owned();
        let output = output.to_string_lossy().into_owned();

        let mut args = Vec::with_capacity(options.len() + user_flags.len() + 4);
        match self {
            CompilerKind::Gcc | CompilerKind::Clang | CompilerKind::Rustc => {
                args.extend(options.iter().cloned());
                args.extend(user_flags.iter().cloned());
                args.extend(["-o".to_owned(), output, source]);
            }
            CompilerKind::Go => {
                args.push("build".to_owned());
                args.extend(options.iter().cloned());
                args.extend(user_flags.iter().cloned());
                args.extend(["-o".to_owned(), output, source]);
            }
            CompilerKind::Generic => {
                let mentions_source = options.iter().any(|o| o.contains(SOURCE_PLACEHOLDER));
                args.extend(expand_placeholders(options, &source, &output));
                args.extend(user_flags.iter().cloned());
                if !mentions_source {
                    args.push(source);
                }
            }
        }
        args
    }

    /// Clean raw diagnostics: strip colour codes and the job's working directory
    pub fn parse_output(&self, raw: &str, workdir: &Path) -> String {
        let mut prefix = workdir.to_string_lossy().into_owned();
        prefix.push('/');

        let cleaned = strip_ansi(raw).replace(&prefix, "");
        let lines = cleaned
            .lines()
            .filter(|line| {
                !(*self == CompilerKind::Go && line.starts_with("# command-line-arguments"))
            })
            .map(str::trim_end);

        let mut text = lines.collect::<Vec<_>>().join("\n");
        let kept = text.trim_end().len();
        text.truncate(kept);
        text
    }
}

impl fmt::Display for CompilerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompilerKind::Gcc => "gcc",
            CompilerKind::Clang => "clang",
            CompilerKind::Rustc => "rustc",
            CompilerKind::Go => "go",
            CompilerKind::Generic => "generic",
        };
        f.write_str(name)
    }
}

/// Expand `{source}`/`{output}` placeholders in each argument
pub fn expand_placeholders(args: &[String], source: &str, output: &str) -> Vec<String> {
    args.iter()
        .map(|arg| {
            arg.replace(SOURCE_PLACEHOLDER, source)
                .replace(OUTPUT_PLACEHOLDER, output)
        })
        .collect()
}

/// `12.2.0-1ubuntu1` -> `12.2.0`; `2023-12-21` and `82e1608df` -> None
fn version_prefix(token: &str) -> Option<String> {
    let candidate = token
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .next()?
        .trim_end_matches('.');
    let parts: Vec<&str> = candidate.split('.').collect();
    let well_formed = parts.len() >= 2 && parts.iter().all(|p| !p.is_empty());
    well_formed.then(|| candidate.to_owned())
}

fn parse_flag_line(line: &str) -> Option<PossibleArgument> {
    let (name, description) = match line.find("  ") {
        Some(split) => (&line[..split], line[split..].trim()),
        None => match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        },
    };
    let name = name.trim().trim_end_matches(',');
    if name.len() < 2 {
        return None;
    }
    Some(PossibleArgument {
        name: name.to_owned(),
        description: description.to_owned(),
    })
}

/// `-C  opt-level=val -- optimization level` -> `-C opt-level=val`
fn parse_rustc_codegen_line(line: &str) -> Option<PossibleArgument> {
    let rest = line.strip_prefix("-C")?.trim_start();
    let (option, description) = match rest.split_once("--") {
        Some((option, description)) => (option.trim(), description.trim()),
        None => (rest.trim(), ""),
    };
    if option.is_empty() {
        return None;
    }
    Some(PossibleArgument {
        name: format!("-C {option}"),
        description: description.to_owned(),
    })
}

fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            // CSI sequences end at the first byte in '@'..='~'
            if chars.next() == Some('[') {
                for next in chars.by_ref() {
                    if ('@'..='~').contains(&next) {
                        break;
                    }
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}
