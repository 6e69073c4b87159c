//! Invocation of external command-line tools.
//!
//! Every call is logged with its full command line, run to completion, and
//! its output captured. A non-zero exit becomes [`ToolError::Failed`]
//! carrying the tool's diagnostic output.

use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Upper bound on diagnostic text kept from a failed tool.
const MAX_DIAGNOSTIC_BYTES: usize = 8 * 1024;

/// Errors from running an external tool.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{tool} is not installed at {path:?}")]
    NotInstalled { tool: String, path: PathBuf },

    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("{tool} exited with {status}: {diagnostics}")]
    Failed {
        tool: String,
        status: String,
        diagnostics: String,
    },

    #[error("{tool} i/o error: {source}")]
    Io {
        tool: String,
        #[source]
        source: io::Error,
    },
}

impl ToolError {
    /// Build a failure for a tool that ran but rejected its input.
    pub fn failed(tool: &str, status: impl Into<String>, diagnostics: impl Into<String>) -> Self {
        Self::Failed {
            tool: tool.to_string(),
            status: status.into(),
            diagnostics: diagnostics.into(),
        }
    }

    /// Diagnostic output captured from the tool, if it ran.
    pub fn diagnostics(&self) -> String {
        match self {
            Self::Failed { diagnostics, .. } => diagnostics.clone(),
            other => other.to_string(),
        }
    }
}

/// Fail with [`ToolError::NotInstalled`] unless `path` is a file.
pub fn ensure_installed(tool: &str, path: &Path) -> Result<(), ToolError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ToolError::NotInstalled {
            tool: tool.to_string(),
            path: path.to_path_buf(),
        })
    }
}

/// A single external tool invocation.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    tool: &'static str,
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(String, String)>,
}

impl ToolCommand {
    pub fn new(tool: &'static str, program: impl Into<PathBuf>) -> Self {
        Self {
            tool,
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Append `flag` when `enabled`.
    pub fn flag_if(self, enabled: bool, flag: &str) -> Self {
        if enabled {
            self.arg(flag)
        } else {
            self
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn tool(&self) -> &'static str {
        self.tool
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    pub fn environment(&self) -> &[(String, String)] {
        &self.envs
    }

    /// The command line as a shell would show it, for logs.
    pub fn command_line(&self) -> String {
        let mut parts: Vec<String> = self
            .envs
            .iter()
            .map(|(k, v)| format!("{k}={}", shell_quote(v)))
            .collect();
        parts.push(shell_quote(&self.program.to_string_lossy()));
        parts.extend(self.args.iter().map(|a| shell_quote(&a.to_string_lossy())));
        parts.join(" ")
    }

    /// Run to completion and return stdout.
    pub async fn output(&self) -> Result<Vec<u8>, ToolError> {
        debug!(tool = self.tool, command = %self.command_line(), "Running external tool");

        let output = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| match source.kind() {
                io::ErrorKind::NotFound => ToolError::NotInstalled {
                    tool: self.tool.to_string(),
                    path: self.program.clone(),
                },
                _ => ToolError::Spawn {
                    tool: self.tool.to_string(),
                    source,
                },
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let diagnostics = if stderr.trim().is_empty() {
                stdout.trim()
            } else {
                stderr.trim()
            };
            return Err(ToolError::failed(
                self.tool,
                output.status.to_string(),
                truncate_diagnostics(diagnostics),
            ));
        }

        Ok(output.stdout)
    }

    /// Run to completion, discarding stdout.
    pub async fn run(&self) -> Result<(), ToolError> {
        self.output().await.map(|_| ())
    }
}

/// Keep the tail of long diagnostics; tools print the cause last.
fn truncate_diagnostics(text: &str) -> String {
    if text.len() <= MAX_DIAGNOSTIC_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - MAX_DIAGNOSTIC_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+%".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_quotes_unsafe_arguments() {
        let cmd = ToolCommand::new("cosign", "/opt/assets/cosign")
            .args(["sign", "-d"])
            .arg("has space")
            .env("COSIGN_REPOSITORY", "127.0.0.1:7777/local");
        assert_eq!(
            cmd.command_line(),
            "COSIGN_REPOSITORY=127.0.0.1:7777/local /opt/assets/cosign sign -d 'has space'"
        );
    }

    #[test]
    fn flag_if_only_appends_when_enabled() {
        let cmd = ToolCommand::new("oras", "oras")
            .flag_if(false, "--plain-http")
            .flag_if(true, "--debug");
        assert_eq!(cmd.arguments(), &[OsString::from("--debug")]);
    }

    #[test]
    fn long_diagnostics_keep_the_tail() {
        let text = format!("{}END", "x".repeat(MAX_DIAGNOSTIC_BYTES * 2));
        let truncated = truncate_diagnostics(&text);
        assert!(truncated.starts_with("..."));
        assert!(truncated.ends_with("END"));
    }

    #[test]
    fn missing_tool_is_not_installed() {
        let err = ensure_installed("crane", Path::new("/nonexistent/crane")).unwrap_err();
        assert!(matches!(err, ToolError::NotInstalled { .. }));
    }

    #[tokio::test]
    async fn captures_stdout_on_success() {
        let out = ToolCommand::new("sh", "sh")
            .args(["-c", "printf hello"])
            .output()
            .await
            .unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let err = ToolCommand::new("sh", "sh")
            .args(["-c", "echo boom >&2; exit 3"])
            .run()
            .await
            .unwrap_err();
        match err {
            ToolError::Failed { diagnostics, .. } => assert_eq!(diagnostics, "boom"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unknown_program_is_not_installed() {
        let err = ToolCommand::new("oras", "/nonexistent/oras")
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotInstalled { .. }));
    }

    #[tokio::test]
    async fn environment_is_passed_through() {
        let out = ToolCommand::new("sh", "sh")
            .args(["-c", "printf %s \"$COSIGN_REPOSITORY\""])
            .env("COSIGN_REPOSITORY", "staging")
            .output()
            .await
            .unwrap();
        assert_eq!(out, b"staging");
    }
}
