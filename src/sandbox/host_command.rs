//! Running runtime CLIs (e.g. `ignite`) on the host and capturing their
//! result.

use std::ffi::OsStr;
use std::process::Stdio;

use crate::sandbox::error::SandboxError;

/// Captured result of one host command.
#[derive(Debug)]
pub struct HostCommandResult {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl HostCommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    /// One-line description of a failed run, for error messages.
    pub fn failure_summary(&self) -> String {
        let stderr = self.stderr_string();
        match (self.exit_code, stderr.is_empty()) {
            (Some(code), true) => format!("exit code {code}"),
            (Some(code), false) => format!("exit code {code}: {stderr}"),
            (None, true) => "terminated by signal".to_string(),
            (None, false) => format!("terminated by signal: {stderr}"),
        }
    }
}

/// Run `program args...` to completion with stdin closed.
///
/// Only a spawn failure is an error here; callers decide what a nonzero
/// exit means.
pub async fn run<I, S>(program: impl AsRef<OsStr>, args: I) -> Result<HostCommandResult, SandboxError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await?;

    Ok(HostCommandResult {
        exit_code: output.status.code(),
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

/// Escape a string for safe interpolation into a remote shell command line.
///
/// Single-quotes the value and rewrites embedded single quotes with the
/// `'\''` idiom, so `$`, backticks, `\` and `"` all stay literal.
pub fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.' || b == b'/') {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}
