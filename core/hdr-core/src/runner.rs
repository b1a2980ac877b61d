//! Shell command seam.
//!
//! Everything that leaves the process (package manager, aapt, dumpsys,
//! getprop, reboot) goes through a [`CommandRunner`]. Runners never fail:
//! spawn errors and bad exits are folded into an [`ExecOutput`] with a
//! non-zero `errno`, so callers only ever branch on data.

use futures::future::{BoxFuture, FutureExt};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub errno: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            errno: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            errno: 1,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.errno == 0
    }
}

/// Executes a shell command string.
///
/// Synchronous runners (plain closures) are accepted through the blanket impl
/// below and are wrapped in a ready future.
pub trait CommandRunner: Send + Sync {
    fn exec<'a>(&'a self, command: &'a str) -> BoxFuture<'a, ExecOutput>;
}

impl<F> CommandRunner for F
where
    F: Fn(&str) -> ExecOutput + Send + Sync,
{
    fn exec<'a>(&'a self, command: &'a str) -> BoxFuture<'a, ExecOutput> {
        futures::future::ready(self(command)).boxed()
    }
}

/// Runs commands through `sh -c`, as the module's WebView bridge does.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl ShellRunner {
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl CommandRunner for ShellRunner {
    fn exec<'a>(&'a self, command: &'a str) -> BoxFuture<'a, ExecOutput> {
        async move {
            let output = Command::new(&self.shell)
                .arg("-c")
                .arg(command)
                .stdin(Stdio::null())
                .output()
                .await;

            match output {
                Ok(output) => ExecOutput {
                    errno: output.status.code().unwrap_or(1),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                },
                Err(err) => {
                    debug!(command, error = %err, "Failed to spawn shell command");
                    ExecOutput::failed(err.to_string())
                }
            }
        }
        .boxed()
    }
}

/// Quotes a value for interpolation inside a double-quoted shell word.
pub fn shell_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for ch in value.chars() {
        if matches!(ch, '"' | '\\' | '$' | '`') {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}
