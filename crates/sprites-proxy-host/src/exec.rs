//! Remote command execution primitive.
//!
//! Every interaction with the sandbox (probing, uploading, launching,
//! stopping) goes through [`RemoteExec::exec`]: one shell command string in,
//! captured output and exit code out.

use sprites_proxy_core::ProxyResult;
use tokio::process::Command;
use tracing::trace;

/// Captured result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the backend cannot determine the exit status.
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs shell commands inside a sandbox.
#[allow(async_fn_in_trait)]
pub trait RemoteExec: Send + Sync {
    /// Run `command` through a POSIX shell and capture its output.
    async fn exec(&self, command: &str) -> ProxyResult<CommandOutput>;
}

impl<T: RemoteExec> RemoteExec for &T {
    async fn exec(&self, command: &str) -> ProxyResult<CommandOutput> {
        (**self).exec(command).await
    }
}

/// Executes commands on the local machine with `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct LocalShell;

impl RemoteExec for LocalShell {
    async fn exec(&self, command: &str) -> ProxyResult<CommandOutput> {
        trace!(command, "sh -c");
        let output = Command::new("sh").arg("-c").arg(command).output().await?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }
}

/// Quote `s` as a single POSIX shell word.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
