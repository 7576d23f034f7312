//! External command execution with a per-call timeout.

use crate::sync::SyncError;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// Runs the tools the system backends drive.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run `program` and return its stdout. A non-zero exit is an error
    /// carrying stderr.
    pub async fn run<S: AsRef<str>>(&self, program: &str, args: &[S]) -> Result<String, SyncError> {
        let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
        debug!(program, args = ?args, "running command");

        let mut command = Command::new(program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(SyncError::Io {
                    program: program.to_string(),
                    source: e,
                });
            }
            Err(_) => {
                return Err(SyncError::Timeout {
                    program: program.to_string(),
                    after: self.timeout,
                });
            }
        };

        if !output.status.success() {
            return Err(SyncError::Command {
                program: program.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Whether `program` exits successfully. Only spawn failures and
    /// timeouts are errors.
    pub async fn succeeds<S: AsRef<str>>(&self, program: &str, args: &[S]) -> Result<bool, SyncError> {
        match self.run(program, args).await {
            Ok(_) => Ok(true),
            Err(SyncError::Command { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn runner() -> CommandRunner {
        CommandRunner::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let out = runner().run("echo", &["hello"]).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_command_error() {
        let result = runner().run("false", &[] as &[&str]).await;
        assert!(matches!(result, Err(SyncError::Command { .. })));
        assert!(!runner().succeeds("false", &[] as &[&str]).await.unwrap());
        assert!(runner().succeeds("true", &[] as &[&str]).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_program_is_io_error() {
        let result = runner().run("l4plane-no-such-tool", &["x"]).await;
        assert!(matches!(result, Err(SyncError::Io { .. })));
    }

    #[tokio::test]
    async fn test_timeout() {
        let runner = CommandRunner::new(Duration::from_millis(50));
        let result = runner.run("sleep", &["5"]).await;
        assert!(matches!(result, Err(SyncError::Timeout { .. })));
    }
}
