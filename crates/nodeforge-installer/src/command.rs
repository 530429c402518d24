//! External command execution

use crate::error::{InstallerError, Result};
use async_trait::async_trait;
use nodeforge_workflow::StepContext;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::process::Command;
use tracing::debug;

/// Captured output of a successful command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs external programs such as `systemctl`
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`; a non-zero exit is an error
    async fn run(&self, program: &str, args: &[&str], ctx: &StepContext) -> Result<CommandOutput>;
}

fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

/// [`CommandRunner`] backed by `tokio::process`
///
/// The child is killed if the context is cancelled or its deadline passes.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, program: &str, args: &[&str], ctx: &StepContext) -> Result<CommandOutput> {
        let line = command_line(program, args);
        debug!(command = %line, "Running command");

        let child = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = ctx
            .guard(child)
            .await?
            .map_err(|source| InstallerError::Spawn {
                command: line.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(InstallerError::Command {
                command: line,
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(CommandOutput { stdout, stderr })
    }
}

/// [`CommandRunner`] that records command lines instead of running them
///
/// Commands succeed with empty output unless a response or failure was
/// registered for a prefix of the command line.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    commands: Mutex<Vec<String>>,
    responses: HashMap<String, String>,
    failures: Vec<String>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `stdout` to commands starting with `prefix`
    pub fn respond(mut self, prefix: impl Into<String>, stdout: impl Into<String>) -> Self {
        self.responses.insert(prefix.into(), stdout.into());
        self
    }

    /// Fail commands starting with `prefix`
    pub fn fail_on(mut self, prefix: impl Into<String>) -> Self {
        self.failures.push(prefix.into());
        self
    }

    /// Command lines run so far
    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, program: &str, args: &[&str], ctx: &StepContext) -> Result<CommandOutput> {
        ctx.check()?;
        let line = command_line(program, args);
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(line.clone());

        if self.failures.iter().any(|p| line.starts_with(p.as_str())) {
            return Err(InstallerError::Command {
                command: line,
                status: "exit status: 1".to_string(),
                stderr: "scripted failure".to_string(),
            });
        }

        let stdout = self
            .responses
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default();
        Ok(CommandOutput {
            stdout,
            stderr: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tokio_runner_captures_stdout() {
        let output = TokioCommandRunner
            .run("sh", &["-c", "echo hello"], &StepContext::new())
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_tokio_runner_nonzero_exit() {
        let err = TokioCommandRunner
            .run("sh", &["-c", "echo nope >&2; exit 3"], &StepContext::new())
            .await
            .unwrap_err();

        match err {
            InstallerError::Command { command, stderr, .. } => {
                assert!(command.starts_with("sh -c"));
                assert_eq!(stderr, "nope");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_tokio_runner_missing_program() {
        let err = TokioCommandRunner
            .run("nodeforge-definitely-missing", &[], &StepContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InstallerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_tokio_runner_cancelled() {
        let ctx = StepContext::new();
        ctx.cancellation().cancel();
        let err = TokioCommandRunner
            .run("sleep", &["30"], &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, InstallerError::Cancelled));
    }

    #[tokio::test]
    async fn test_recording_runner() {
        let runner = RecordingRunner::new()
            .respond("systemctl is-active", "active\n")
            .fail_on("systemctl disable");
        let ctx = StepContext::new();

        let out = runner.run("systemctl", &["is-active", "k3s"], &ctx).await.unwrap();
        assert_eq!(out.stdout, "active\n");
        assert!(runner.run("systemctl", &["disable", "k3s"], &ctx).await.is_err());
        assert_eq!(
            runner.commands(),
            vec!["systemctl is-active k3s", "systemctl disable k3s"]
        );
    }
}
