//! Executor collaborator: applies a compiled script to a server
//!
//! The orchestrator only knows the `Executor` trait. Built-ins:
//! - `DryRunExecutor`: logs every command, never touches a host
//! - `SshExecutor`: runs each command on the target over `ssh`

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assembler::AssembledScript;

/// Everything an executor needs for one rebuild
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub task_id: String,
    pub server_id: String,
    /// Flush commands, run before any rule
    pub preamble: Vec<String>,
    /// One command per rule, in application order
    pub commands: Vec<String>,
}

impl ExecutionPlan {
    pub fn from_script(task_id: &str, script: &AssembledScript) -> Self {
        Self {
            task_id: task_id.to_string(),
            server_id: script.server_id.clone(),
            preamble: script.preamble.clone(),
            commands: script.commands(),
        }
    }
}

/// Callback through which executors report how many rule commands are applied
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn Fn(u32) + Send + Sync>,
}

impl ProgressReporter {
    pub fn new(sink: impl Fn(u32) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn report(&self, processed: u32) {
        (self.sink)(processed);
    }
}

/// Why an executor gave up, and how far it got
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ExecutionFailure {
    /// Rule commands applied before the failure
    pub processed: u32,
    /// Rule commands that failed
    pub failed: u32,
    pub message: String,
}

impl ExecutionFailure {
    pub fn new(processed: u32, failed: u32, message: impl Into<String>) -> Self {
        Self {
            processed,
            failed,
            message: message.into(),
        }
    }

    pub fn cancelled(processed: u32) -> Self {
        Self::new(processed, 0, "execution cancelled")
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    /// Apply `plan`, reporting progress after each rule command.
    /// Implementations should stop promptly once `cancel` fires.
    async fn apply(
        &self,
        plan: &ExecutionPlan,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutionFailure>;
}

/// Logs commands instead of running them
pub struct DryRunExecutor {
    delay: Duration,
}

impl DryRunExecutor {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for DryRunExecutor {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

#[async_trait]
impl Executor for DryRunExecutor {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn apply(
        &self,
        plan: &ExecutionPlan,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutionFailure> {
        for cmd in &plan.preamble {
            info!("[dry-run {}] {cmd}", plan.server_id);
        }

        for (i, cmd) in plan.commands.iter().enumerate() {
            let done = i as u32;
            if !self.delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ExecutionFailure::cancelled(done)),
                    _ = tokio::time::sleep(self.delay) => {}
                }
            } else if cancel.is_cancelled() {
                return Err(ExecutionFailure::cancelled(done));
            }
            info!("[dry-run {}] {cmd}", plan.server_id);
            progress.report(done + 1);
        }
        Ok(())
    }
}

/// Runs each command as `ssh <options> <target> -- <command>`
pub struct SshExecutor {
    ssh_binary: String,
    options: Vec<String>,
    targets: HashMap<String, String>,
    command_timeout: Duration,
}

impl SshExecutor {
    pub fn new(
        ssh_binary: &str,
        options: Vec<String>,
        targets: HashMap<String, String>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            ssh_binary: ssh_binary.to_string(),
            options,
            targets,
            command_timeout,
        }
    }

    /// Run one command remotely; `Err` carries a human-readable cause
    async fn run_remote(
        &self,
        target: &str,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<(), String> {
        let mut cmd = Command::new(&self.ssh_binary);
        cmd.args(&self.options)
            .arg(target)
            .arg("--")
            .arg(command)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err("execution cancelled".to_string()),
            res = tokio::time::timeout(self.command_timeout, cmd.output()) => match res {
                Err(_) => {
                    return Err(format!(
                        "'{command}' timed out after {}s",
                        self.command_timeout.as_secs()
                    ))
                }
                Ok(Err(e)) => return Err(format!("failed to spawn {}: {e}", self.ssh_binary)),
                Ok(Ok(output)) => output,
            },
        };

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output
            .status
            .code()
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        Err(format!(
            "'{command}' exited with {code}: {}",
            stderr.trim()
        ))
    }
}

#[async_trait]
impl Executor for SshExecutor {
    fn name(&self) -> &str {
        "ssh"
    }

    async fn apply(
        &self,
        plan: &ExecutionPlan,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutionFailure> {
        let target = self.targets.get(&plan.server_id).ok_or_else(|| {
            ExecutionFailure::new(
                0,
                1,
                format!("no ssh target configured for server {}", plan.server_id),
            )
        })?;

        for cmd in &plan.preamble {
            debug!("[{}] {cmd}", plan.server_id);
            if let Err(e) = self.run_remote(target, cmd, cancel).await {
                warn!("Flush failed on {}: {e}", plan.server_id);
                return Err(ExecutionFailure::new(0, 1, e));
            }
        }

        for (i, cmd) in plan.commands.iter().enumerate() {
            let done = i as u32;
            debug!("[{}] {cmd}", plan.server_id);
            if let Err(e) = self.run_remote(target, cmd, cancel).await {
                if cancel.is_cancelled() {
                    return Err(ExecutionFailure::cancelled(done));
                }
                warn!("Rule command failed on {}: {e}", plan.server_id);
                return Err(ExecutionFailure::new(done, 1, e));
            }
            progress.report(done + 1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn plan(commands: &[&str]) -> ExecutionPlan {
        ExecutionPlan {
            task_id: "t1".into(),
            server_id: "S1".into(),
            preamble: vec!["iptables -F".into()],
            commands: commands.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn counting_reporter() -> (ProgressReporter, Arc<AtomicU32>) {
        let seen = Arc::new(AtomicU32::new(0));
        let sink = seen.clone();
        (
            ProgressReporter::new(move |n| {
                sink.store(n, Ordering::SeqCst);
            }),
            seen,
        )
    }

    #[tokio::test]
    async fn test_dry_run_reports_every_rule() {
        let exec = DryRunExecutor::default();
        let (reporter, seen) = counting_reporter();
        let cancel = CancellationToken::new();
        exec.apply(&plan(&["a", "b", "c"]), &reporter, &cancel)
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_dry_run_observes_cancellation() {
        let exec = DryRunExecutor::new(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = exec
            .apply(&plan(&["a", "b"]), &ProgressReporter::noop(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, ExecutionFailure::cancelled(0));
    }

    #[tokio::test]
    async fn test_ssh_missing_target() {
        let exec = SshExecutor::new("ssh", vec![], HashMap::new(), Duration::from_secs(1));
        let err = exec
            .apply(&plan(&["a"]), &ProgressReporter::noop(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.message.contains("no ssh target"));
        assert_eq!(err.processed, 0);
    }

    /// `true`/`false` stand in for ssh: they ignore their arguments
    #[cfg(unix)]
    #[tokio::test]
    async fn test_ssh_success_and_failure_via_stub_binary() {
        let targets = HashMap::from([("S1".to_string(), "root@host".to_string())]);

        let ok = SshExecutor::new("true", vec![], targets.clone(), Duration::from_secs(5));
        let (reporter, seen) = counting_reporter();
        ok.apply(&plan(&["x", "y"]), &reporter, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        let failing = SshExecutor::new("false", vec![], targets, Duration::from_secs(5));
        let err = failing
            .apply(&plan(&["x"]), &ProgressReporter::noop(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.processed, 0);
        assert_eq!(err.failed, 1);
        assert!(err.message.contains("exited with 1"));
    }

    #[tokio::test]
    async fn test_ssh_spawn_failure_is_reported() {
        let targets = HashMap::from([("S1".to_string(), "root@host".to_string())]);
        let exec = SshExecutor::new(
            "/nonexistent/ssh-binary",
            vec![],
            targets,
            Duration::from_secs(1),
        );
        let err = exec
            .apply(&plan(&["x"]), &ProgressReporter::noop(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.message.contains("failed to spawn"));
    }
}
