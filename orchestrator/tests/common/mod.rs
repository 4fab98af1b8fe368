//! Shared fixtures: a scripted executor and orchestrator builders

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use fwrebuild::config::RebuildConfig;
use fwrebuild::{
    ExecutionFailure, ExecutionPlan, Executor, InMemoryRuleStore, ProgressReporter,
    RebuildOrchestrator, RebuildTask, TaskRegistry, TaskStatus,
};

pub const RULES: &str = r#"
[[rules]]
id = 1
serverId = "S1"
chain = "INPUT"
action = "ACCEPT"
protocol = "tcp"
destPort = 22
priority = 20

[[rules]]
id = 2
serverId = "S1"
table = "nat"
chain = "PREROUTING"
action = "DNAT"
protocol = "tcp"
destIp = "192.168.1.100"
destPort = 8080
priority = 5

[[rules]]
id = 3
serverId = "S1"
chain = "INPUT"
action = "DROP"
priority = 10

[[rules]]
id = 4
serverId = "S1"
chain = "OUTPUT"
action = "ACCEPT"
isEnabled = false

[[rules]]
id = 10
serverId = "S2"
chain = "FORWARD"
action = "ACCEPT"
interface = "eth1"
"#;

/// What the scripted executor does with a plan
#[derive(Debug, Clone)]
pub enum Script {
    /// Report every command, then succeed
    Succeed,
    /// Apply `index` commands, then fail the next one
    FailAt { index: u32, message: String },
    /// Apply the first command, then wait for cancellation
    Block,
    /// Apply the first command, then hang ignoring cancellation
    Hang,
    /// Ignore cancellation and succeed after `delay`
    SucceedLate { delay: Duration },
    /// Fail the flush on the `call`th invocation (1-based), succeed otherwise
    FailOnCall { call: u32 },
}

pub struct ScriptedExecutor {
    script: Script,
    pub calls: AtomicU32,
}

impl ScriptedExecutor {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn apply(
        &self,
        plan: &ExecutionPlan,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutionFailure> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let total = plan.commands.len() as u32;

        match &self.script {
            Script::Succeed => {
                for n in 1..=total {
                    progress.report(n);
                }
                Ok(())
            }
            Script::FailAt { index, message } => {
                for n in 1..=*index {
                    progress.report(n);
                }
                Err(ExecutionFailure::new(*index, 1, message.clone()))
            }
            Script::Block => {
                progress.report(1);
                cancel.cancelled().await;
                Err(ExecutionFailure::cancelled(1))
            }
            Script::Hang => {
                progress.report(1);
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            Script::SucceedLate { delay } => {
                tokio::time::sleep(*delay).await;
                for n in 1..=total {
                    progress.report(n);
                }
                Ok(())
            }
            Script::FailOnCall { call: failing } if call == *failing => {
                Err(ExecutionFailure::new(0, 1, "iptables: flush refused"))
            }
            Script::FailOnCall { .. } => {
                for n in 1..=total {
                    progress.report(n);
                }
                Ok(())
            }
        }
    }
}

pub fn rule_store() -> Arc<InMemoryRuleStore> {
    Arc::new(InMemoryRuleStore::from_toml_str(RULES).unwrap())
}

pub fn settings() -> RebuildConfig {
    RebuildConfig {
        cancel_grace_secs: 1,
        ..RebuildConfig::default()
    }
}

pub fn orchestrator_with(
    executor: Arc<dyn Executor>,
    settings: RebuildConfig,
) -> RebuildOrchestrator {
    RebuildOrchestrator::new(
        Arc::new(TaskRegistry::new()),
        rule_store(),
        executor,
        settings,
    )
}

pub fn orchestrator(executor: Arc<dyn Executor>) -> RebuildOrchestrator {
    orchestrator_with(executor, settings())
}

/// Poll until the task is terminal
pub async fn wait_terminal(orch: &RebuildOrchestrator, task_id: &str) -> RebuildTask {
    for _ in 0..500 {
        let task = orch.get_task(task_id).unwrap();
        if task.is_terminal() {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} never reached a terminal state");
}

/// Poll until the task has left PENDING
pub async fn wait_running(orch: &RebuildOrchestrator, task_id: &str) -> RebuildTask {
    for _ in 0..500 {
        let task = orch.get_task(task_id).unwrap();
        if task.status != TaskStatus::Pending {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} never started");
}
