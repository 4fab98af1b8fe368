//! Rebuild Orchestrator: turns rebuild requests into tasks and drives them
//!
//! `trigger` assembles the server's enabled rules, registers a PENDING task
//! and returns at once. A spawned worker then moves the task through
//! RUNNING to SUCCESS or FAILED based on what the Executor reports, bounded
//! by a wall-clock budget and a per-task CancellationToken.
//!
//! Every state change goes through the Task Registry, so a late executor
//! result for a task that was already cancelled or timed out is rejected
//! by the task state machine and simply logged.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::assembler::{assemble, AssembledScript, ScriptFormat};
use crate::config::RebuildConfig;
use crate::error::{EntityKind, OrchestratorError, Result};
use crate::executor::{ExecutionFailure, ExecutionPlan, Executor, ProgressReporter};
use crate::registry::{TaskFilter, TaskRegistry};
use crate::rule::RuleRecord;
use crate::rule_store::RuleStore;
use crate::stats::{self, RuleStats};
use crate::task::{RebuildTask, CANCELLED_MESSAGE};

pub const SHUTDOWN_MESSAGE: &str = "rebuild aborted: service shutting down";

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// How a worker's wait on the executor ended
enum Outcome {
    Applied,
    Failed(ExecutionFailure),
    TimedOut(Duration),
    /// Cancelled by a caller or by shutdown
    Interrupted,
}

struct Inner {
    registry: Arc<TaskRegistry>,
    rules: Arc<dyn RuleStore>,
    executor: Arc<dyn Executor>,
    settings: RebuildConfig,
    /// server id → task id holding the server's rebuild slot
    leases: DashMap<String, String>,
    /// task id → token of its in-flight worker
    cancels: DashMap<String, CancellationToken>,
    /// server id → fingerprint of the last successfully applied rule set
    fingerprints: DashMap<String, String>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct RebuildOrchestrator {
    inner: Arc<Inner>,
}

impl RebuildOrchestrator {
    pub fn new(
        registry: Arc<TaskRegistry>,
        rules: Arc<dyn RuleStore>,
        executor: Arc<dyn Executor>,
        settings: RebuildConfig,
    ) -> Self {
        info!(
            "Rebuild orchestrator ready (executor: {}, concurrent per server: {})",
            executor.name(),
            settings.allow_concurrent
        );
        Self {
            inner: Arc::new(Inner {
                registry,
                rules,
                executor,
                settings,
                leases: DashMap::new(),
                cancels: DashMap::new(),
                fingerprints: DashMap::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Create a PENDING rebuild task for `server_id` and start its worker.
    ///
    /// Fails without creating a task when the server is unknown, a rule does
    /// not compile, or (unless concurrent rebuilds are allowed) another
    /// rebuild for the server is still in flight.
    /// Must be called from within a Tokio runtime.
    pub fn trigger(&self, server_id: &str, force: bool) -> Result<RebuildTask> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(OrchestratorError::InvalidOperation(
                "service is shutting down".into(),
            ));
        }

        let rules = inner.rules.rules_for_server(server_id)?;
        let script = assemble(server_id, &rules, true, ScriptFormat::Plain)?;
        let total = u32::try_from(script.rule_count())
            .map_err(|_| OrchestratorError::Internal("rule count overflows u32".into()))?;

        let task = inner.register(RebuildTask::new(server_id, total, force, now()))?;

        let token = inner.shutdown.child_token();
        inner.cancels.insert(task.task_id.clone(), token.clone());

        let unchanged = !force
            && inner
                .fingerprints
                .get(server_id)
                .is_some_and(|fp| *fp == script.fingerprint);

        info!(
            "Rebuild task {} created for server {server_id} ({total} rules, force: {force})",
            task.task_id
        );

        let span = tracing::info_span!(
            "rebuild",
            task_id = %task.task_id,
            server_id = %server_id
        );
        tokio::spawn(
            Inner::run(inner.clone(), task.clone(), script, unchanged, token).instrument(span),
        );

        Ok(task)
    }

    /// Cancel a PENDING or RUNNING task. The task is FAILED on return; the
    /// worker is signalled and winds down on its own.
    pub fn cancel(&self, task_id: &str) -> Result<RebuildTask> {
        let task = self.inner.registry.update(task_id, |t| {
            t.cancel(now())?;
            Ok(t.clone())
        })?;

        if let Some(token) = self.inner.cancels.get(task_id) {
            token.cancel();
        }
        info!("Rebuild task {task_id} cancelled");
        Ok(task)
    }

    pub fn get_task(&self, task_id: &str) -> Result<RebuildTask> {
        self.inner.registry.get(task_id)
    }

    pub fn list_tasks(
        &self,
        filter: &TaskFilter,
        limit: usize,
        offset: usize,
    ) -> (Vec<RebuildTask>, usize) {
        self.inner.registry.list(filter, limit, offset)
    }

    /// A server's rules in script order
    pub fn server_rules(&self, server_id: &str) -> Result<Vec<RuleRecord>> {
        self.inner.rules.rules_for_server(server_id)
    }

    /// Assemble a script for preview; `include_disabled` keeps disabled rules
    pub fn preview(
        &self,
        server_id: &str,
        format: ScriptFormat,
        include_disabled: bool,
    ) -> Result<AssembledScript> {
        let rules = self.inner.rules.rules_for_server(server_id)?;
        assemble(server_id, &rules, !include_disabled, format)
    }

    /// Rule counts, for one server or for all of them
    pub fn stats(&self, server_id: Option<&str>) -> Result<RuleStats> {
        match server_id {
            Some(id) if !self.inner.rules.server_exists(id) => {
                Err(OrchestratorError::not_found(EntityKind::Server, id))
            }
            _ => Ok(stats::compute(&self.inner.rules.all_rules(), server_id)),
        }
    }

    pub fn active_tasks(&self) -> usize {
        self.inner.registry.active_count()
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.inner.registry
    }

    /// Stop accepting rebuilds, cancel every in-flight worker and wait up to
    /// `wait` for them to record their outcome.
    pub async fn shutdown(&self, wait: Duration) {
        self.inner.shutdown.cancel();
        let in_flight = self.inner.cancels.len();
        if in_flight > 0 {
            info!("Waiting for {in_flight} rebuild worker(s) to stop");
        }

        let drained = tokio::time::timeout(wait, async {
            while !self.inner.cancels.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} rebuild worker(s) still running at shutdown",
                self.inner.cancels.len()
            );
        }
    }
}

impl Inner {
    /// Register `task`, claiming the server's rebuild slot unless concurrent
    /// rebuilds are allowed. The lease entry stays locked until the task is
    /// in the registry, so a racing trigger always sees a registered holder.
    /// A slot held by a terminal task (e.g. cancelled, worker still winding
    /// down) is taken over.
    fn register(&self, task: RebuildTask) -> Result<RebuildTask> {
        if self.settings.allow_concurrent {
            return self.registry.create(task);
        }

        match self.leases.entry(task.server_id.clone()) {
            Entry::Occupied(mut slot) => {
                let holder = slot.get().clone();
                if !self.is_terminal(&holder) {
                    return Err(OrchestratorError::Conflict(format!(
                        "rebuild {holder} is already in progress for server {}",
                        task.server_id
                    )));
                }
                let task = self.registry.create(task)?;
                slot.insert(task.task_id.clone());
                Ok(task)
            }
            Entry::Vacant(slot) => {
                let task = self.registry.create(task)?;
                slot.insert(task.task_id.clone());
                Ok(task)
            }
        }
    }

    fn release(&self, task: &RebuildTask) {
        self.cancels.remove(&task.task_id);
        self.leases
            .remove_if(&task.server_id, |_, holder| *holder == task.task_id);
    }

    async fn run(
        self: Arc<Self>,
        task: RebuildTask,
        script: AssembledScript,
        unchanged: bool,
        token: CancellationToken,
    ) {
        let task_id = task.task_id.clone();

        if let Err(e) = self.registry.update(&task_id, |t| t.start()) {
            // Cancelled before the worker got to it
            debug!("Task {task_id} not started: {e}");
            self.release(&task);
            return;
        }

        let outcome = if unchanged {
            info!("Rule set unchanged since last successful rebuild, skipping executor");
            Outcome::Applied
        } else {
            // The host's tables are about to be flushed; until this rebuild
            // succeeds nothing is known to be applied
            self.fingerprints.remove(&task.server_id);
            info!("Applying {} rules via {}", task.total_rules, self.executor.name());
            self.execute(&task, &script, &token).await
        };

        self.settle(&task, &script, outcome);
        self.release(&task);
    }

    async fn execute(
        &self,
        task: &RebuildTask,
        script: &AssembledScript,
        token: &CancellationToken,
    ) -> Outcome {
        let plan = ExecutionPlan::from_script(&task.task_id, script);

        let registry = self.registry.clone();
        let task_id = task.task_id.clone();
        let progress = ProgressReporter::new(move |n| {
            match registry.update(&task_id, |t| Ok(t.record_progress(n))) {
                Ok(true) => debug!("{n} rules applied"),
                Ok(false) => debug!("Ignored progress report {n}"),
                Err(e) => warn!("Progress update failed: {e}"),
            }
        });

        let budget = self.settings.budget(task.total_rules);
        let mut apply = self.executor.apply(&plan, &progress, token);

        let first = tokio::select! {
            res = &mut apply => Some(res),
            _ = tokio::time::sleep(budget) => {
                token.cancel();
                None
            }
            _ = token.cancelled() => None,
        };

        let outcome = match first {
            Some(Ok(())) => return Outcome::Applied,
            Some(Err(_)) if token.is_cancelled() => return Outcome::Interrupted,
            Some(Err(failure)) => return Outcome::Failed(failure),
            None if self.shutdown.is_cancelled() || self.is_terminal(&task.task_id) => {
                Outcome::Interrupted
            }
            None => Outcome::TimedOut(budget),
        };

        // Give the executor a bounded chance to observe cancellation
        let grace = self.settings.cancel_grace();
        if tokio::time::timeout(grace, &mut apply).await.is_err() {
            warn!(
                "Executor did not stop within {}s, abandoning it",
                grace.as_secs()
            );
        }
        outcome
    }

    fn is_terminal(&self, task_id: &str) -> bool {
        self.registry
            .get(task_id)
            .map(|t| t.is_terminal())
            .unwrap_or(true)
    }

    /// Record the outcome. Terminal tasks reject the mutation, which is how
    /// late results are discarded.
    fn settle(&self, task: &RebuildTask, script: &AssembledScript, outcome: Outcome) {
        let task_id = task.task_id.as_str();
        let now = now();

        let recorded = match outcome {
            Outcome::Applied => self.registry.update(task_id, |t| t.succeed(now)).map(|_| {
                self.fingerprints
                    .insert(task.server_id.clone(), script.fingerprint.clone());
                info!("Rebuild succeeded");
            }),
            Outcome::Failed(failure) => self
                .registry
                .update(task_id, |t| {
                    let err = OrchestratorError::Execution(failure.message.clone());
                    t.record_progress(failure.processed);
                    t.fail(failure.failed, err.to_string(), now)
                })
                .map(|_| {
                    warn!(
                        "Rebuild failed after {} rules: {}",
                        failure.processed, failure.message
                    )
                }),
            Outcome::TimedOut(budget) => {
                let err = OrchestratorError::Timeout(format!(
                    "rebuild timed out after {}s",
                    budget.as_secs()
                ));
                self.registry
                    .update(task_id, |t| t.abort(err.to_string(), now))
                    .map(|_| warn!("{err}"))
            }
            Outcome::Interrupted => {
                let message = if self.shutdown.is_cancelled() {
                    SHUTDOWN_MESSAGE
                } else {
                    CANCELLED_MESSAGE
                };
                self.registry
                    .update(task_id, |t| t.abort(message, now))
                    .map(|_| info!("{message}"))
            }
        };

        if let Err(e) = recorded {
            debug!("Late result ignored: {e}");
        }
    }
}
