//! Integration tests for the rebuild lifecycle
//!
//! Drives RebuildOrchestrator end to end with a scripted executor:
//! - success, executor failure and timeout outcomes
//! - cancellation, including late executor results
//! - per-server single flight and the unchanged-rules short-circuit
//! - shutdown

mod common;

use std::time::Duration;

use common::{orchestrator, orchestrator_with, settings, wait_running, wait_terminal};
use common::{Script, ScriptedExecutor};
use fwrebuild::config::RebuildConfig;
use fwrebuild::orchestrator::SHUTDOWN_MESSAGE;
use fwrebuild::task::CANCELLED_MESSAGE;
use fwrebuild::{InMemoryRuleStore, RebuildOrchestrator, RuleRecord, TaskRegistry, TaskStatus};
use std::sync::Arc;

// ============================================================================
// Outcomes
// ============================================================================

#[tokio::test]
async fn test_enabled_rules_rebuild_to_success() {
    let orch = orchestrator(ScriptedExecutor::new(Script::Succeed));

    let task = orch.trigger("S1", false).unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.total_rules, 3);
    assert_eq!(task.processed_rules, 0);

    let done = wait_terminal(&orch, &task.task_id).await;
    assert_eq!(done.status, TaskStatus::Success);
    assert_eq!(done.processed_rules, 3);
    assert_eq!(done.failed_rules, 0);
    assert!(done.error_message.is_none());
    assert!(done.completed_at.is_some());
}

#[tokio::test]
async fn test_executor_failure_keeps_partial_progress() {
    let orch = orchestrator(ScriptedExecutor::new(Script::FailAt {
        index: 1,
        message: "iptables: Bad rule".into(),
    }));

    let task = orch.trigger("S1", false).unwrap();
    let done = wait_terminal(&orch, &task.task_id).await;

    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(done.processed_rules, 1);
    assert_eq!(done.failed_rules, 1);
    assert_eq!(done.error_message.as_deref(), Some("iptables: Bad rule"));
    assert!(done.completed_at.is_some());
}

#[tokio::test]
async fn test_budget_exceeded_fails_with_timeout() {
    let settings = RebuildConfig {
        base_timeout_secs: 1,
        per_rule_timeout_secs: 0,
        cancel_grace_secs: 0,
        ..RebuildConfig::default()
    };
    let orch = orchestrator_with(ScriptedExecutor::new(Script::Hang), settings);

    let task = orch.trigger("S1", false).unwrap();
    let done = wait_terminal(&orch, &task.task_id).await;

    assert_eq!(done.status, TaskStatus::Failed);
    let message = done.error_message.unwrap();
    assert!(message.starts_with("rebuild timed out"), "{message}");
    assert_eq!(done.processed_rules, 1);
    assert_eq!(done.failed_rules, 2);
}

#[tokio::test]
async fn test_uncompilable_rules_create_no_task() {
    let store = InMemoryRuleStore::new();
    store.upsert(RuleRecord::new(1, "S1", "INPUT", "ACCEPT"));
    store.upsert(RuleRecord::new(2, "S1", "INPUT", "TELEPORT"));
    let orch = RebuildOrchestrator::new(
        Arc::new(TaskRegistry::new()),
        Arc::new(store),
        ScriptedExecutor::new(Script::Succeed),
        settings(),
    );

    let err = orch.trigger("S1", false).unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
    assert!(orch.registry().is_empty());
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_right_after_trigger() {
    let orch = orchestrator(ScriptedExecutor::new(Script::Block));

    let task = orch.trigger("S1", false).unwrap();
    let cancelled = orch.cancel(&task.task_id).unwrap();
    assert_eq!(cancelled.status, TaskStatus::Failed);
    assert_eq!(cancelled.error_message.as_deref(), Some(CANCELLED_MESSAGE));
    assert!(cancelled.completed_at.is_some());

    // Nothing the worker does afterwards changes the outcome
    tokio::time::sleep(Duration::from_millis(100)).await;
    let after = orch.get_task(&task.task_id).unwrap();
    assert_eq!(after, cancelled);
}

#[tokio::test]
async fn test_cancel_running_task_counts_unapplied_rules() {
    let orch = orchestrator(ScriptedExecutor::new(Script::Block));

    let task = orch.trigger("S1", false).unwrap();
    let running = wait_running(&orch, &task.task_id).await;
    assert_eq!(running.status, TaskStatus::Running);

    let cancelled = orch.cancel(&task.task_id).unwrap();
    assert_eq!(cancelled.processed_rules, 1);
    assert_eq!(cancelled.failed_rules, 2);
}

#[tokio::test]
async fn test_cancel_terminal_task_is_invalid() {
    let orch = orchestrator(ScriptedExecutor::new(Script::Succeed));

    let task = orch.trigger("S2", false).unwrap();
    wait_terminal(&orch, &task.task_id).await;

    let err = orch.cancel(&task.task_id).unwrap_err();
    assert_eq!(err.code(), "INVALID_OPERATION");
    assert_eq!(
        orch.get_task(&task.task_id).unwrap().status,
        TaskStatus::Success
    );
}

#[tokio::test]
async fn test_late_success_after_cancel_is_ignored() {
    let orch = orchestrator(ScriptedExecutor::new(Script::SucceedLate {
        delay: Duration::from_millis(200),
    }));

    let task = orch.trigger("S1", false).unwrap();
    wait_running(&orch, &task.task_id).await;
    orch.cancel(&task.task_id).unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    let after = orch.get_task(&task.task_id).unwrap();
    assert_eq!(after.status, TaskStatus::Failed);
    assert_eq!(after.error_message.as_deref(), Some(CANCELLED_MESSAGE));
    assert_eq!(after.processed_rules, 0);
}

// ============================================================================
// Per-server policy
// ============================================================================

#[tokio::test]
async fn test_second_rebuild_for_busy_server_conflicts() {
    let orch = orchestrator(ScriptedExecutor::new(Script::Block));

    let first = orch.trigger("S1", false).unwrap();
    let err = orch.trigger("S1", false).unwrap_err();
    assert_eq!(err.code(), "CONFLICT");

    // Other servers are unaffected
    let other = orch.trigger("S2", false).unwrap();
    assert_ne!(other.task_id, first.task_id);

    // Cancelling frees the slot straight away
    orch.cancel(&first.task_id).unwrap();
    let next = orch.trigger("S1", false).unwrap();
    assert_eq!(next.status, TaskStatus::Pending);
    assert_eq!(orch.registry().len(), 3);

    orch.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_concurrent_rebuilds_when_allowed() {
    let settings = RebuildConfig {
        allow_concurrent: true,
        ..settings()
    };
    let orch = orchestrator_with(ScriptedExecutor::new(Script::Block), settings);

    orch.trigger("S1", false).unwrap();
    orch.trigger("S1", false).unwrap();
    assert_eq!(orch.active_tasks(), 2);

    orch.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_unchanged_rules_short_circuit_unless_forced() {
    let executor = ScriptedExecutor::new(Script::Succeed);
    let orch = orchestrator(executor.clone());

    let first = orch.trigger("S1", false).unwrap();
    wait_terminal(&orch, &first.task_id).await;
    assert_eq!(executor.calls(), 1);

    let repeat = orch.trigger("S1", false).unwrap();
    assert_eq!(repeat.status, TaskStatus::Pending);
    let repeat = wait_terminal(&orch, &repeat.task_id).await;
    assert_eq!(repeat.status, TaskStatus::Success);
    assert_eq!(repeat.processed_rules, 3);
    assert_eq!(executor.calls(), 1);

    let forced = orch.trigger("S1", true).unwrap();
    assert!(forced.force);
    assert_eq!(forced.total_rules, 3);
    wait_terminal(&orch, &forced.task_id).await;
    assert_eq!(executor.calls(), 2);
}

#[tokio::test]
async fn test_failed_rebuild_is_not_short_circuited() {
    let executor = ScriptedExecutor::new(Script::FailAt {
        index: 0,
        message: "connection refused".into(),
    });
    let orch = orchestrator(executor.clone());

    for _ in 0..2 {
        let task = orch.trigger("S2", false).unwrap();
        let done = wait_terminal(&orch, &task.task_id).await;
        assert_eq!(done.status, TaskStatus::Failed);
    }
    assert_eq!(executor.calls(), 2);
}

#[tokio::test]
async fn test_rules_reapplied_after_failed_forced_rebuild() {
    let executor = ScriptedExecutor::new(Script::FailOnCall { call: 2 });
    let orch = orchestrator(executor.clone());

    let applied = orch.trigger("S1", false).unwrap();
    let applied = wait_terminal(&orch, &applied.task_id).await;
    assert_eq!(applied.status, TaskStatus::Success);

    // The failed flush leaves the host's tables in an unknown state
    let forced = orch.trigger("S1", true).unwrap();
    let forced = wait_terminal(&orch, &forced.task_id).await;
    assert_eq!(forced.status, TaskStatus::Failed);
    assert_eq!(forced.error_message.as_deref(), Some("iptables: flush refused"));

    let retry = orch.trigger("S1", false).unwrap();
    let retry = wait_terminal(&orch, &retry.task_id).await;
    assert_eq!(retry.status, TaskStatus::Success);
    assert_eq!(executor.calls(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_triggers_admit_one_rebuild() {
    for _ in 0..100 {
        let orch = orchestrator(ScriptedExecutor::new(Script::Block));
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let racers: Vec<_> = (0..2)
            .map(|_| {
                let orch = orch.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    orch.trigger("S1", false)
                })
            })
            .collect();

        let mut accepted = 0;
        for racer in racers {
            match racer.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(e) => assert_eq!(e.code(), "CONFLICT"),
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(orch.registry().len(), 1);

        orch.shutdown(Duration::from_secs(2)).await;
    }
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_aborts_in_flight_rebuilds() {
    let orch = orchestrator(ScriptedExecutor::new(Script::Block));

    let task = orch.trigger("S1", false).unwrap();
    wait_running(&orch, &task.task_id).await;

    orch.shutdown(Duration::from_secs(2)).await;

    let done = orch.get_task(&task.task_id).unwrap();
    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(done.error_message.as_deref(), Some(SHUTDOWN_MESSAGE));
    assert_eq!(orch.active_tasks(), 0);
}
