//! RebuildTask: one asynchronous application of a rule script to a server
//!
//! Tasks flow through: PENDING → RUNNING → SUCCESS/FAILED
//!
//! Every transition goes through a method here so the invariants hold no
//! matter who drives the task: terminal tasks never change,
//! `processed_rules` only grows and never passes `total_rules`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

pub const CANCELLED_MESSAGE: &str = "cancelled by user";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            other => Err(OrchestratorError::validation(
                "status",
                format!("unknown task status '{other}'"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildTask {
    pub task_id: String,
    pub server_id: String,
    pub status: TaskStatus,
    pub total_rules: u32,
    pub processed_rules: u32,
    pub failed_rules: u32,
    pub force: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Epoch seconds
    pub started_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

impl RebuildTask {
    pub fn new(server_id: &str, total_rules: u32, force: bool, now: i64) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            server_id: server_id.to_string(),
            status: TaskStatus::Pending,
            total_rules,
            processed_rules: 0,
            failed_rules: 0,
            force,
            error_message: None,
            started_at: now,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn ensure_active(&self, op: &str) -> Result<()> {
        if self.is_terminal() {
            return Err(OrchestratorError::InvalidOperation(format!(
                "cannot {op} task {}: already {}",
                self.task_id, self.status
            )));
        }
        Ok(())
    }

    /// PENDING → RUNNING
    pub fn start(&mut self) -> Result<()> {
        if self.status != TaskStatus::Pending {
            return Err(OrchestratorError::InvalidOperation(format!(
                "cannot start task {}: status is {}",
                self.task_id, self.status
            )));
        }
        self.status = TaskStatus::Running;
        Ok(())
    }

    /// Raise `processed_rules` to `processed` (clamped to the total).
    /// Returns whether the counter moved; stale or late reports are ignored.
    pub fn record_progress(&mut self, processed: u32) -> bool {
        if self.is_terminal() {
            return false;
        }
        let next = processed.min(self.total_rules);
        if next > self.processed_rules {
            self.processed_rules = next;
            true
        } else {
            false
        }
    }

    pub fn succeed(&mut self, now: i64) -> Result<()> {
        self.ensure_active("complete")?;
        self.status = TaskStatus::Success;
        self.processed_rules = self.total_rules;
        self.failed_rules = 0;
        self.error_message = None;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Command failure reported by the executor: at least one failed rule
    pub fn fail(&mut self, failed: u32, message: impl Into<String>, now: i64) -> Result<()> {
        self.ensure_active("fail")?;
        self.finish_failed(failed.max(1), message.into(), now);
        Ok(())
    }

    /// Abort without a command failure (timeout, cancellation, shutdown):
    /// every rule not yet applied counts as failed.
    pub fn abort(&mut self, message: impl Into<String>, now: i64) -> Result<()> {
        self.ensure_active("abort")?;
        let unapplied = self.total_rules - self.processed_rules;
        self.finish_failed(unapplied, message.into(), now);
        Ok(())
    }

    pub fn cancel(&mut self, now: i64) -> Result<()> {
        self.ensure_active("cancel")?;
        self.abort(CANCELLED_MESSAGE, now)
    }

    fn finish_failed(&mut self, failed: u32, message: String, now: i64) {
        self.status = TaskStatus::Failed;
        self.failed_rules = failed.min(self.total_rules);
        self.error_message = Some(message);
        self.completed_at = Some(now);
    }
}
