//! Task Registry: owns every RebuildTask ever created
//!
//! Storage: DashMap in-memory index + optional SQLite persistence.
//! When a db_path is provided, every create/update is written through so
//! task history survives service restarts. Tasks are never removed.
//!
//! A failed write in `create` rejects the task. A failed write in `update`
//! is logged at warn and the in-memory state still advances, so a running
//! rebuild is never stalled by storage. The persisted row then lags until
//! the task's next successful write, and a restart in between restores the
//! older state.
//!
//! Updates go through `update`, which runs the mutation on a copy while the
//! entry's shard lock is held and swaps it in only on success. Readers
//! therefore see either the old or the new task, never a half-applied one,
//! and unrelated tasks on other shards progress in parallel.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::error::{EntityKind, OrchestratorError, Result};
use crate::task::{RebuildTask, TaskStatus};

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 500;

pub const INTERRUPTED_MESSAGE: &str = "interrupted by service restart";

/// Listing filter; `None` fields match everything
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub server_id: Option<String>,
    pub status: Option<TaskStatus>,
}

impl TaskFilter {
    fn matches(&self, task: &RebuildTask) -> bool {
        self.server_id
            .as_deref()
            .map_or(true, |s| task.server_id == s)
            && self.status.map_or(true, |s| task.status == s)
    }
}

struct Entry {
    /// Creation order, breaks `started_at` ties when listing
    seq: u64,
    task: RebuildTask,
}

pub struct TaskRegistry {
    tasks: DashMap<String, Entry>,
    next_seq: AtomicU64,
    /// Optional SQLite connection for persistence (Mutex because Connection is !Sync)
    db: Option<Mutex<rusqlite::Connection>>,
}

impl TaskRegistry {
    /// In-memory registry
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
            next_seq: AtomicU64::new(0),
            db: None,
        }
    }

    /// Registry backed by SQLite at the given path.
    /// Creates the database if needed and loads every stored task. Tasks
    /// that were still PENDING/RUNNING lost their worker with the previous
    /// process and are finalised as FAILED.
    pub fn with_db(db_path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = rusqlite::Connection::open(db_path)?;
        db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS rebuild_tasks (
                task_id TEXT PRIMARY KEY,
                seq INTEGER NOT NULL,
                server_id TEXT NOT NULL,
                status TEXT NOT NULL,
                total_rules INTEGER NOT NULL,
                processed_rules INTEGER NOT NULL,
                failed_rules INTEGER NOT NULL,
                force INTEGER NOT NULL,
                error_message TEXT,
                started_at INTEGER NOT NULL,
                completed_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_rebuild_tasks_server ON rebuild_tasks(server_id);",
        )?;

        let tasks = DashMap::new();
        let mut max_seq = 0u64;
        let mut interrupted = Vec::new();
        {
            let mut stmt = db.prepare(
                "SELECT task_id, seq, server_id, status, total_rules, processed_rules, \
                 failed_rules, force, error_message, started_at, completed_at FROM rebuild_tasks",
            )?;
            let rows = stmt.query_map([], |row| {
                let status: String = row.get(3)?;
                Ok((
                    row.get::<_, i64>(1)?,
                    status,
                    RebuildTask {
                        task_id: row.get(0)?,
                        server_id: row.get(2)?,
                        status: TaskStatus::Pending,
                        total_rules: row.get(4)?,
                        processed_rules: row.get(5)?,
                        failed_rules: row.get(6)?,
                        force: row.get::<_, i64>(7)? != 0,
                        error_message: row.get(8)?,
                        started_at: row.get(9)?,
                        completed_at: row.get(10)?,
                    },
                ))
            })?;

            for row in rows {
                let (seq, status, mut task) = row?;
                task.status = status.parse().map_err(|_| {
                    OrchestratorError::Internal(format!(
                        "task {} has corrupt status '{status}'",
                        task.task_id
                    ))
                })?;
                if !task.is_terminal() {
                    task.abort(INTERRUPTED_MESSAGE, chrono::Utc::now().timestamp())?;
                    interrupted.push(task.clone());
                }
                let seq = seq.max(0) as u64;
                max_seq = max_seq.max(seq + 1);
                tasks.insert(task.task_id.clone(), Entry { seq, task });
            }
        }

        for task in &interrupted {
            let seq = tasks.get(&task.task_id).map(|e| e.seq).unwrap_or_default();
            write_task(&db, seq, task)?;
        }

        info!(
            "TaskRegistry loaded from {db_path}: {} tasks restored, {} interrupted",
            tasks.len(),
            interrupted.len()
        );

        Ok(Self {
            tasks,
            next_seq: AtomicU64::new(max_seq),
            db: Some(Mutex::new(db)),
        })
    }

    /// Register a freshly created task
    pub fn create(&self, task: RebuildTask) -> Result<RebuildTask> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        match self.tasks.entry(task.task_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(OrchestratorError::Internal(
                format!("duplicate task id {}", task.task_id),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                self.persist(seq, &task)?;
                slot.insert(Entry {
                    seq,
                    task: task.clone(),
                });
                Ok(task)
            }
        }
    }

    pub fn get(&self, task_id: &str) -> Result<RebuildTask> {
        self.tasks
            .get(task_id)
            .map(|e| e.task.clone())
            .ok_or_else(|| OrchestratorError::not_found(EntityKind::Task, task_id))
    }

    /// Apply `mutation` atomically. On error the stored task is unchanged.
    /// Persistence failures are logged, not returned.
    pub fn update<T, F>(&self, task_id: &str, mutation: F) -> Result<T>
    where
        F: FnOnce(&mut RebuildTask) -> Result<T>,
    {
        let mut entry = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| OrchestratorError::not_found(EntityKind::Task, task_id))?;

        let mut next = entry.task.clone();
        let out = mutation(&mut next)?;

        if next != entry.task {
            if let Err(e) = self.persist(entry.seq, &next) {
                warn!("Failed to persist task {task_id}: {e}");
            }
            entry.task = next;
        }
        Ok(out)
    }

    /// Tasks matching `filter`, newest first, plus the total match count
    pub fn list(
        &self,
        filter: &TaskFilter,
        limit: usize,
        offset: usize,
    ) -> (Vec<RebuildTask>, usize) {
        let mut matched: Vec<(i64, u64, RebuildTask)> = self
            .tasks
            .iter()
            .filter(|e| filter.matches(&e.task))
            .map(|e| (e.task.started_at, e.seq, e.task.clone()))
            .collect();

        matched.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));

        let total = matched.len();
        let limit = match limit {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };

        let page = matched
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(_, _, task)| task)
            .collect();

        (page, total)
    }

    /// The newest non-terminal task for a server, if any
    pub fn active_for_server(&self, server_id: &str) -> Option<RebuildTask> {
        self.tasks
            .iter()
            .filter(|e| e.task.server_id == server_id && !e.task.is_terminal())
            .max_by_key(|e| e.seq)
            .map(|e| e.task.clone())
    }

    /// Count of non-terminal tasks
    pub fn active_count(&self) -> usize {
        self.tasks.iter().filter(|e| !e.task.is_terminal()).count()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn persist(&self, seq: u64, task: &RebuildTask) -> Result<()> {
        if let Some(ref db_mutex) = self.db {
            let db = db_mutex
                .lock()
                .map_err(|_| OrchestratorError::Internal("task database lock poisoned".into()))?;
            write_task(&db, seq, task)?;
        }
        Ok(())
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn write_task(db: &rusqlite::Connection, seq: u64, task: &RebuildTask) -> Result<()> {
    db.execute(
        "INSERT OR REPLACE INTO rebuild_tasks (task_id, seq, server_id, status, total_rules, \
         processed_rules, failed_rules, force, error_message, started_at, completed_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        rusqlite::params![
            task.task_id,
            seq as i64,
            task.server_id,
            task.status.as_str(),
            task.total_rules,
            task.processed_rules,
            task.failed_rules,
            task.force as i64,
            task.error_message,
            task.started_at,
            task.completed_at,
        ],
    )?;
    Ok(())
}
