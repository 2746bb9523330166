//! Durable priority task queue over the store.
//!
//! Every mutation runs in a transaction; a crash mid-transaction leaves the
//! task in its prior state. Dequeue ordering is (priority value descending,
//! creation instant ascending), backed by the dispatch index.

use chrono::{DateTime, Utc};
use sqlx::{Sqlite, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ForemanError, Result};
use crate::store::Store;
use crate::task::{DeadLetterEntry, Task, TaskResult, TaskStatus, TaskSubmission};

/// Column list shared by every task SELECT/RETURNING.
pub(crate) const TASK_COLUMNS: &str = "id, task_type, payload, priority, priority_value, status, \
     assigned_worker, created_at, assigned_at, started_at, completed_at, \
     not_before, reserved_at, timeout_ms, retry_policy, affinity, \
     required_capabilities, attempt_count, max_retries, last_error, \
     result_id, parent_task_id, metadata";

/// Eligibility predicate for peek/dequeue: pending, unreserved, and past any
/// retry backoff.
const DISPATCHABLE: &str =
    "status = 'pending' AND reserved_at IS NULL AND (not_before IS NULL OR not_before <= ?)";

/// Counts and averages over the live queue.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub pending: i64,
    pub assigned: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub timeout: i64,
    pub cancelled: i64,
    pub dead_letter: i64,
    /// Average wait of currently-pending tasks, milliseconds.
    pub avg_wait_ms: Option<f64>,
    /// Average duration of recorded results, milliseconds.
    pub avg_run_ms: Option<f64>,
}

impl QueueStats {
    pub fn total(&self) -> i64 {
        self.pending
            + self.assigned
            + self.running
            + self.completed
            + self.failed
            + self.timeout
            + self.cancelled
    }

    pub fn in_flight(&self) -> i64 {
        self.assigned + self.running
    }
}

/// The durable task queue.
#[derive(Clone)]
pub struct TaskQueue {
    store: Store,
}

impl TaskQueue {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    // ------------------------------------------------------------------
    // Enqueue
    // ------------------------------------------------------------------

    /// Validate and persist a submission as a pending task.
    ///
    /// The returned id is durable before this returns. Callers that want
    /// coordinator-level defaults applied should go through
    /// `Coordinator::submit_task`.
    pub async fn enqueue(&self, submission: TaskSubmission) -> Result<Uuid> {
        validate(&submission)?;
        let task = Task::from_submission(submission, 300_000, &Default::default());
        let id = task.id;
        self.store
            .with_tx(|tx| {
                let task = task.clone();
                Box::pin(async move { insert_task(tx, &task).await })
            })
            .await?;
        debug!(task_id = %id, task_type = %task.task_type, "task enqueued");
        Ok(id)
    }

    /// Enqueue a batch atomically: either all persist or none do. Returned
    /// ids match input ordering.
    pub async fn enqueue_batch(&self, submissions: Vec<TaskSubmission>) -> Result<Vec<Uuid>> {
        for submission in &submissions {
            validate(submission)?;
        }
        let tasks: Vec<Task> = submissions
            .into_iter()
            .map(|s| Task::from_submission(s, 300_000, &Default::default()))
            .collect();
        let ids: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();

        self.store
            .with_tx(|tx| {
                let tasks = tasks.clone();
                Box::pin(async move {
                    for task in &tasks {
                        insert_task(tx, task).await?;
                    }
                    Ok(())
                })
            })
            .await?;
        Ok(ids)
    }

    /// Insert an already-constructed task (coordinator defaults applied).
    pub async fn enqueue_task(&self, task: Task) -> Result<Uuid> {
        if task.task_type.is_empty() {
            return Err(ForemanError::InvalidSubmission("empty task type".into()));
        }
        let id = task.id;
        self.store
            .with_tx(|tx| {
                let task = task.clone();
                Box::pin(async move { insert_task(tx, &task).await })
            })
            .await?;
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Peek / dequeue
    // ------------------------------------------------------------------

    /// Highest-priority oldest dispatchable task, without mutation.
    pub async fn peek(&self) -> Result<Option<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM task_queue WHERE {DISPATCHABLE} \
             ORDER BY priority_value DESC, created_at ASC LIMIT 1"
        );
        Ok(sqlx::query_as::<_, Task>(&sql)
            .bind(Utc::now())
            .fetch_optional(self.store.pool())
            .await?)
    }

    /// Same ordering as peek, but atomically stamps a reservation so
    /// concurrent dequeuers cannot double-claim. The distributor is the only
    /// caller; reservations are cleared by `release`, `assign`, or `requeue`.
    pub async fn dequeue(&self) -> Result<Option<Task>> {
        let now = Utc::now();
        let sql = format!(
            "UPDATE task_queue SET reserved_at = ? \
             WHERE id = (SELECT id FROM task_queue WHERE {DISPATCHABLE} \
                         ORDER BY priority_value DESC, created_at ASC LIMIT 1) \
             RETURNING {TASK_COLUMNS}"
        );
        Ok(sqlx::query_as::<_, Task>(&sql)
            .bind(now)
            .bind(now)
            .fetch_optional(self.store.pool())
            .await?)
    }

    /// Drop a dequeue reservation, making the task dispatchable again.
    pub async fn release(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE task_queue SET reserved_at = NULL WHERE id = ? AND status = 'pending'")
            .bind(id)
            .execute(self.store.pool())
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn get(&self, id: Uuid) -> Result<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM task_queue WHERE id = ?");
        Ok(sqlx::query_as::<_, Task>(&sql)
            .bind(id)
            .fetch_optional(self.store.pool())
            .await?)
    }

    pub async fn get_required(&self, id: Uuid) -> Result<Task> {
        self.get(id).await?.ok_or(ForemanError::TaskNotFound(id))
    }

    /// Dispatchable tasks in dequeue order.
    pub async fn get_pending(&self, limit: i64) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM task_queue WHERE {DISPATCHABLE} \
             ORDER BY priority_value DESC, created_at ASC LIMIT ?"
        );
        Ok(sqlx::query_as::<_, Task>(&sql)
            .bind(Utc::now())
            .bind(limit)
            .fetch_all(self.store.pool())
            .await?)
    }

    pub async fn get_running(&self) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM task_queue WHERE status = 'running' \
             ORDER BY started_at ASC"
        );
        Ok(sqlx::query_as::<_, Task>(&sql)
            .fetch_all(self.store.pool())
            .await?)
    }

    /// Tasks currently bound to a worker; the worker-poll surface.
    pub async fn get_assigned_to(&self, worker_id: Uuid) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM task_queue \
             WHERE assigned_worker = ? AND status IN ('assigned', 'running') \
             ORDER BY assigned_at ASC"
        );
        Ok(sqlx::query_as::<_, Task>(&sql)
            .bind(worker_id)
            .fetch_all(self.store.pool())
            .await?)
    }

    pub async fn get_result(&self, task_id: Uuid) -> Result<Option<TaskResult>> {
        Ok(sqlx::query_as::<_, TaskResult>(
            "SELECT id, task_id, success, output, error, error_stack, duration_ms, \
                    worker_id, model_id, tokens_used, cost, completed_at \
             FROM task_results WHERE task_id = ? ORDER BY completed_at DESC LIMIT 1",
        )
        .bind(task_id)
        .fetch_optional(self.store.pool())
        .await?)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let rows: Vec<(TaskStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM task_queue GROUP BY status")
                .fetch_all(self.store.pool())
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match status {
                TaskStatus::Pending => stats.pending = count,
                TaskStatus::Assigned => stats.assigned = count,
                TaskStatus::Running => stats.running = count,
                TaskStatus::Completed => stats.completed = count,
                TaskStatus::Failed => stats.failed = count,
                TaskStatus::Timeout => stats.timeout = count,
                TaskStatus::Cancelled => stats.cancelled = count,
            }
        }

        stats.dead_letter = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letter_queue")
            .fetch_one(self.store.pool())
            .await?;
        stats.avg_wait_ms = sqlx::query_scalar(
            "SELECT AVG((julianday('now') - julianday(created_at)) * 86400000) \
             FROM task_queue WHERE status = 'pending'",
        )
        .fetch_one(self.store.pool())
        .await?;
        stats.avg_run_ms = sqlx::query_scalar("SELECT AVG(duration_ms) FROM task_results")
            .fetch_one(self.store.pool())
            .await?;

        Ok(stats)
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Move a task through the state machine.
    ///
    /// Idempotent into terminal states. Transitions the state machine
    /// forbids are warn-logged no-ops, which also settles races between a
    /// late completion and a cancellation: the loser's write is discarded.
    /// Stamps `started_at` on entering running and `completed_at` on
    /// entering any terminal state.
    pub async fn update_status(
        &self,
        id: Uuid,
        new_status: TaskStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let task = self.get_required(id).await?;
        if task.status == new_status {
            return Ok(());
        }
        if !task.status.can_transition_to(new_status) {
            warn!(
                task_id = %id,
                from = ?task.status,
                to = ?new_status,
                "illegal status transition ignored"
            );
            return Ok(());
        }

        let now = Utc::now();
        let started_at = match new_status {
            TaskStatus::Running => task.started_at.or(Some(now)),
            _ => task.started_at,
        };
        let completed_at = if new_status.is_terminal() {
            Some(now)
        } else {
            None
        };

        let updated = sqlx::query(
            "UPDATE task_queue SET status = ?, started_at = ?, completed_at = ?, \
             last_error = COALESCE(?, last_error) WHERE id = ? AND status = ?",
        )
        .bind(new_status)
        .bind(started_at)
        .bind(completed_at)
        .bind(error)
        .bind(id)
        .bind(task.status)
        .execute(self.store.pool())
        .await?
        .rows_affected();

        if updated == 0 {
            warn!(task_id = %id, to = ?new_status, "status changed concurrently, update dropped");
        }
        Ok(())
    }

    /// Bind the task to a worker: status assigned, worker and instant
    /// recorded, any dequeue reservation cleared.
    pub async fn assign(&self, task_id: Uuid, worker_id: Uuid) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE task_queue SET status = 'assigned', assigned_worker = ?, \
             assigned_at = ?, reserved_at = NULL \
             WHERE id = ? AND status IN ('pending', 'assigned')",
        )
        .bind(worker_id)
        .bind(Utc::now())
        .bind(task_id)
        .execute(self.store.pool())
        .await?
        .rows_affected();

        if updated == 0 {
            self.get_required(task_id).await?;
            return Err(ForemanError::OptimisticLock {
                entity: "task",
                id: task_id,
            });
        }
        Ok(())
    }

    /// Bump the attempt counter; returns the new count.
    pub async fn increment_attempt(&self, id: Uuid) -> Result<i64> {
        let count: Option<i64> = sqlx::query_scalar(
            "UPDATE task_queue SET attempt_count = attempt_count + 1 WHERE id = ? \
             RETURNING attempt_count",
        )
        .bind(id)
        .fetch_optional(self.store.pool())
        .await?;
        count.ok_or(ForemanError::TaskNotFound(id))
    }

    /// Return a failed/timeout (or still-assigned) task to pending,
    /// clearing the worker binding and preserving attempt history.
    /// `not_before` materializes the retry backoff delay.
    pub async fn requeue(&self, id: Uuid, not_before: Option<DateTime<Utc>>) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE task_queue SET status = 'pending', assigned_worker = NULL, \
             assigned_at = NULL, started_at = NULL, completed_at = NULL, \
             reserved_at = NULL, not_before = ? \
             WHERE id = ? AND status IN ('assigned', 'failed', 'timeout')",
        )
        .bind(not_before)
        .bind(id)
        .execute(self.store.pool())
        .await?
        .rows_affected();

        if updated == 0 {
            let task = self.get_required(id).await?;
            warn!(task_id = %id, status = ?task.status, "requeue skipped");
        }
        Ok(())
    }

    /// Cancel from any non-terminal state; no-op in terminal states.
    /// Returns whether a row actually transitioned.
    pub async fn cancel(&self, id: Uuid) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE task_queue SET status = 'cancelled', completed_at = ?, reserved_at = NULL \
             WHERE id = ? AND status IN ('pending', 'assigned', 'running')",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(self.store.pool())
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    /// Copy the task into the dead-letter table and mark the live record
    /// terminal. The workers-attempted list comes from assignment history.
    pub async fn move_to_dead_letter(
        &self,
        id: Uuid,
        error: &str,
        stack: Option<&str>,
    ) -> Result<()> {
        self.store
            .with_tx(|tx| {
                let error = error.to_string();
                let stack = stack.map(str::to_string);
                Box::pin(async move { move_to_dead_letter_tx(tx, id, &error, stack.as_deref()).await })
            })
            .await
    }

    /// Most-recent dead letters.
    pub async fn dead_letters(&self, limit: i64) -> Result<Vec<DeadLetterEntry>> {
        Ok(sqlx::query_as::<_, DeadLetterEntry>(
            "SELECT task_id, task_type, payload, error, error_stack, retry_count, \
                    final_status, workers_attempted, created_at, dead_lettered_at, \
                    replay_count, resolved_at, resolution_note \
             FROM dead_letter_queue ORDER BY dead_lettered_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.store.pool())
        .await?)
    }

    /// Put a dead-lettered task back on the queue with a fresh attempt
    /// budget and bump its replay counter.
    pub async fn replay_dead_letter(&self, id: Uuid) -> Result<()> {
        self.store
            .with_tx(|tx| {
                Box::pin(async move {
                    let exists: Option<i64> = sqlx::query_scalar(
                        "SELECT 1 FROM dead_letter_queue WHERE task_id = ?",
                    )
                    .bind(id)
                    .fetch_optional(&mut **tx)
                    .await?;
                    if exists.is_none() {
                        return Err(ForemanError::TaskNotFound(id));
                    }

                    sqlx::query(
                        "UPDATE task_queue SET status = 'pending', attempt_count = 0, \
                         assigned_worker = NULL, assigned_at = NULL, started_at = NULL, \
                         completed_at = NULL, reserved_at = NULL, not_before = NULL, \
                         last_error = NULL WHERE id = ?",
                    )
                    .bind(id)
                    .execute(&mut **tx)
                    .await?;

                    sqlx::query(
                        "UPDATE dead_letter_queue SET replay_count = replay_count + 1 \
                         WHERE task_id = ?",
                    )
                    .bind(id)
                    .execute(&mut **tx)
                    .await?;
                    Ok(())
                })
            })
            .await
    }

    /// Operator acknowledgement of a dead letter; the entry stays for audit.
    pub async fn resolve_dead_letter(&self, id: Uuid, note: &str) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE dead_letter_queue SET resolved_at = ?, resolution_note = ? \
             WHERE task_id = ? AND resolved_at IS NULL",
        )
        .bind(Utc::now())
        .bind(note)
        .bind(id)
        .execute(self.store.pool())
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(ForemanError::TaskNotFound(id));
        }
        Ok(())
    }
}

fn validate(submission: &TaskSubmission) -> Result<()> {
    if submission.task_type.is_empty() {
        return Err(ForemanError::InvalidSubmission("empty task type".into()));
    }
    if let Some(timeout) = submission.timeout_ms {
        if timeout <= 0 {
            return Err(ForemanError::InvalidSubmission(format!(
                "timeout_ms must be positive, got {}",
                timeout
            )));
        }
    }
    if let Some(max_retries) = submission.max_retries {
        if max_retries < 0 {
            return Err(ForemanError::InvalidSubmission(format!(
                "max_retries must be non-negative, got {}",
                max_retries
            )));
        }
    }
    Ok(())
}

pub(crate) async fn insert_task(tx: &mut Transaction<'static, Sqlite>, task: &Task) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_queue (id, task_type, payload, priority, priority_value, status, \
         assigned_worker, created_at, assigned_at, started_at, completed_at, not_before, \
         reserved_at, timeout_ms, retry_policy, affinity, required_capabilities, \
         attempt_count, max_retries, last_error, result_id, parent_task_id, metadata) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(task.id)
    .bind(&task.task_type)
    .bind(&task.payload)
    .bind(task.priority)
    .bind(task.priority_value)
    .bind(task.status)
    .bind(task.assigned_worker)
    .bind(task.created_at)
    .bind(task.assigned_at)
    .bind(task.started_at)
    .bind(task.completed_at)
    .bind(task.not_before)
    .bind(task.reserved_at)
    .bind(task.timeout_ms)
    .bind(&task.retry_policy)
    .bind(&task.affinity)
    .bind(&task.required_capabilities)
    .bind(task.attempt_count)
    .bind(task.max_retries)
    .bind(&task.last_error)
    .bind(task.result_id)
    .bind(task.parent_task_id)
    .bind(&task.metadata)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub(crate) async fn move_to_dead_letter_tx(
    tx: &mut Transaction<'static, Sqlite>,
    id: Uuid,
    error: &str,
    stack: Option<&str>,
) -> Result<()> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM task_queue WHERE id = ?");
    let task: Task = sqlx::query_as(&sql)
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(ForemanError::TaskNotFound(id))?;

    let attempted: Vec<Uuid> = sqlx::query_scalar(
        "SELECT DISTINCT worker_id FROM worker_assignments WHERE task_id = ? \
         ORDER BY worker_id",
    )
    .bind(id)
    .fetch_all(&mut **tx)
    .await?;

    let final_status = if task.status.is_terminal() && task.status != TaskStatus::Completed {
        task.status
    } else {
        TaskStatus::Failed
    };

    sqlx::query(
        "INSERT INTO dead_letter_queue (task_id, task_type, payload, error, error_stack, \
         retry_count, final_status, workers_attempted, created_at, dead_lettered_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(task.id)
    .bind(&task.task_type)
    .bind(&task.payload)
    .bind(error)
    .bind(stack)
    .bind(task.attempt_count)
    .bind(final_status)
    .bind(sqlx::types::Json(attempted))
    .bind(task.created_at)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;

    if !task.status.is_terminal() {
        sqlx::query(
            "UPDATE task_queue SET status = ?, completed_at = ?, last_error = ? WHERE id = ?",
        )
        .bind(final_status)
        .bind(Utc::now())
        .bind(error)
        .bind(id)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}
