//! Task distributor: atomic coupling of queue entries and workers, and the
//! lifecycle transitions that follow.
//!
//! Assignment is a single transaction covering the status flip, the worker
//! load increment, and the assignment row; splitting those would admit an
//! over-commit race between concurrent `assign_next` calls. Failure handling
//! routes through one policy: retry with exponential backoff until the
//! attempt budget is spent, then dead-letter.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DistributorConfig;
use crate::error::{ForemanError, Result};
use crate::events::{CoordinatorEvent, EventBus};
use crate::manager::WorkerManager;
use crate::queue::{move_to_dead_letter_tx, TaskQueue, TASK_COLUMNS};
use crate::store::Store;
use crate::task::{AssignmentReason, RetryPolicy, Task, TaskOutcome, TaskStatus};
use crate::views::{self, TimeoutCandidate};
use crate::worker::Worker;

/// Binds queue entries to workers and shepherds them to a terminal state.
pub struct TaskDistributor {
    store: Store,
    queue: Arc<TaskQueue>,
    workers: Arc<WorkerManager>,
    bus: Arc<EventBus>,
    config: DistributorConfig,
}

impl TaskDistributor {
    pub fn new(
        store: Store,
        queue: Arc<TaskQueue>,
        workers: Arc<WorkerManager>,
        bus: Arc<EventBus>,
        config: DistributorConfig,
    ) -> Self {
        Self {
            store,
            queue,
            workers,
            bus,
            config,
        }
    }

    // ------------------------------------------------------------------
    // Worker selection
    // ------------------------------------------------------------------

    /// Find a worker for the task under affinity precedence: required
    /// worker, then same-worker-as, then preferred worker, then
    /// exclusion-filtered strategy selection.
    ///
    /// A required worker that is offline or at capacity yields none, and the
    /// task stays pending until an operator intervenes or the worker
    /// recovers. Preferred-worker and same-worker-as misses fall through to
    /// general selection.
    pub async fn find_worker_for_task(
        &self,
        task: &Task,
    ) -> Result<Option<(Worker, AssignmentReason)>> {
        let required_caps = if self.config.consider_capabilities {
            task.required_capabilities()
        } else {
            None
        };

        let affinity = if self.config.enable_affinity {
            task.affinity()
        } else {
            None
        };

        if let Some(rules) = affinity {
            if let Some(required_worker) = rules.required_worker {
                let worker = self
                    .workers
                    .try_get(required_worker)
                    .await?
                    .filter(|w| w.is_active() && w.has_capacity());
                return Ok(worker.map(|w| (w, AssignmentReason::RequiredWorker)));
            }

            if let Some(other_task) = rules.same_worker_as {
                if let Some(owner) = self.assigned_worker_of(other_task).await? {
                    if self.eligible(&owner, required_caps) {
                        return Ok(Some((owner, AssignmentReason::Affinity)));
                    }
                }
            }

            if let Some(preferred) = rules.preferred_worker {
                if let Some(worker) = self.workers.try_get(preferred).await? {
                    if self.eligible(&worker, required_caps) {
                        return Ok(Some((worker, AssignmentReason::Affinity)));
                    }
                }
            }
        }

        let excluded = affinity
            .and_then(|r| r.excluded_workers.as_deref())
            .unwrap_or(&[]);

        let candidates: Vec<Worker> = self
            .workers
            .get_active()
            .await?
            .into_iter()
            .filter(|w| self.eligible(w, required_caps))
            .filter(|w| !excluded.contains(&w.id))
            .collect();

        if candidates.len() <= 1 {
            return Ok(candidates
                .into_iter()
                .next()
                .map(|w| (w, AssignmentReason::OnlyAvailable)));
        }

        let cursor = self.workers.next_cursor();
        let picked = self
            .config
            .strategy
            .select(&candidates, required_caps, cursor)
            .cloned();
        let reason = match required_caps {
            Some(caps) if !caps.is_empty() => AssignmentReason::CapabilityMatch,
            _ => AssignmentReason::LoadBalance,
        };
        Ok(picked.map(|w| (w, reason)))
    }

    fn eligible(&self, worker: &Worker, required_caps: Option<&[String]>) -> bool {
        worker.is_active()
            && worker.has_capacity()
            && worker.load_factor() < self.config.max_load_threshold
            && required_caps.map_or(true, |caps| worker.has_capabilities(caps))
    }

    async fn assigned_worker_of(&self, task_id: Uuid) -> Result<Option<Worker>> {
        let Some(task) = self.queue.get(task_id).await? else {
            return Ok(None);
        };
        match task.assigned_worker {
            Some(worker_id) => self.workers.try_get(worker_id).await,
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Assignment
    // ------------------------------------------------------------------

    /// Pair the head of the queue with a worker. Returns none when the
    /// queue is empty or no worker fits; the task stays pending.
    pub async fn assign_next(&self) -> Result<Option<(Task, Worker)>> {
        let Some(task) = self.queue.peek().await? else {
            return Ok(None);
        };
        let Some((worker, reason)) = self.find_worker_for_task(&task).await? else {
            debug!(task_id = %task.id, "no worker available, task stays pending");
            return Ok(None);
        };

        match self.assign(task.id, worker.id, reason).await {
            Ok(()) => {
                let task = self.queue.get_required(task.id).await?;
                Ok(Some((task, worker)))
            }
            // lost a race with a concurrent assign; the next pass retries
            Err(ForemanError::OptimisticLock { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Atomically bind `task_id` to `worker_id`: queue status, worker load,
    /// and the assignment row all land in one transaction. The
    /// load-feasibility check runs inside that transaction, preventing
    /// over-commit between concurrent callers.
    pub async fn assign(
        &self,
        task_id: Uuid,
        worker_id: Uuid,
        reason: AssignmentReason,
    ) -> Result<()> {
        self.store
            .with_tx(|tx| {
                Box::pin(async move {
                    let status: Option<TaskStatus> =
                        sqlx::query_scalar("SELECT status FROM task_queue WHERE id = ?")
                            .bind(task_id)
                            .fetch_optional(&mut **tx)
                            .await?;
                    match status {
                        None => return Err(ForemanError::TaskNotFound(task_id)),
                        Some(TaskStatus::Pending) => {}
                        Some(_) => {
                            return Err(ForemanError::OptimisticLock {
                                entity: "task",
                                id: task_id,
                            })
                        }
                    }

                    let loaded = sqlx::query(
                        "UPDATE workers SET current_load = current_load + 1, \
                         state = CASE WHEN state = 'idle' THEN 'busy' ELSE state END \
                         WHERE id = ? AND state IN ('idle', 'busy') \
                           AND current_load < max_load",
                    )
                    .bind(worker_id)
                    .execute(&mut **tx)
                    .await?
                    .rows_affected();
                    if loaded == 0 {
                        return Err(ForemanError::OptimisticLock {
                            entity: "worker",
                            id: worker_id,
                        });
                    }

                    sqlx::query(
                        "UPDATE task_queue SET status = 'assigned', assigned_worker = ?, \
                         assigned_at = ?, reserved_at = NULL WHERE id = ?",
                    )
                    .bind(worker_id)
                    .bind(Utc::now())
                    .bind(task_id)
                    .execute(&mut **tx)
                    .await?;

                    sqlx::query(
                        "INSERT INTO worker_assignments \
                         (id, worker_id, task_id, assigned_at, reason, reassignment_count) \
                         VALUES (?, ?, ?, ?, ?, 0)",
                    )
                    .bind(Uuid::new_v4())
                    .bind(worker_id)
                    .bind(task_id)
                    .bind(Utc::now())
                    .bind(reason)
                    .execute(&mut **tx)
                    .await?;
                    Ok(())
                })
            })
            .await?;

        info!(task_id = %task_id, worker_id = %worker_id, reason = ?reason, "task assigned");
        self.bus.emit(CoordinatorEvent::TaskAssigned { task_id, worker_id });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle transitions (worker-initiated)
    // ------------------------------------------------------------------

    /// Worker-initiated `assigned → running`. Stamps `started_at` and counts
    /// the execution attempt. Idempotent for an already-running task.
    pub async fn start_task(&self, task_id: Uuid) -> Result<()> {
        let task = self.queue.get_required(task_id).await?;
        match task.status {
            TaskStatus::Assigned => {}
            TaskStatus::Running => return Ok(()),
            other => {
                warn!(task_id = %task_id, status = ?other, "start_task ignored");
                return Ok(());
            }
        }

        let updated = sqlx::query(
            "UPDATE task_queue SET status = 'running', started_at = ?, \
             attempt_count = attempt_count + 1 WHERE id = ? AND status = 'assigned'",
        )
        .bind(Utc::now())
        .bind(task_id)
        .execute(self.store.pool())
        .await?
        .rows_affected();

        if updated > 0 {
            if let Some(worker_id) = task.assigned_worker {
                self.bus.emit(CoordinatorEvent::TaskStarted {
                    task_id,
                    worker_id,
                    attempt: task.attempt_count + 1,
                });
            }
        }
        Ok(())
    }

    /// Worker-reported completion. One transaction writes the result row,
    /// flips the queue status, closes the assignment, decrements the
    /// worker's load, and accumulates metrics. Failures are then routed
    /// through the retry/dead-letter policy.
    ///
    /// A second call for an already-terminal task is a no-op, which settles
    /// the race between a late completion and a cancellation or timeout.
    pub async fn complete_task(&self, task_id: Uuid, outcome: TaskOutcome) -> Result<()> {
        let task = self.queue.get_required(task_id).await?;
        if task.status.is_terminal() {
            warn!(task_id = %task_id, status = ?task.status, "late completion ignored");
            return Ok(());
        }
        if !matches!(task.status, TaskStatus::Assigned | TaskStatus::Running) {
            warn!(task_id = %task_id, status = ?task.status, "completion for unassigned task ignored");
            return Ok(());
        }
        let Some(worker_id) = task.assigned_worker else {
            return Err(ForemanError::OptimisticLock {
                entity: "task",
                id: task_id,
            });
        };

        let now = Utc::now();
        let duration_ms = task
            .started_at
            .map(|s| (now - s).num_milliseconds().max(0))
            .unwrap_or(0);
        let new_status = if outcome.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        let result_id = Uuid::new_v4();
        let prior_status = task.status;

        self.store
            .with_tx(|tx| {
                let outcome = outcome.clone();
                Box::pin(async move {
                    let flipped = sqlx::query(
                        "UPDATE task_queue SET status = ?, completed_at = ?, \
                         last_error = ?, result_id = ? WHERE id = ? AND status = ?",
                    )
                    .bind(new_status)
                    .bind(now)
                    .bind(&outcome.error)
                    .bind(result_id)
                    .bind(task_id)
                    .bind(prior_status)
                    .execute(&mut **tx)
                    .await?
                    .rows_affected();
                    if flipped == 0 {
                        return Err(ForemanError::OptimisticLock {
                            entity: "task",
                            id: task_id,
                        });
                    }

                    sqlx::query(
                        "INSERT INTO task_results (id, task_id, success, output, error, \
                         error_stack, duration_ms, worker_id, model_id, tokens_used, cost, \
                         completed_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(result_id)
                    .bind(task_id)
                    .bind(outcome.success)
                    .bind(&outcome.output)
                    .bind(&outcome.error)
                    .bind(&outcome.error_stack)
                    .bind(duration_ms)
                    .bind(worker_id)
                    .bind(&outcome.model_id)
                    .bind(outcome.tokens_used)
                    .bind(outcome.cost)
                    .bind(now)
                    .execute(&mut **tx)
                    .await?;

                    sqlx::query(
                        "UPDATE worker_assignments SET released_at = ? \
                         WHERE task_id = ? AND released_at IS NULL",
                    )
                    .bind(now)
                    .bind(task_id)
                    .execute(&mut **tx)
                    .await?;

                    sqlx::query(
                        "UPDATE workers SET current_load = MAX(current_load - 1, 0), \
                         state = CASE WHEN current_load <= 1 AND state = 'busy' \
                                      THEN 'idle' ELSE state END \
                         WHERE id = ?",
                    )
                    .bind(worker_id)
                    .execute(&mut **tx)
                    .await?;

                    sqlx::query(
                        "UPDATE worker_metrics SET \
                         tasks_completed = tasks_completed + ?, \
                         tasks_failed = tasks_failed + ?, \
                         total_duration_ms = total_duration_ms + ?, \
                         total_tokens = total_tokens + ?, \
                         total_cost = total_cost + ?, \
                         updated_at = ? WHERE worker_id = ?",
                    )
                    .bind(outcome.success as i64)
                    .bind((!outcome.success) as i64)
                    .bind(duration_ms)
                    .bind(outcome.tokens_used.unwrap_or(0))
                    .bind(outcome.cost.unwrap_or(0.0))
                    .bind(now)
                    .bind(worker_id)
                    .execute(&mut **tx)
                    .await?;
                    Ok(())
                })
            })
            .await?;

        if outcome.success {
            debug!(task_id = %task_id, worker_id = %worker_id, duration_ms, "task completed");
            self.bus.emit(CoordinatorEvent::TaskCompleted {
                task_id,
                worker_id,
                duration_ms,
            });
        } else {
            let error = outcome.error.as_deref().unwrap_or("unknown error");
            self.handle_failure(task_id, error, outcome.error_stack.as_deref())
                .await?;
        }
        Ok(())
    }

    /// Cancel from any non-terminal state, releasing the worker if one is
    /// bound. No-op in terminal states.
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<()> {
        let task = self.queue.get_required(task_id).await?;
        if task.status.is_terminal() {
            return Ok(());
        }
        let bound_worker = match task.status {
            TaskStatus::Assigned | TaskStatus::Running => task.assigned_worker,
            _ => None,
        };

        self.store
            .with_tx(|tx| {
                Box::pin(async move {
                    let cancelled = sqlx::query(
                        "UPDATE task_queue SET status = 'cancelled', completed_at = ?, \
                         reserved_at = NULL \
                         WHERE id = ? AND status IN ('pending', 'assigned', 'running')",
                    )
                    .bind(Utc::now())
                    .bind(task_id)
                    .execute(&mut **tx)
                    .await?
                    .rows_affected();
                    if cancelled == 0 {
                        // already settled by a concurrent transition
                        return Ok(());
                    }

                    if let Some(worker_id) = bound_worker {
                        release_worker_tx(tx, task_id, worker_id).await?;
                    }
                    Ok(())
                })
            })
            .await?;

        info!(task_id = %task_id, "task cancelled");
        Ok(())
    }

    /// Move an in-flight task to a different worker: close the old
    /// assignment, insert the new row, and carry the bumped reassignment
    /// counter on it. Reassigning to the current owner is a no-op.
    pub async fn reassign_task(&self, task_id: Uuid, new_worker_id: Uuid) -> Result<()> {
        let task = self.queue.get_required(task_id).await?;
        if task.status != TaskStatus::Assigned {
            // running tasks are recovered by the timeout sweep instead
            return Err(ForemanError::OptimisticLock {
                entity: "task",
                id: task_id,
            });
        }
        let old_worker_id = task.assigned_worker;
        if old_worker_id == Some(new_worker_id) {
            return Ok(());
        }

        let limit = self.config.max_assignment_attempts;
        self.store
            .with_tx(|tx| {
                Box::pin(async move {
                    let count: Option<i64> = sqlx::query_scalar(
                        "SELECT reassignment_count FROM worker_assignments \
                         WHERE task_id = ? AND released_at IS NULL",
                    )
                    .bind(task_id)
                    .fetch_optional(&mut **tx)
                    .await?;
                    let count = count.unwrap_or(0);
                    if count >= limit {
                        return Err(ForemanError::ReassignmentLimit { task_id, limit });
                    }

                    let loaded = sqlx::query(
                        "UPDATE workers SET current_load = current_load + 1, \
                         state = CASE WHEN state = 'idle' THEN 'busy' ELSE state END \
                         WHERE id = ? AND state IN ('idle', 'busy') \
                           AND current_load < max_load",
                    )
                    .bind(new_worker_id)
                    .execute(&mut **tx)
                    .await?
                    .rows_affected();
                    if loaded == 0 {
                        return Err(ForemanError::OptimisticLock {
                            entity: "worker",
                            id: new_worker_id,
                        });
                    }

                    if let Some(old) = old_worker_id {
                        release_worker_tx(tx, task_id, old).await?;
                    }

                    sqlx::query(
                        "UPDATE task_queue SET status = 'assigned', assigned_worker = ?, \
                         assigned_at = ?, started_at = NULL WHERE id = ?",
                    )
                    .bind(new_worker_id)
                    .bind(Utc::now())
                    .bind(task_id)
                    .execute(&mut **tx)
                    .await?;

                    sqlx::query(
                        "INSERT INTO worker_assignments \
                         (id, worker_id, task_id, assigned_at, reason, reassignment_count) \
                         VALUES (?, ?, ?, ?, ?, ?)",
                    )
                    .bind(Uuid::new_v4())
                    .bind(new_worker_id)
                    .bind(task_id)
                    .bind(Utc::now())
                    .bind(AssignmentReason::Manual)
                    .bind(count + 1)
                    .execute(&mut **tx)
                    .await?;
                    Ok(())
                })
            })
            .await?;

        info!(task_id = %task_id, worker_id = %new_worker_id, "task reassigned");
        self.bus.emit(CoordinatorEvent::TaskAssigned {
            task_id,
            worker_id: new_worker_id,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Failure policy
    // ------------------------------------------------------------------

    /// Retry-or-dead-letter decision after any failure or timeout.
    ///
    /// `attempt_count` counts executions begun (stamped by `start_task`);
    /// a failure reported before the task ever started counts its attempt
    /// here. Once attempts exceed the retry budget, or the error is outside
    /// the policy's retryable set, the task dead-letters. Otherwise it
    /// requeues with the backoff delay materialized as `not_before`.
    async fn handle_failure(
        &self,
        task_id: Uuid,
        error: &str,
        stack: Option<&str>,
    ) -> Result<()> {
        let task = self.queue.get_required(task_id).await?;
        let attempts = if task.started_at.is_none() {
            // failed before the attempt was ever started; count it here
            self.queue.increment_attempt(task_id).await?
        } else {
            task.attempt_count
        };

        let policy = task.retry_policy().cloned().unwrap_or_default();
        let exhausted = attempts > task.max_retries;
        let retryable = policy.retries_error(error);

        if exhausted || !retryable {
            self.queue.move_to_dead_letter(task_id, error, stack).await?;
            warn!(
                task_id = %task_id,
                attempts,
                error = %error,
                "task dead-lettered"
            );
            self.bus.emit(CoordinatorEvent::TaskFailed {
                task_id,
                error: error.to_string(),
                will_retry: false,
            });
        } else {
            let not_before = backoff_instant(&policy, attempts);
            self.queue.requeue(task_id, not_before).await?;
            info!(
                task_id = %task_id,
                attempts,
                error = %error,
                "task requeued for retry"
            );
            self.bus.emit(CoordinatorEvent::TaskFailed {
                task_id,
                error: error.to_string(),
                will_retry: true,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Timeouts
    // ------------------------------------------------------------------

    /// Sweep running tasks past their timeout budget. Each candidate is
    /// marked `timeout`, its worker released and charged a failure, and the
    /// task fed to the failure policy. Returns the candidates found.
    pub async fn check_timeouts(&self) -> Result<Vec<TimeoutCandidate>> {
        let candidates = views::timeout_candidates(&self.store).await?;
        for candidate in &candidates {
            if let Err(e) = self.handle_timeout(candidate).await {
                error!(task_id = %candidate.id, error = %e, "timeout handling failed");
            }
        }
        Ok(candidates)
    }

    async fn handle_timeout(&self, candidate: &TimeoutCandidate) -> Result<()> {
        let task_id = candidate.id;
        let worker_id = candidate.assigned_worker;
        let error = ForemanError::TaskTimeout {
            task_id,
            timeout_ms: candidate.timeout_ms,
        }
        .to_string();

        let transitioned = self
            .store
            .with_tx(|tx| {
                let error = error.clone();
                Box::pin(async move {
                    let flipped = sqlx::query(
                        "UPDATE task_queue SET status = 'timeout', completed_at = ?, \
                         last_error = ? WHERE id = ? AND status = 'running'",
                    )
                    .bind(Utc::now())
                    .bind(&error)
                    .bind(task_id)
                    .execute(&mut **tx)
                    .await?
                    .rows_affected();
                    if flipped == 0 {
                        // completed or cancelled between sweep read and now
                        return Ok(false);
                    }

                    if let Some(worker_id) = worker_id {
                        release_worker_tx(tx, task_id, worker_id).await?;
                    }
                    Ok(true)
                })
            })
            .await?;

        if !transitioned {
            return Ok(());
        }

        warn!(task_id = %task_id, timeout_ms = candidate.timeout_ms, "task timed out");
        if let Some(worker_id) = worker_id {
            self.workers.record_failure(worker_id).await?;
        }
        self.bus.emit(CoordinatorEvent::TaskTimeout { task_id, worker_id });
        self.handle_failure(task_id, &error, None).await
    }

    /// Spawn the periodic timeout sweep. Errors are logged and never kill
    /// the loop; the token stops it.
    pub fn spawn_timeout_sweep(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let distributor = Arc::clone(self);
        tokio::spawn(async move {
            if !distributor.config.enable_timeouts {
                return;
            }
            let mut ticker = tokio::time::interval(distributor.config.timeout_check_interval);
            ticker.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = distributor.check_timeouts().await {
                            error!(error = %e, "timeout sweep failed");
                        }
                    }
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Worker death
    // ------------------------------------------------------------------

    /// Redistribute work bound to a worker that went offline. Assigned
    /// tasks are rebound to another worker when one fits, else requeued.
    /// Running tasks are left to the timeout sweep, which routes them
    /// through the failure policy.
    pub async fn handle_worker_death(&self, worker_id: Uuid) -> Result<()> {
        let tasks = self.queue.get_assigned_to(worker_id).await?;
        for task in tasks {
            if task.status != TaskStatus::Assigned {
                continue;
            }
            let replacement = self
                .find_worker_for_task(&task)
                .await?
                .filter(|(w, _)| w.id != worker_id);

            match replacement {
                Some((worker, _reason)) => {
                    match self.reassign_task(task.id, worker.id).await {
                        Ok(()) => continue,
                        Err(ForemanError::ReassignmentLimit { .. })
                        | Err(ForemanError::OptimisticLock { .. }) => {
                            self.requeue_from_dead_worker(task.id, worker_id).await?;
                        }
                        Err(e) => return Err(e),
                    }
                }
                None => self.requeue_from_dead_worker(task.id, worker_id).await?,
            }
        }
        Ok(())
    }

    async fn requeue_from_dead_worker(&self, task_id: Uuid, worker_id: Uuid) -> Result<()> {
        self.store
            .with_tx(|tx| {
                Box::pin(async move {
                    release_worker_tx(tx, task_id, worker_id).await?;
                    sqlx::query(
                        "UPDATE task_queue SET status = 'pending', assigned_worker = NULL, \
                         assigned_at = NULL, reserved_at = NULL \
                         WHERE id = ? AND status = 'assigned'",
                    )
                    .bind(task_id)
                    .execute(&mut **tx)
                    .await?;
                    Ok(())
                })
            })
            .await?;
        info!(task_id = %task_id, worker_id = %worker_id, "task requeued from dead worker");
        Ok(())
    }

    /// Escape hatch used by tests and operators to force a dead-letter.
    pub async fn dead_letter_task(&self, task_id: Uuid, error: &str) -> Result<()> {
        self.store
            .with_tx(|tx| {
                let error = error.to_string();
                Box::pin(async move { move_to_dead_letter_tx(tx, task_id, &error, None).await })
            })
            .await
    }

    /// Raw queue view of one task; used by worker-facing surfaces.
    pub async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM task_queue WHERE id = ?");
        Ok(sqlx::query_as::<_, Task>(&sql)
            .bind(task_id)
            .fetch_optional(self.store.pool())
            .await?)
    }
}

/// Close the open assignment row and give the worker its load unit back.
async fn release_worker_tx(
    tx: &mut sqlx::Transaction<'static, sqlx::Sqlite>,
    task_id: Uuid,
    worker_id: Uuid,
) -> Result<()> {
    sqlx::query(
        "UPDATE worker_assignments SET released_at = ? \
         WHERE task_id = ? AND released_at IS NULL",
    )
    .bind(Utc::now())
    .bind(task_id)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        "UPDATE workers SET current_load = MAX(current_load - 1, 0), \
         state = CASE WHEN current_load <= 1 AND state = 'busy' THEN 'idle' ELSE state END \
         WHERE id = ?",
    )
    .bind(worker_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Materialized backoff instant for the next retry, if any delay applies.
fn backoff_instant(policy: &RetryPolicy, attempts: i64) -> Option<chrono::DateTime<Utc>> {
    let delay = policy.delay_for_attempt(attempts);
    if delay.num_milliseconds() <= 0 {
        return None;
    }
    Some(Utc::now() + delay)
}
