//! Composition root: accepts submissions and workflows, runs the background
//! sweeps, drives queue processing, exposes health and progress views, and
//! performs drain-then-shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{Config, CoordinatorConfig, DistributorConfig, WorkerManagerConfig};
use crate::distributor::TaskDistributor;
use crate::error::{ForemanError, Result};
use crate::events::{CoordinatorEvent, EventBus, EventKind};
use crate::manager::WorkerManager;
use crate::queue::TaskQueue;
use crate::store::Store;
use crate::task::{DependencyKind, Task, TaskOutcome, TaskResult, TaskSubmission};
use crate::views::{self, SystemHealth};
use crate::worker::{Heartbeat, WorkerRegistration};
use crate::workflow::{self, WorkflowDefinition, WorkflowExecution};

/// Aggregate progress over everything the queue has seen.
#[derive(Debug, Clone)]
pub struct ProgressReport {
    pub total: i64,
    pub pending: i64,
    pub in_flight: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead_letter: i64,
    pub percent_complete: f64,
    /// `avg_wait × pending`, when an average is known.
    pub estimated_remaining_ms: Option<f64>,
}

/// The long-running coordinator.
pub struct Coordinator {
    store: Store,
    queue: Arc<TaskQueue>,
    workers: Arc<WorkerManager>,
    distributor: Arc<TaskDistributor>,
    bus: Arc<EventBus>,
    config: CoordinatorConfig,
    accepting: AtomicBool,
    running: AtomicBool,
    shutdown_token: Mutex<CancellationToken>,
    sweep_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Wire up the component graph over one store.
    pub fn new(
        store: Store,
        config: CoordinatorConfig,
        manager_config: WorkerManagerConfig,
    ) -> Arc<Self> {
        let bus = Arc::new(EventBus::new());
        let queue = Arc::new(TaskQueue::new(store.clone()));
        let workers = Arc::new(WorkerManager::new(store.clone(), manager_config));
        let distributor = Arc::new(TaskDistributor::new(
            store.clone(),
            Arc::clone(&queue),
            Arc::clone(&workers),
            Arc::clone(&bus),
            DistributorConfig::from_coordinator(&config),
        ));

        Arc::new(Self {
            store,
            queue,
            workers,
            distributor,
            bus,
            config,
            accepting: AtomicBool::new(true),
            running: AtomicBool::new(false),
            shutdown_token: Mutex::new(CancellationToken::new()),
            sweep_handles: Mutex::new(Vec::new()),
        })
    }

    /// Open the store at the configured path and build a coordinator.
    pub async fn from_config(config: Config) -> Result<Arc<Self>> {
        let store = Store::open(&config.database_path).await?;
        Ok(Self::new(store, config.coordinator, config.worker_manager))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn workers(&self) -> &Arc<WorkerManager> {
        &self.workers
    }

    pub fn distributor(&self) -> &Arc<TaskDistributor> {
        &self.distributor
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Spin up the heartbeat and timeout sweeps. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let token = CancellationToken::new();
        *lock(&self.shutdown_token) = token.clone();

        let mut handles = vec![self.distributor.spawn_timeout_sweep(token.clone())];

        let coordinator = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(coordinator.config.heartbeat_check_interval);
            ticker.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = coordinator.run_heartbeat_sweep().await {
                            error!(error = %e, "heartbeat sweep failed");
                        }
                    }
                }
            }
        }));

        lock(&self.sweep_handles).extend(handles);
        info!("coordinator started");
    }

    /// Halt the background sweeps. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        lock(&self.shutdown_token).cancel();
        for handle in lock(&self.sweep_handles).drain(..) {
            handle.abort();
        }
        info!("coordinator stopped");
    }

    /// One pass of the liveness sweep: offline stale workers, redistribute
    /// their work, and pick the queue back up.
    pub async fn run_heartbeat_sweep(&self) -> Result<()> {
        let offlined = self.workers.auto_cleanup().await?;
        for worker in &offlined {
            self.bus
                .emit(CoordinatorEvent::WorkerOffline { worker_id: worker.id });
            if let Err(e) = self.distributor.handle_worker_death(worker.id).await {
                error!(worker_id = %worker.id, error = %e, "worker death handling failed");
            }
        }
        if !offlined.is_empty() {
            self.process_queue().await?;
        }
        Ok(())
    }

    /// Drain running work within the shutdown budget, then close the store.
    /// Tasks still running past the bound are logged and abandoned; they
    /// stay in the durable store for the next start.
    pub async fn shutdown(&self) -> Result<()> {
        self.accepting.store(false, Ordering::SeqCst);
        self.stop();

        let deadline = Instant::now() + self.config.shutdown_timeout;
        loop {
            let running = self.queue.get_running().await?;
            if running.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    count = running.len(),
                    "shutdown timeout reached, abandoning running tasks"
                );
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }

        self.store.close().await;
        info!("coordinator shut down");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Submissions
    // ------------------------------------------------------------------

    /// Apply coordinator defaults, enqueue durably, and trigger a queue
    /// pass. Returns the task id once the enqueue has committed.
    pub async fn submit_task(&self, mut submission: TaskSubmission) -> Result<Uuid> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ForemanError::ShuttingDown);
        }
        self.apply_defaults(&mut submission);
        let task_type = submission.task_type.clone();

        let task_id = self.queue.enqueue(submission).await?;
        self.bus
            .emit(CoordinatorEvent::TaskEnqueued { task_id, task_type });

        if let Err(e) = self.process_queue().await {
            warn!(error = %e, "queue pass after submit failed");
        }
        Ok(task_id)
    }

    /// Batch form of `submit_task`; the enqueue is all-or-nothing.
    pub async fn submit_tasks(&self, mut submissions: Vec<TaskSubmission>) -> Result<Vec<Uuid>> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ForemanError::ShuttingDown);
        }
        for submission in &mut submissions {
            self.apply_defaults(submission);
        }
        let types: Vec<String> = submissions.iter().map(|s| s.task_type.clone()).collect();

        let ids = self.queue.enqueue_batch(submissions).await?;
        for (task_id, task_type) in ids.iter().zip(types) {
            self.bus.emit(CoordinatorEvent::TaskEnqueued {
                task_id: *task_id,
                task_type,
            });
        }

        if let Err(e) = self.process_queue().await {
            warn!(error = %e, "queue pass after batch submit failed");
        }
        Ok(ids)
    }

    fn apply_defaults(&self, submission: &mut TaskSubmission) {
        if submission.timeout_ms.is_none() {
            submission.timeout_ms = Some(self.config.default_timeout_ms);
        }
        if submission.retry_policy.is_none() {
            submission.retry_policy = Some(self.config.default_retry_policy.clone());
        }
    }

    /// Pair pending tasks with workers up to the available capacity.
    /// Safe to call re-entrantly: the assignment transaction is the
    /// arbiter, and a lost race just skips that task.
    pub async fn process_queue(&self) -> Result<usize> {
        let worker_stats = self.workers.stats().await?;
        let queue_stats = self.queue.stats().await?;
        let slots = worker_stats
            .available_capacity()
            .min(self.config.max_concurrent_tasks - queue_stats.in_flight())
            .max(0);
        if slots == 0 {
            return Ok(0);
        }

        let mut assigned = 0;
        for task in self.queue.get_pending(slots).await? {
            match self.distributor.find_worker_for_task(&task).await? {
                Some((worker, reason)) => {
                    match self.distributor.assign(task.id, worker.id, reason).await {
                        Ok(()) => assigned += 1,
                        Err(ForemanError::OptimisticLock { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
                None => continue,
            }
        }
        Ok(assigned)
    }

    /// Run a workflow definition to completion.
    pub async fn execute_workflow(&self, definition: WorkflowDefinition) -> Result<WorkflowExecution> {
        workflow::run(self, definition).await
    }

    // ------------------------------------------------------------------
    // Worker-facing surface
    // ------------------------------------------------------------------

    pub async fn register_worker(&self, registration: WorkerRegistration) -> Result<Uuid> {
        let name = registration.name.clone();
        let worker_id = self.workers.register(registration).await?;
        self.bus
            .emit(CoordinatorEvent::WorkerRegistered { worker_id, name });

        // a fresh worker may unblock pending work
        if let Err(e) = self.process_queue().await {
            warn!(error = %e, "queue pass after registration failed");
        }
        Ok(worker_id)
    }

    pub async fn unregister_worker(&self, worker_id: Uuid) -> Result<()> {
        self.workers.unregister(worker_id).await?;
        self.bus
            .emit(CoordinatorEvent::WorkerOffline { worker_id });
        Ok(())
    }

    pub async fn worker_heartbeat(&self, worker_id: Uuid, heartbeat: Heartbeat) -> Result<()> {
        self.workers.heartbeat(worker_id, heartbeat).await
    }

    /// Tasks currently bound to the worker; the poll surface for workers
    /// that receive assignments by polling.
    pub async fn tasks_for_worker(&self, worker_id: Uuid) -> Result<Vec<Task>> {
        self.queue.get_assigned_to(worker_id).await
    }

    pub async fn start_task(&self, task_id: Uuid) -> Result<()> {
        self.distributor.start_task(task_id).await
    }

    pub async fn complete_task(&self, task_id: Uuid, outcome: TaskOutcome) -> Result<()> {
        self.distributor.complete_task(task_id, outcome).await
    }

    pub async fn cancel_task(&self, task_id: Uuid) -> Result<()> {
        self.distributor.cancel_task(task_id).await
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        self.queue.get(task_id).await
    }

    pub async fn get_result(&self, task_id: Uuid) -> Result<Option<TaskResult>> {
        self.queue.get_result(task_id).await
    }

    /// Register a callback for one event kind.
    pub fn on<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&CoordinatorEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.bus.on(kind, callback);
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    pub async fn get_progress(&self) -> Result<ProgressReport> {
        let stats = self.queue.stats().await?;
        let total = stats.total();
        let percent_complete = if total > 0 {
            stats.completed as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        Ok(ProgressReport {
            total,
            pending: stats.pending,
            in_flight: stats.in_flight(),
            completed: stats.completed,
            failed: stats.failed + stats.timeout,
            dead_letter: stats.dead_letter,
            percent_complete,
            estimated_remaining_ms: stats.avg_wait_ms.map(|avg| avg * stats.pending as f64),
        })
    }

    pub async fn get_health(&self) -> Result<SystemHealth> {
        views::system_health(&self.store).await
    }

    // ------------------------------------------------------------------
    // Workflow bookkeeping
    // ------------------------------------------------------------------

    pub(crate) async fn record_dependency(
        &self,
        task_id: Uuid,
        depends_on: Uuid,
        kind: DependencyKind,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on, kind) \
             VALUES (?, ?, ?)",
        )
        .bind(task_id)
        .bind(depends_on)
        .bind(kind)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    pub(crate) async fn resolve_dependencies(&self, depends_on: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE task_dependencies SET resolved_at = ? \
             WHERE depends_on = ? AND resolved_at IS NULL",
        )
        .bind(Utc::now())
        .bind(depends_on)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        for handle in lock(&self.sweep_handles).drain(..) {
            handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn coordinator() -> Arc<Coordinator> {
        Coordinator::new(
            Store::open_in_memory().await.unwrap(),
            CoordinatorConfig::default(),
            WorkerManagerConfig::default(),
        )
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let coordinator = coordinator().await;
        coordinator.start();
        coordinator.start();
        coordinator.stop();
        coordinator.stop();
    }

    #[tokio::test]
    async fn submit_applies_defaults_and_enqueues() {
        let coordinator = coordinator().await;
        let id = coordinator
            .submit_task(TaskSubmission::new("embed", serde_json::json!({"n": 1})))
            .await
            .unwrap();

        let task = coordinator.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.timeout_ms, 300_000);
        assert_eq!(task.max_retries, 3);
        assert!(task.retry_policy().is_some());
    }

    #[tokio::test]
    async fn submissions_rejected_after_shutdown_begins() {
        let coordinator = coordinator().await;
        coordinator.shutdown().await.unwrap();
        let err = coordinator
            .submit_task(TaskSubmission::new("t", serde_json::Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, ForemanError::ShuttingDown));
    }

    #[tokio::test]
    async fn progress_over_empty_queue_is_zero() {
        let coordinator = coordinator().await;
        let progress = coordinator.get_progress().await.unwrap();
        assert_eq!(progress.total, 0);
        assert_eq!(progress.percent_complete, 0.0);
        assert!(progress.estimated_remaining_ms.is_none());
    }

    #[tokio::test]
    async fn submit_without_workers_stays_pending() {
        let coordinator = coordinator().await;
        let id = coordinator
            .submit_task(TaskSubmission::new("t", serde_json::Value::Null))
            .await
            .unwrap();
        let task = coordinator.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, crate::task::TaskStatus::Pending);

        let health = coordinator.get_health().await.unwrap();
        assert_eq!(health.pending_tasks, 1);
        assert_eq!(health.active_workers, 0);
    }
}
