//! Read-only aggregate views for observability.
//!
//! Each function reads one of the SQL views created by the schema; nothing
//! here mutates state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::Result;
use crate::store::Store;
use crate::task::{TaskPriority, TaskStatus};
use crate::worker::WorkerState;

/// Active worker with a staleness indicator.
#[derive(FromRow, Debug, Clone, Serialize)]
pub struct ActiveWorkerRow {
    pub id: Uuid,
    pub name: String,
    pub state: WorkerState,
    pub current_load: i64,
    pub max_load: i64,
    pub last_heartbeat: DateTime<Utc>,
    pub ms_since_heartbeat: i64,
    pub is_stale: bool,
}

/// Pending task with its accumulated wait time.
#[derive(FromRow, Debug, Clone, Serialize)]
pub struct PendingTaskRow {
    pub id: Uuid,
    pub task_type: String,
    pub priority: TaskPriority,
    pub priority_value: i64,
    pub created_at: DateTime<Utc>,
    pub attempt_count: i64,
    pub wait_ms: i64,
}

/// Running task past its timeout budget.
#[derive(FromRow, Debug, Clone, Serialize)]
pub struct TimeoutCandidate {
    pub id: Uuid,
    pub task_type: String,
    pub assigned_worker: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub timeout_ms: i64,
    pub running_ms: i64,
}

/// Worker overdue for a heartbeat.
#[derive(FromRow, Debug, Clone, Serialize)]
pub struct StaleWorkerRow {
    pub id: Uuid,
    pub name: String,
    pub state: WorkerState,
    pub last_heartbeat: DateTime<Utc>,
    pub heartbeat_interval_ms: i64,
    pub ms_since_heartbeat: i64,
}

/// Per-worker execution summary.
#[derive(FromRow, Debug, Clone, Serialize)]
pub struct WorkerPerformanceRow {
    pub worker_id: Uuid,
    pub name: String,
    pub state: WorkerState,
    pub tasks_completed: i64,
    pub tasks_failed: i64,
    pub success_rate: f64,
    pub avg_duration_ms: i64,
    pub total_tokens: i64,
    pub total_cost: f64,
}

/// Queue depth for one (type, status, priority) bucket.
#[derive(FromRow, Debug, Clone, Serialize)]
pub struct QueueDepthRow {
    pub task_type: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub depth: i64,
}

/// One-row snapshot of the whole system.
#[derive(FromRow, Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub total_workers: i64,
    pub active_workers: i64,
    pub error_workers: i64,
    pub pending_tasks: i64,
    pub in_flight_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub cancelled_tasks: i64,
    pub dead_letter_tasks: i64,
}

pub async fn active_workers(store: &Store) -> Result<Vec<ActiveWorkerRow>> {
    Ok(sqlx::query_as("SELECT * FROM v_active_workers")
        .fetch_all(store.pool())
        .await?)
}

pub async fn pending_tasks(store: &Store) -> Result<Vec<PendingTaskRow>> {
    Ok(sqlx::query_as("SELECT * FROM v_pending_tasks")
        .fetch_all(store.pool())
        .await?)
}

pub async fn timeout_candidates(store: &Store) -> Result<Vec<TimeoutCandidate>> {
    Ok(sqlx::query_as("SELECT * FROM v_timeout_candidates")
        .fetch_all(store.pool())
        .await?)
}

pub async fn stale_workers(store: &Store) -> Result<Vec<StaleWorkerRow>> {
    Ok(sqlx::query_as("SELECT * FROM v_stale_workers")
        .fetch_all(store.pool())
        .await?)
}

pub async fn worker_performance(store: &Store) -> Result<Vec<WorkerPerformanceRow>> {
    Ok(sqlx::query_as("SELECT * FROM v_worker_performance")
        .fetch_all(store.pool())
        .await?)
}

pub async fn queue_depth(store: &Store) -> Result<Vec<QueueDepthRow>> {
    Ok(sqlx::query_as("SELECT * FROM v_queue_depth")
        .fetch_all(store.pool())
        .await?)
}

pub async fn system_health(store: &Store) -> Result<SystemHealth> {
    Ok(sqlx::query_as("SELECT * FROM v_system_health")
        .fetch_one(store.pool())
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_snapshot_on_empty_store() {
        let store = Store::open_in_memory().await.unwrap();
        let health = system_health(&store).await.unwrap();
        assert_eq!(health.total_workers, 0);
        assert_eq!(health.pending_tasks, 0);
        assert_eq!(health.dead_letter_tasks, 0);
    }

    #[tokio::test]
    async fn queue_depth_groups_by_type_status_priority() {
        let store = Store::open_in_memory().await.unwrap();
        let queue = crate::queue::TaskQueue::new(store.clone());
        queue
            .enqueue(crate::task::TaskSubmission::new(
                "embed",
                serde_json::Value::Null,
            ))
            .await
            .unwrap();
        queue
            .enqueue(crate::task::TaskSubmission::new(
                "embed",
                serde_json::Value::Null,
            ))
            .await
            .unwrap();

        let depth = queue_depth(&store).await.unwrap();
        assert_eq!(depth.len(), 1);
        assert_eq!(depth[0].task_type, "embed");
        assert_eq!(depth[0].depth, 2);
        assert_eq!(depth[0].status, TaskStatus::Pending);
    }
}
