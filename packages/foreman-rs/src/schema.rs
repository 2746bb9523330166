//! Table and view definitions for the coordinator store.
//!
//! Everything here is idempotent (`IF NOT EXISTS`) and runs once at store
//! open. Timestamps are RFC 3339 TEXT; JSON columns hold serialized blobs
//! the core never inspects.

use sqlx::SqlitePool;

use crate::error::Result;

const TABLES: &[&str] = &[
    // Registered executor processes.
    r#"
    CREATE TABLE IF NOT EXISTS workers (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        capabilities TEXT NOT NULL DEFAULT '[]',
        state TEXT NOT NULL DEFAULT 'idle',
        current_load INTEGER NOT NULL DEFAULT 0,
        max_load INTEGER NOT NULL DEFAULT 5,
        last_heartbeat TEXT NOT NULL,
        heartbeat_interval_ms INTEGER NOT NULL DEFAULT 30000,
        consecutive_failures INTEGER NOT NULL DEFAULT 0,
        model_id TEXT,
        created_at TEXT NOT NULL,
        metadata TEXT NOT NULL DEFAULT 'null',
        CHECK (current_load >= 0),
        CHECK (max_load > 0)
    )
    "#,
    // The durable task queue, pending through terminal states.
    r#"
    CREATE TABLE IF NOT EXISTS task_queue (
        id TEXT PRIMARY KEY,
        task_type TEXT NOT NULL,
        payload TEXT NOT NULL DEFAULT 'null',
        priority TEXT NOT NULL DEFAULT 'normal',
        priority_value INTEGER NOT NULL DEFAULT 2,
        status TEXT NOT NULL DEFAULT 'pending',
        assigned_worker TEXT REFERENCES workers(id),
        created_at TEXT NOT NULL,
        assigned_at TEXT,
        started_at TEXT,
        completed_at TEXT,
        not_before TEXT,
        reserved_at TEXT,
        timeout_ms INTEGER NOT NULL,
        retry_policy TEXT,
        affinity TEXT,
        required_capabilities TEXT,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        last_error TEXT,
        result_id TEXT,
        parent_task_id TEXT,
        metadata TEXT NOT NULL DEFAULT 'null',
        CHECK (timeout_ms > 0),
        CHECK (max_retries >= 0)
    )
    "#,
    // One row per finished execution attempt.
    r#"
    CREATE TABLE IF NOT EXISTS task_results (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL REFERENCES task_queue(id),
        success INTEGER NOT NULL,
        output TEXT,
        error TEXT,
        error_stack TEXT,
        duration_ms INTEGER NOT NULL DEFAULT 0,
        worker_id TEXT NOT NULL,
        model_id TEXT,
        tokens_used INTEGER,
        cost REAL,
        completed_at TEXT NOT NULL
    )
    "#,
    // Task-to-worker bindings; the open row has released_at NULL.
    r#"
    CREATE TABLE IF NOT EXISTS worker_assignments (
        id TEXT PRIMARY KEY,
        worker_id TEXT NOT NULL REFERENCES workers(id),
        task_id TEXT NOT NULL REFERENCES task_queue(id),
        assigned_at TEXT NOT NULL,
        reason TEXT NOT NULL DEFAULT 'load_balance',
        reassignment_count INTEGER NOT NULL DEFAULT 0,
        released_at TEXT
    )
    "#,
    // Terminal sink for tasks whose retries are exhausted.
    r#"
    CREATE TABLE IF NOT EXISTS dead_letter_queue (
        task_id TEXT PRIMARY KEY,
        task_type TEXT NOT NULL,
        payload TEXT NOT NULL DEFAULT 'null',
        error TEXT NOT NULL,
        error_stack TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        final_status TEXT NOT NULL,
        workers_attempted TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL,
        dead_lettered_at TEXT NOT NULL,
        replay_count INTEGER NOT NULL DEFAULT 0,
        resolved_at TEXT,
        resolution_note TEXT
    )
    "#,
    // Workflow dependency edges between queue tasks.
    r#"
    CREATE TABLE IF NOT EXISTS task_dependencies (
        task_id TEXT NOT NULL REFERENCES task_queue(id),
        depends_on TEXT NOT NULL REFERENCES task_queue(id),
        kind TEXT NOT NULL DEFAULT 'blocking',
        resolved_at TEXT,
        PRIMARY KEY (task_id, depends_on)
    )
    "#,
    // Accumulated per-worker execution counters.
    r#"
    CREATE TABLE IF NOT EXISTS worker_metrics (
        worker_id TEXT PRIMARY KEY REFERENCES workers(id),
        tasks_completed INTEGER NOT NULL DEFAULT 0,
        tasks_failed INTEGER NOT NULL DEFAULT 0,
        total_duration_ms INTEGER NOT NULL DEFAULT 0,
        total_tokens INTEGER NOT NULL DEFAULT 0,
        total_cost REAL NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL
    )
    "#,
];

const INDEXES: &[&str] = &[
    // Backs peek/dequeue ordering: priority descending, FIFO within a level.
    r#"
    CREATE INDEX IF NOT EXISTS idx_task_queue_dispatch
        ON task_queue (status, priority_value DESC, created_at ASC)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_task_queue_worker
        ON task_queue (assigned_worker) WHERE assigned_worker IS NOT NULL
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_task_results_task
        ON task_results (task_id)
    "#,
    // At most one open assignment per task.
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_assignments_open
        ON worker_assignments (task_id) WHERE released_at IS NULL
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_assignments_worker
        ON worker_assignments (worker_id)
    "#,
];

const VIEWS: &[&str] = &[
    // Active workers with a staleness indicator (default multiplier 2).
    r#"
    CREATE VIEW IF NOT EXISTS v_active_workers AS
    SELECT
        w.id,
        w.name,
        w.state,
        w.current_load,
        w.max_load,
        w.last_heartbeat,
        CAST((julianday('now') - julianday(w.last_heartbeat)) * 86400000 AS INTEGER)
            AS ms_since_heartbeat,
        CASE
            WHEN (julianday('now') - julianday(w.last_heartbeat)) * 86400000
                 > w.heartbeat_interval_ms * 2
            THEN 1 ELSE 0
        END AS is_stale
    FROM workers w
    WHERE w.state IN ('idle', 'busy')
    "#,
    // Pending tasks with how long they have been waiting.
    r#"
    CREATE VIEW IF NOT EXISTS v_pending_tasks AS
    SELECT
        t.id,
        t.task_type,
        t.priority,
        t.priority_value,
        t.created_at,
        t.attempt_count,
        CAST((julianday('now') - julianday(t.created_at)) * 86400000 AS INTEGER)
            AS wait_ms
    FROM task_queue t
    WHERE t.status = 'pending'
    ORDER BY t.priority_value DESC, t.created_at ASC
    "#,
    // Running tasks past their timeout budget.
    r#"
    CREATE VIEW IF NOT EXISTS v_timeout_candidates AS
    SELECT
        t.id,
        t.task_type,
        t.assigned_worker,
        t.started_at,
        t.timeout_ms,
        CAST((julianday('now') - julianday(t.started_at)) * 86400000 AS INTEGER)
            AS running_ms
    FROM task_queue t
    WHERE t.status = 'running'
      AND t.started_at IS NOT NULL
      AND (julianday('now') - julianday(t.started_at)) * 86400000 > t.timeout_ms
    "#,
    // Workers overdue for a heartbeat (default multiplier 2).
    r#"
    CREATE VIEW IF NOT EXISTS v_stale_workers AS
    SELECT
        w.id,
        w.name,
        w.state,
        w.last_heartbeat,
        w.heartbeat_interval_ms,
        CAST((julianday('now') - julianday(w.last_heartbeat)) * 86400000 AS INTEGER)
            AS ms_since_heartbeat
    FROM workers w
    WHERE w.state != 'offline'
      AND (julianday('now') - julianday(w.last_heartbeat)) * 86400000
          > w.heartbeat_interval_ms * 2
    "#,
    // Success rate, average duration, and token/cost totals per worker.
    r#"
    CREATE VIEW IF NOT EXISTS v_worker_performance AS
    SELECT
        w.id AS worker_id,
        w.name,
        w.state,
        m.tasks_completed,
        m.tasks_failed,
        CASE
            WHEN m.tasks_completed + m.tasks_failed > 0
            THEN CAST(m.tasks_completed AS REAL) / (m.tasks_completed + m.tasks_failed)
            ELSE 0
        END AS success_rate,
        CASE
            WHEN m.tasks_completed + m.tasks_failed > 0
            THEN m.total_duration_ms / (m.tasks_completed + m.tasks_failed)
            ELSE 0
        END AS avg_duration_ms,
        m.total_tokens,
        m.total_cost
    FROM workers w
    JOIN worker_metrics m ON m.worker_id = w.id
    "#,
    // Queue depth grouped by type, status, and priority.
    r#"
    CREATE VIEW IF NOT EXISTS v_queue_depth AS
    SELECT
        t.task_type,
        t.status,
        t.priority,
        COUNT(*) AS depth
    FROM task_queue t
    GROUP BY t.task_type, t.status, t.priority
    "#,
    // One-row snapshot of the whole system.
    r#"
    CREATE VIEW IF NOT EXISTS v_system_health AS
    SELECT
        (SELECT COUNT(*) FROM workers) AS total_workers,
        (SELECT COUNT(*) FROM workers WHERE state IN ('idle', 'busy')) AS active_workers,
        (SELECT COUNT(*) FROM workers WHERE state = 'error') AS error_workers,
        (SELECT COUNT(*) FROM task_queue WHERE status = 'pending') AS pending_tasks,
        (SELECT COUNT(*) FROM task_queue WHERE status IN ('assigned', 'running'))
            AS in_flight_tasks,
        (SELECT COUNT(*) FROM task_queue WHERE status = 'completed') AS completed_tasks,
        (SELECT COUNT(*) FROM task_queue WHERE status IN ('failed', 'timeout'))
            AS failed_tasks,
        (SELECT COUNT(*) FROM task_queue WHERE status = 'cancelled') AS cancelled_tasks,
        (SELECT COUNT(*) FROM dead_letter_queue) AS dead_letter_tasks
    "#,
];

/// Create all tables, indexes, and views.
pub async fn init(pool: &SqlitePool) -> Result<()> {
    for ddl in TABLES.iter().chain(INDEXES).chain(VIEWS) {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_is_idempotent() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        init(&pool).await.unwrap();
        init(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn views_are_queryable_when_empty() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        init(&pool).await.unwrap();

        for view in [
            "v_active_workers",
            "v_pending_tasks",
            "v_timeout_candidates",
            "v_stale_workers",
            "v_worker_performance",
            "v_queue_depth",
        ] {
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", view))
                .fetch_one(&pool)
                .await
                .unwrap();
            assert_eq!(count, 0, "view {} should be empty", view);
        }

        let health: i64 = sqlx::query_scalar("SELECT total_workers FROM v_system_health")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(health, 0);
    }
}
