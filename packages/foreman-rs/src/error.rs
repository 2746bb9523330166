//! Typed errors for the coordination core.
//!
//! Every public operation returns [`ForemanError`] instead of a generic
//! `anyhow::Error` so callers can pattern-match on the failure mode.

use thiserror::Error;
use uuid::Uuid;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ForemanError>;

/// Error taxonomy for coordinator operations.
#[derive(Debug, Error)]
pub enum ForemanError {
    /// No worker registered under this id.
    #[error("worker {0} not found")]
    WorkerNotFound(Uuid),

    /// No task exists under this id.
    #[error("task {0} not found")]
    TaskNotFound(Uuid),

    /// Every candidate worker was filtered out or at capacity.
    /// The task stays pending; the next queue pass retries.
    #[error("no available worker for task type '{task_type}'")]
    NoAvailableWorker { task_type: String },

    /// Task execution exceeded its timeout budget.
    #[error("task {task_id} timed out after {timeout_ms}ms")]
    TaskTimeout { task_id: Uuid, timeout_ms: i64 },

    /// A conditional update lost a race with a concurrent writer.
    /// Callers may re-read and retry.
    #[error("optimistic lock failure on {entity} {id}")]
    OptimisticLock { entity: &'static str, id: Uuid },

    /// The submission failed validation before touching the store.
    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    /// The workflow cannot make progress.
    #[error("workflow execution {execution_id} stuck: {detail}")]
    WorkflowStuck { execution_id: String, detail: String },

    /// A task hit the per-task reassignment cap.
    #[error("task {task_id} exceeded {limit} reassignments")]
    ReassignmentLimit { task_id: Uuid, limit: i64 },

    /// The coordinator is draining and no longer accepts work.
    #[error("coordinator is shutting down")]
    ShuttingDown,

    /// Persistence-layer failure. Constraint violations are fatal;
    /// transient lock contention is retried once before surfacing here.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Payload or policy (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ForemanError {
    /// Whether this error is transient lock contention worth one retry.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            ForemanError::Database(sqlx::Error::Database(db)) => {
                let msg = db.message();
                msg.contains("database is locked") || msg.contains("database is busy")
            }
            ForemanError::Database(sqlx::Error::PoolTimedOut) => true,
            ForemanError::Database(sqlx::Error::Io(_)) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_not_found_displays_id() {
        let id = Uuid::new_v4();
        let err = ForemanError::WorkerNotFound(id);
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn no_available_worker_names_task_type() {
        let err = ForemanError::NoAvailableWorker {
            task_type: "embed".into(),
        };
        assert!(err.to_string().contains("embed"));
    }

    #[test]
    fn validation_errors_are_not_transient() {
        assert!(!ForemanError::InvalidSubmission("empty type".into()).is_transient());
        assert!(!ForemanError::ShuttingDown.is_transient());
    }
}
