//! Task model and the submission/result/dead-letter types around it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

/// Task lifecycle states.
///
/// `pending → assigned → running → {completed, failed, timeout, cancelled}`.
/// Failed and timed-out tasks may re-enter `pending` via requeue until their
/// retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl TaskStatus {
    /// Completed and cancelled never leave; failed/timeout only via requeue.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Cancelled
        )
    }

    /// Whether the state machine permits `self → next`.
    ///
    /// Same-state transitions are permitted (idempotent no-ops at the queue
    /// layer). Requeue is the only path out of a terminal state, and only
    /// from `failed` or `timeout` back to `pending`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if *self == next {
            return true;
        }
        match self {
            Pending => matches!(next, Assigned | Cancelled),
            Assigned => matches!(next, Running | Pending | Failed | Cancelled),
            Running => matches!(next, Completed | Failed | Timeout | Cancelled),
            Failed => matches!(next, Pending),
            Timeout => matches!(next, Pending),
            Completed | Cancelled => false,
        }
    }
}

/// Priority levels with a derived numeric value; higher means more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl TaskPriority {
    /// Numeric value backing the dispatch index ordering.
    pub fn value(&self) -> i64 {
        match self {
            TaskPriority::Urgent => 4,
            TaskPriority::High => 3,
            TaskPriority::Normal => 2,
            TaskPriority::Low => 1,
        }
    }
}

/// Why a worker was bound to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AssignmentReason {
    CapabilityMatch,
    #[default]
    LoadBalance,
    Affinity,
    RequiredWorker,
    OnlyAvailable,
    Manual,
}

/// How a dependency gates its dependent task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Dependent runs only after the dependency completes successfully.
    #[default]
    Blocking,
    /// Dependent runs once the dependency settles, even on failure.
    Optional,
    /// Ordering hint only; never gates readiness.
    Weak,
}

// ============================================================================
// Retry policy & affinity
// ============================================================================

/// Exponential-backoff retry policy attached to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: i64,
    pub base_delay_ms: i64,
    pub max_delay_ms: i64,
    pub backoff_factor: f64,
    /// Substrings of errors considered retryable. When present, a
    /// non-matching error skips the retry loop and dead-letters immediately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable_errors: Option<Vec<String>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_factor: 2.0,
            retryable_errors: None,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before the given attempt re-enters the queue:
    /// `min(base × factor^(attempt − 1), max)`.
    pub fn delay_for_attempt(&self, attempt: i64) -> Duration {
        let exp = (attempt - 1).max(0) as i32;
        let raw = self.base_delay_ms as f64 * self.backoff_factor.powi(exp);
        Duration::milliseconds((raw as i64).min(self.max_delay_ms))
    }

    /// Whether this error qualifies for a retry under the policy.
    pub fn retries_error(&self, error: &str) -> bool {
        match &self.retryable_errors {
            None => true,
            Some(patterns) => patterns.iter().any(|p| error.contains(p)),
        }
    }
}

/// Worker-selection constraints carried by a task.
///
/// Precedence when several rules are present: required worker, then
/// same-worker-as, then preferred worker, then exclusion-filtered selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AffinityRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_worker: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_worker: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excluded_workers: Option<Vec<Uuid>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_worker_as: Option<Uuid>,
}

// ============================================================================
// Task model
// ============================================================================

/// A unit of externally-executable work owned by the queue.
///
/// The payload is opaque to the coordinator; it only sequences, dispatches,
/// and reports.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub priority: TaskPriority,
    pub priority_value: i64,
    pub status: TaskStatus,
    pub assigned_worker: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest instant the task is eligible for dispatch (retry backoff).
    pub not_before: Option<DateTime<Utc>>,
    /// Set while a dequeue reservation is held by the distributor.
    pub reserved_at: Option<DateTime<Utc>>,
    pub timeout_ms: i64,
    pub retry_policy: Option<Json<RetryPolicy>>,
    pub affinity: Option<Json<AffinityRules>>,
    pub required_capabilities: Option<Json<Vec<String>>>,
    /// Number of execution attempts begun.
    pub attempt_count: i64,
    pub max_retries: i64,
    pub last_error: Option<String>,
    pub result_id: Option<Uuid>,
    pub parent_task_id: Option<Uuid>,
    pub metadata: serde_json::Value,
}

impl Task {
    /// Build a pending task from a submission, filling unset fields from
    /// the coordinator defaults.
    pub fn from_submission(
        submission: TaskSubmission,
        default_timeout_ms: i64,
        default_retry_policy: &RetryPolicy,
    ) -> Self {
        let priority = submission.priority.unwrap_or_default();
        let retry_policy = submission
            .retry_policy
            .or_else(|| Some(default_retry_policy.clone()));
        let max_retries = submission
            .max_retries
            .or_else(|| retry_policy.as_ref().map(|p| p.max_retries))
            .unwrap_or(default_retry_policy.max_retries);

        Self {
            id: Uuid::new_v4(),
            task_type: submission.task_type,
            payload: submission.payload,
            priority,
            priority_value: priority.value(),
            status: TaskStatus::Pending,
            assigned_worker: None,
            created_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
            not_before: None,
            reserved_at: None,
            timeout_ms: submission.timeout_ms.unwrap_or(default_timeout_ms),
            retry_policy: retry_policy.map(Json),
            affinity: submission.affinity.map(Json),
            required_capabilities: submission.required_capabilities.map(Json),
            attempt_count: 0,
            max_retries,
            last_error: None,
            result_id: None,
            parent_task_id: submission.parent_task_id,
            metadata: submission.metadata,
        }
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref().map(|j| &j.0)
    }

    pub fn affinity(&self) -> Option<&AffinityRules> {
        self.affinity.as_ref().map(|j| &j.0)
    }

    pub fn required_capabilities(&self) -> Option<&[String]> {
        self.required_capabilities.as_ref().map(|j| j.0.as_slice())
    }

    /// Whether the task is eligible for peek/dequeue right now.
    pub fn is_dispatchable(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending
            && self.reserved_at.is_none()
            && self.not_before.map_or(true, |nb| nb <= now)
    }
}

/// Inbound task submission. Unset fields fall back to coordinator defaults.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct TaskSubmission {
    pub task_type: String,
    #[builder(default = serde_json::Value::Null)]
    pub payload: serde_json::Value,
    #[builder(default, setter(strip_option))]
    pub priority: Option<TaskPriority>,
    #[builder(default, setter(strip_option))]
    pub timeout_ms: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub retry_policy: Option<RetryPolicy>,
    #[builder(default, setter(strip_option))]
    pub affinity: Option<AffinityRules>,
    #[builder(default, setter(strip_option))]
    pub required_capabilities: Option<Vec<String>>,
    #[builder(default, setter(strip_option))]
    pub max_retries: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub parent_task_id: Option<Uuid>,
    #[builder(default = serde_json::Value::Null)]
    pub metadata: serde_json::Value,
}

impl TaskSubmission {
    /// Convenience constructor for a plain submission.
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::builder().task_type(task_type).payload(payload).build()
    }
}

// ============================================================================
// Results, assignments, dead letters, dependencies
// ============================================================================

/// Outcome reported by a worker when it finishes a task.
#[derive(Debug, Clone, Default, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct TaskOutcome {
    pub success: bool,
    #[builder(default, setter(strip_option))]
    pub output: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub error: Option<String>,
    #[builder(default, setter(strip_option))]
    pub error_stack: Option<String>,
    #[builder(default, setter(strip_option))]
    pub model_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub tokens_used: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub cost: Option<f64>,
}

impl TaskOutcome {
    pub fn ok(output: serde_json::Value) -> Self {
        Self::builder().success(true).output(output).build()
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self::builder().success(false).error(error.into()).build()
    }
}

/// Durable record of one finished execution attempt.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub id: Uuid,
    pub task_id: Uuid,
    pub success: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_stack: Option<String>,
    pub duration_ms: i64,
    pub worker_id: Uuid,
    pub model_id: Option<String>,
    pub tokens_used: Option<i64>,
    pub cost: Option<f64>,
    pub completed_at: DateTime<Utc>,
}

/// The durable binding of one task to one worker for one execution attempt.
///
/// At most one open row (null `released_at`) exists per task, enforced by a
/// partial unique index.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Uuid,
    pub worker_id: Uuid,
    pub task_id: Uuid,
    pub assigned_at: DateTime<Utc>,
    pub reason: AssignmentReason,
    pub reassignment_count: i64,
    pub released_at: Option<DateTime<Utc>>,
}

/// Terminal sink entry for a task whose retries are exhausted.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub task_id: Uuid,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub error: String,
    pub error_stack: Option<String>,
    pub retry_count: i64,
    pub final_status: TaskStatus,
    pub workers_attempted: Json<Vec<Uuid>>,
    pub created_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
    pub replay_count: i64,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_note: Option<String>,
}

/// Edge in the workflow dependency graph.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct TaskDependency {
    pub task_id: Uuid,
    pub depends_on: Uuid,
    pub kind: DependencyKind,
    pub resolved_at: Option<DateTime<Utc>>,
}
