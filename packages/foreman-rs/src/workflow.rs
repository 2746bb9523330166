//! DAG-structured workflows over the task primitives.
//!
//! The runner submits dependency-ready waves of tasks, waits for each wave
//! to settle by polling the queue, and records per-task statuses, results,
//! and errors on the execution. Retries happen underneath in the queue
//! layer; the runner only observes terminal states.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::events::CoordinatorEvent;
use crate::task::{DependencyKind, RetryPolicy, TaskPriority, TaskStatus, TaskSubmission};

/// One task inside a workflow definition. The `id` is workflow-local.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct WorkflowTask {
    pub id: String,
    pub task_type: String,
    #[builder(default = serde_json::Value::Null)]
    pub payload: serde_json::Value,
    #[builder(default)]
    pub depends_on: Vec<String>,
    #[builder(default, setter(strip_option))]
    pub priority: Option<TaskPriority>,
    #[builder(default, setter(strip_option))]
    pub retry_policy: Option<RetryPolicy>,
    #[builder(default, setter(strip_option))]
    pub required_capabilities: Option<Vec<String>>,
    #[builder(default, setter(strip_option))]
    pub timeout_ms: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub max_retries: Option<i64>,
}

/// A workflow: ordered tasks plus concurrency and failure policy.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub tasks: Vec<WorkflowTask>,
    #[builder(default, setter(strip_option))]
    pub max_concurrency: Option<usize>,
    #[builder(default)]
    pub fail_fast: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// One run of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub execution_id: String,
    pub status: WorkflowStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Terminal status of each workflow task, keyed by workflow-local id.
    pub task_statuses: HashMap<String, TaskStatus>,
    /// Outputs of completed tasks.
    pub results: HashMap<String, serde_json::Value>,
    /// Errors of tasks that did not complete.
    pub errors: HashMap<String, String>,
    /// Workflow-level failure message, when the run itself failed.
    pub error: Option<String>,
}

impl WorkflowExecution {
    fn new(workflow_id: &str) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            execution_id: format!("{}-{}", workflow_id, Utc::now().timestamp_millis()),
            status: WorkflowStatus::Pending,
            started_at: None,
            completed_at: None,
            task_statuses: HashMap::new(),
            results: HashMap::new(),
            errors: HashMap::new(),
            error: None,
        }
    }
}

/// Execute a workflow to completion.
///
/// Each pass computes the set of tasks whose dependencies have all settled,
/// submits up to `max_concurrency` of them, and waits for the wave to reach
/// terminal states. An empty ready set with work remaining means the graph
/// cannot make progress.
pub(crate) async fn run(
    coordinator: &Coordinator,
    definition: WorkflowDefinition,
) -> Result<WorkflowExecution> {
    let mut execution = WorkflowExecution::new(&definition.id);

    let mut seen = HashSet::new();
    for task in &definition.tasks {
        if !seen.insert(task.id.as_str()) {
            return Err(crate::error::ForemanError::InvalidSubmission(format!(
                "duplicate workflow task id '{}'",
                task.id
            )));
        }
    }
    for task in &definition.tasks {
        for dep in &task.depends_on {
            if !seen.contains(dep.as_str()) {
                // unreachable before anything is submitted
                return Err(crate::error::ForemanError::WorkflowStuck {
                    execution_id: execution.execution_id,
                    detail: format!("task '{}' depends on unknown task '{}'", task.id, dep),
                });
            }
        }
    }

    execution.status = WorkflowStatus::Running;
    execution.started_at = Some(Utc::now());
    coordinator.bus().emit(CoordinatorEvent::WorkflowStarted {
        execution_id: execution.execution_id.clone(),
    });

    // workflow-local id -> queue task id, filled as waves are submitted
    let mut queue_ids: HashMap<String, uuid::Uuid> = HashMap::new();
    let mut settled: HashSet<String> = HashSet::new();

    while settled.len() < definition.tasks.len() {
        let ready: Vec<usize> = definition
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| {
                !settled.contains(&t.id) && t.depends_on.iter().all(|d| settled.contains(d))
            })
            .map(|(i, _)| i)
            .collect();

        if ready.is_empty() {
            let detail = "stuck: circular dependency or unreachable task";
            return fail_workflow(coordinator, execution, detail.to_string());
        }

        let wave: Vec<usize> = match definition.max_concurrency {
            Some(limit) => ready.into_iter().take(limit.max(1)).collect(),
            None => ready,
        };

        // submit the wave, stamping workflow metadata
        for &idx in &wave {
            let task = &definition.tasks[idx];
            let submission = TaskSubmission {
                task_type: task.task_type.clone(),
                payload: task.payload.clone(),
                priority: task.priority,
                timeout_ms: task.timeout_ms,
                retry_policy: task.retry_policy.clone(),
                affinity: None,
                required_capabilities: task.required_capabilities.clone(),
                max_retries: task.max_retries,
                parent_task_id: None,
                metadata: serde_json::json!({
                    "workflow_id": definition.id.clone(),
                    "execution_id": execution.execution_id.clone(),
                    "workflow_task_id": task.id.clone(),
                }),
            };
            let queue_id = coordinator.submit_task(submission).await?;
            for dep in &task.depends_on {
                if let Some(dep_queue_id) = queue_ids.get(dep) {
                    coordinator
                        .record_dependency(queue_id, *dep_queue_id, DependencyKind::Blocking)
                        .await?;
                }
            }
            queue_ids.insert(task.id.clone(), queue_id);
        }

        // wait for every task in the wave to settle
        loop {
            let mut all_terminal = true;
            for &idx in &wave {
                let queue_id = queue_ids[&definition.tasks[idx].id];
                let task = coordinator.queue().get_required(queue_id).await?;
                if !task.status.is_terminal() {
                    all_terminal = false;
                    break;
                }
            }
            if all_terminal {
                break;
            }
            tokio::time::sleep(coordinator.config().workflow_poll_interval).await;
            // drive assignment so retried tasks get picked back up
            coordinator.process_queue().await?;
        }

        // record outcomes
        for &idx in &wave {
            let workflow_task = &definition.tasks[idx];
            let queue_id = queue_ids[&workflow_task.id];
            let task = coordinator.queue().get_required(queue_id).await?;

            settled.insert(workflow_task.id.clone());
            execution
                .task_statuses
                .insert(workflow_task.id.clone(), task.status);

            if task.status == TaskStatus::Completed {
                coordinator.resolve_dependencies(queue_id).await?;
                if let Some(result) = coordinator.get_result(queue_id).await? {
                    if let Some(output) = result.output {
                        execution.results.insert(workflow_task.id.clone(), output);
                    }
                }
            } else {
                let message = task
                    .last_error
                    .unwrap_or_else(|| format!("task ended as {:?}", task.status));
                execution
                    .errors
                    .insert(workflow_task.id.clone(), message.clone());
                if definition.fail_fast {
                    return fail_workflow(coordinator, execution, message);
                }
            }
        }
    }

    execution.completed_at = Some(Utc::now());
    let all_completed = execution
        .task_statuses
        .values()
        .all(|s| *s == TaskStatus::Completed);

    if all_completed {
        execution.status = WorkflowStatus::Completed;
        coordinator.bus().emit(CoordinatorEvent::WorkflowCompleted {
            execution_id: execution.execution_id.clone(),
        });
    } else {
        execution.status = WorkflowStatus::Failed;
        execution.error = Some("one or more workflow tasks did not complete".into());
        coordinator.bus().emit(CoordinatorEvent::WorkflowFailed {
            execution_id: execution.execution_id.clone(),
            error: execution.error.clone().unwrap_or_default(),
        });
    }
    Ok(execution)
}

fn fail_workflow(
    coordinator: &Coordinator,
    mut execution: WorkflowExecution,
    error: String,
) -> Result<WorkflowExecution> {
    execution.status = WorkflowStatus::Failed;
    execution.completed_at = Some(Utc::now());
    execution.error = Some(error.clone());
    coordinator.bus().emit(CoordinatorEvent::WorkflowFailed {
        execution_id: execution.execution_id.clone(),
        error,
    });
    Ok(execution)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_id_embeds_workflow_id() {
        let execution = WorkflowExecution::new("etl");
        assert!(execution.execution_id.starts_with("etl-"));
        assert_eq!(execution.status, WorkflowStatus::Pending);
    }

    #[test]
    fn definition_builder_defaults() {
        let definition = WorkflowDefinition::builder()
            .id("wf")
            .name("test")
            .tasks(vec![WorkflowTask::builder()
                .id("a")
                .task_type("noop")
                .build()])
            .build();
        assert!(!definition.fail_fast);
        assert!(definition.max_concurrency.is_none());
        assert!(definition.tasks[0].depends_on.is_empty());
    }
}
