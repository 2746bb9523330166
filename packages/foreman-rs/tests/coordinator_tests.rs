//! End-to-end lifecycle tests: submission through assignment, execution,
//! retries, timeouts, dead-lettering, and workflows.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use foreman::{
    AffinityRules, CoordinatorEvent, EventKind, TaskOutcome, TaskStatus, TaskSubmission,
    WorkerState, WorkflowDefinition, WorkflowStatus, WorkflowTask,
};
use uuid::Uuid;

use common::{coordinator, coordinator_on_disk, register_worker, submission};

#[tokio::test]
async fn happy_path_submit_assign_complete() {
    let coordinator = coordinator().await;

    // capture task:assigned pairings
    let assigned: Arc<Mutex<Vec<(Uuid, Uuid)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = assigned.clone();
    coordinator.on(EventKind::TaskAssigned, move |event| {
        if let CoordinatorEvent::TaskAssigned { task_id, worker_id } = event {
            sink.lock().unwrap().push((*task_id, *worker_id));
        }
        Ok(())
    });

    let w1 = register_worker(&coordinator, "w1", &["c"], 2).await;
    let task_id = coordinator
        .submit_task(submission("t", &["c"], 3))
        .await
        .unwrap();

    // submit triggers the queue pass synchronously
    assert_eq!(assigned.lock().unwrap().as_slice(), &[(task_id, w1)]);
    let task = coordinator.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Assigned);
    assert_eq!(task.assigned_worker, Some(w1));

    // worker reports start and success
    coordinator.start_task(task_id).await.unwrap();
    coordinator
        .complete_task(task_id, TaskOutcome::ok(serde_json::json!("ok")))
        .await
        .unwrap();

    let result = coordinator.get_result(task_id).await.unwrap().unwrap();
    assert!(result.success);
    assert_eq!(result.output, Some(serde_json::json!("ok")));
    assert_eq!(result.worker_id, w1);

    let stats = coordinator.queue().stats().await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.pending, 0);

    let worker = coordinator.workers().get(w1).await.unwrap();
    assert_eq!(worker.current_load, 0);
    assert_eq!(worker.state, WorkerState::Idle);
}

#[tokio::test]
async fn retry_then_success_counts_two_attempts() {
    let coordinator = coordinator().await;
    register_worker(&coordinator, "w1", &["c"], 2).await;

    let task_id = coordinator
        .submit_task(submission("t", &["c"], 2))
        .await
        .unwrap();

    // first attempt fails
    coordinator.start_task(task_id).await.unwrap();
    coordinator
        .complete_task(task_id, TaskOutcome::err("boom"))
        .await
        .unwrap();

    let task = coordinator.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempt_count, 1);
    assert!(task.assigned_worker.is_none());

    // second attempt succeeds
    coordinator.process_queue().await.unwrap();
    coordinator.start_task(task_id).await.unwrap();
    coordinator
        .complete_task(task_id, TaskOutcome::ok(serde_json::json!(42)))
        .await
        .unwrap();

    let task = coordinator.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempt_count, 2);
}

#[tokio::test]
async fn exhausted_retries_land_in_dead_letter() {
    let coordinator = coordinator().await;
    register_worker(&coordinator, "w1", &["c"], 2).await;

    let task_id = coordinator
        .submit_task(submission("t", &["c"], 1))
        .await
        .unwrap();

    for _ in 0..2 {
        coordinator.process_queue().await.unwrap();
        coordinator.start_task(task_id).await.unwrap();
        coordinator
            .complete_task(task_id, TaskOutcome::err("boom"))
            .await
            .unwrap();
    }

    let task = coordinator.get_task(task_id).await.unwrap().unwrap();
    assert!(task.status.is_terminal());

    let dead = coordinator.queue().dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].task_id, task_id);
    assert_eq!(dead[0].error, "boom");
    assert_eq!(dead[0].retry_count, 2);

    // exhausted tasks never reappear in the dispatch path
    assert!(coordinator.queue().peek().await.unwrap().is_none());
}

#[tokio::test]
async fn zero_retry_budget_dead_letters_on_first_failure() {
    let coordinator = coordinator().await;
    register_worker(&coordinator, "w1", &["c"], 2).await;

    let task_id = coordinator
        .submit_task(submission("t", &["c"], 0))
        .await
        .unwrap();
    coordinator.start_task(task_id).await.unwrap();
    coordinator
        .complete_task(task_id, TaskOutcome::err("boom"))
        .await
        .unwrap();

    let dead = coordinator.queue().dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].retry_count, 1);
}

#[tokio::test]
async fn timed_out_task_charges_the_worker() {
    let coordinator = coordinator().await;
    let w1 = register_worker(&coordinator, "w1", &["c"], 2).await;

    let task_id = coordinator
        .submit_task(
            TaskSubmission::builder()
                .task_type("t")
                .required_capabilities(vec!["c".to_string()])
                .timeout_ms(100i64)
                .max_retries(0i64)
                .build(),
        )
        .await
        .unwrap();

    // worker starts but never completes
    coordinator.start_task(task_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    let candidates = coordinator.distributor().check_timeouts().await.unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].id, task_id);

    let task = coordinator.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Timeout);

    let worker = coordinator.workers().get(w1).await.unwrap();
    assert_eq!(worker.consecutive_failures, 1);
    assert_eq!(worker.current_load, 0);

    // retry budget was zero, so the timeout dead-letters
    let dead = coordinator.queue().dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].final_status, TaskStatus::Timeout);
}

#[tokio::test]
async fn required_worker_offline_leaves_task_pending() {
    let coordinator = coordinator().await;
    let w1 = register_worker(&coordinator, "w1", &["c"], 2).await;
    coordinator.unregister_worker(w1).await.unwrap();

    let task_id = coordinator
        .submit_task(
            TaskSubmission::builder()
                .task_type("t")
                .affinity(AffinityRules {
                    required_worker: Some(w1),
                    ..Default::default()
                })
                .build(),
        )
        .await
        .unwrap();

    for _ in 0..3 {
        assert_eq!(coordinator.process_queue().await.unwrap(), 0);
    }
    let task = coordinator.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.assigned_worker.is_none());
}

#[tokio::test]
async fn late_completion_after_cancel_is_discarded() {
    let coordinator = coordinator().await;
    register_worker(&coordinator, "w1", &["c"], 2).await;

    let task_id = coordinator
        .submit_task(submission("t", &["c"], 3))
        .await
        .unwrap();
    coordinator.start_task(task_id).await.unwrap();
    coordinator.cancel_task(task_id).await.unwrap();

    // the worker's completion arrives after the cancellation won
    coordinator
        .complete_task(task_id, TaskOutcome::ok(serde_json::json!("late")))
        .await
        .unwrap();

    let task = coordinator.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(coordinator.get_result(task_id).await.unwrap().is_none());
}

#[tokio::test]
async fn double_completion_is_a_noop() {
    let coordinator = coordinator().await;
    register_worker(&coordinator, "w1", &["c"], 2).await;

    let task_id = coordinator
        .submit_task(submission("t", &["c"], 3))
        .await
        .unwrap();
    coordinator.start_task(task_id).await.unwrap();
    coordinator
        .complete_task(task_id, TaskOutcome::ok(serde_json::json!(1)))
        .await
        .unwrap();
    coordinator
        .complete_task(task_id, TaskOutcome::err("should be ignored"))
        .await
        .unwrap();

    let task = coordinator.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    let result = coordinator.get_result(task_id).await.unwrap().unwrap();
    assert!(result.success);
}

#[tokio::test]
async fn load_sum_matches_in_flight_tasks() {
    let coordinator = coordinator().await;
    register_worker(&coordinator, "w1", &["c"], 1).await;
    register_worker(&coordinator, "w2", &["c"], 1).await;

    for _ in 0..3 {
        coordinator
            .submit_task(submission("t", &["c"], 3))
            .await
            .unwrap();
    }

    // only two units of capacity exist; the third submission waits
    let worker_stats = coordinator.workers().stats().await.unwrap();
    let queue_stats = coordinator.queue().stats().await.unwrap();
    assert_eq!(worker_stats.used_capacity, 2);
    assert_eq!(queue_stats.in_flight(), 2);
    assert_eq!(queue_stats.pending, 1);
}

#[tokio::test]
async fn batch_submission_preserves_order_and_fires_events() {
    let coordinator = coordinator().await;
    let enqueued: Arc<Mutex<Vec<Uuid>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = enqueued.clone();
    coordinator.on(EventKind::TaskEnqueued, move |event| {
        if let CoordinatorEvent::TaskEnqueued { task_id, .. } = event {
            sink.lock().unwrap().push(*task_id);
        }
        Ok(())
    });

    let ids = coordinator
        .submit_tasks(vec![
            TaskSubmission::new("a", serde_json::Value::Null),
            TaskSubmission::new("b", serde_json::Value::Null),
        ])
        .await
        .unwrap();
    assert_eq!(*enqueued.lock().unwrap(), ids);
}

#[tokio::test]
async fn workflow_with_dependencies_runs_in_waves() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = coordinator_on_disk(&dir).await;
    let w1 = register_worker(&coordinator, "w1", &["c"], 2).await;
    let w2 = register_worker(&coordinator, "w2", &["c"], 2).await;

    let definition = WorkflowDefinition::builder()
        .id("pipeline")
        .name("three step pipeline")
        .tasks(vec![
            WorkflowTask::builder()
                .id("a")
                .task_type("step")
                .required_capabilities(vec!["c".to_string()])
                .retry_policy(common::immediate_retry(2))
                .build(),
            WorkflowTask::builder()
                .id("b")
                .task_type("flaky")
                .depends_on(vec!["a".to_string()])
                .required_capabilities(vec!["c".to_string()])
                .retry_policy(common::immediate_retry(2))
                .build(),
            WorkflowTask::builder()
                .id("c")
                .task_type("step")
                .depends_on(vec!["a".to_string()])
                .required_capabilities(vec!["c".to_string()])
                .retry_policy(common::immediate_retry(2))
                .build(),
        ])
        .max_concurrency(2usize)
        .build();

    // simulate the two workers: poll for assignments, start, and complete.
    // "flaky" fails its first attempt and succeeds on the second.
    let simulator = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            loop {
                for worker in [w1, w2] {
                    let Ok(tasks) = coordinator.tasks_for_worker(worker).await else {
                        return;
                    };
                    for task in tasks {
                        if task.status != TaskStatus::Assigned {
                            continue;
                        }
                        if coordinator.start_task(task.id).await.is_err() {
                            return;
                        }
                        let started = coordinator
                            .get_task(task.id)
                            .await
                            .ok()
                            .flatten()
                            .expect("task exists");
                        let outcome = if started.task_type == "flaky" && started.attempt_count < 2
                        {
                            TaskOutcome::err("transient flake")
                        } else {
                            TaskOutcome::ok(serde_json::json!({
                                "done": started.task_type,
                            }))
                        };
                        let _ = coordinator.complete_task(task.id, outcome).await;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    };

    let execution = coordinator.execute_workflow(definition).await.unwrap();
    simulator.abort();

    assert_eq!(execution.status, WorkflowStatus::Completed);
    assert_eq!(execution.task_statuses.len(), 3);
    assert!(execution
        .task_statuses
        .values()
        .all(|s| *s == TaskStatus::Completed));
    assert_eq!(execution.results.len(), 3);
    assert!(execution.errors.is_empty());
}

#[tokio::test]
async fn workflow_with_cycle_fails_as_stuck() {
    let coordinator = coordinator().await;
    register_worker(&coordinator, "w1", &["c"], 2).await;

    let definition = WorkflowDefinition::builder()
        .id("cyclic")
        .name("cycle")
        .tasks(vec![
            WorkflowTask::builder()
                .id("a")
                .task_type("step")
                .depends_on(vec!["b".to_string()])
                .build(),
            WorkflowTask::builder()
                .id("b")
                .task_type("step")
                .depends_on(vec!["a".to_string()])
                .build(),
        ])
        .build();

    let execution = coordinator.execute_workflow(definition).await.unwrap();
    assert_eq!(execution.status, WorkflowStatus::Failed);
    assert!(execution.error.unwrap().contains("stuck"));
}

#[tokio::test]
async fn workflow_with_unknown_dependency_is_rejected() {
    let coordinator = coordinator().await;
    let definition = WorkflowDefinition::builder()
        .id("broken")
        .name("broken")
        .tasks(vec![WorkflowTask::builder()
            .id("a")
            .task_type("step")
            .depends_on(vec!["ghost".to_string()])
            .build()])
        .build();

    let err = coordinator.execute_workflow(definition).await.unwrap_err();
    assert!(matches!(err, foreman::ForemanError::WorkflowStuck { .. }));
}

#[tokio::test]
async fn fail_fast_workflow_stops_on_first_failure() {
    let coordinator = coordinator().await;
    let w1 = register_worker(&coordinator, "w1", &["c"], 2).await;

    let definition = WorkflowDefinition::builder()
        .id("ff")
        .name("fail fast")
        .tasks(vec![
            WorkflowTask::builder()
                .id("doomed")
                .task_type("step")
                .required_capabilities(vec!["c".to_string()])
                .retry_policy(common::immediate_retry(0))
                .max_retries(0i64)
                .build(),
            WorkflowTask::builder()
                .id("never")
                .task_type("step")
                .depends_on(vec!["doomed".to_string()])
                .build(),
        ])
        .fail_fast(true)
        .build();

    let simulator = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            loop {
                if let Ok(tasks) = coordinator.tasks_for_worker(w1).await {
                    for task in tasks {
                        if task.status == TaskStatus::Assigned {
                            let _ = coordinator.start_task(task.id).await;
                            let _ = coordinator
                                .complete_task(task.id, TaskOutcome::err("no good"))
                                .await;
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    };

    let execution = coordinator.execute_workflow(definition).await.unwrap();
    simulator.abort();

    assert_eq!(execution.status, WorkflowStatus::Failed);
    assert_eq!(execution.errors.len(), 1);
    assert!(execution.errors.contains_key("doomed"));
    assert!(!execution.task_statuses.contains_key("never"));
}

#[tokio::test]
async fn heartbeat_sweep_offlines_silent_worker_and_requeues() {
    let coordinator = coordinator().await;
    let w1 = register_worker(&coordinator, "w1", &["c"], 2).await;
    let task_id = coordinator
        .submit_task(submission("t", &["c"], 3))
        .await
        .unwrap();
    assert_eq!(
        coordinator.get_task(task_id).await.unwrap().unwrap().status,
        TaskStatus::Assigned
    );

    // silence the worker far past interval * multiplier
    sqlx::query("UPDATE workers SET last_heartbeat = ? WHERE id = ?")
        .bind(chrono::Utc::now() - chrono::Duration::seconds(120))
        .bind(w1)
        .execute(coordinator.store().pool())
        .await
        .unwrap();

    coordinator.run_heartbeat_sweep().await.unwrap();

    let worker = coordinator.workers().get(w1).await.unwrap();
    assert_eq!(worker.state, WorkerState::Offline);

    // no other worker exists, so the task went back to pending
    let task = coordinator.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.assigned_worker.is_none());
}
