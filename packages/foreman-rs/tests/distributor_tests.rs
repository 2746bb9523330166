//! Distributor-level tests: affinity precedence, reassignment, and the
//! interaction between selection policy and worker state.

mod common;

use foreman::{AffinityRules, ForemanError, TaskOutcome, TaskStatus, TaskSubmission, WorkerState};

use common::{coordinator, register_worker, submission};

fn with_affinity(task_type: &str, affinity: AffinityRules) -> TaskSubmission {
    TaskSubmission::builder()
        .task_type(task_type)
        .affinity(affinity)
        .build()
}

#[tokio::test]
async fn required_worker_wins_over_load_balance() {
    let coordinator = coordinator().await;
    let _idle = register_worker(&coordinator, "idle", &["c"], 5).await;
    let busy = register_worker(&coordinator, "busy", &["c"], 5).await;
    coordinator.workers().increment_load(busy).await.unwrap();

    let task_id = coordinator
        .submit_task(with_affinity(
            "t",
            AffinityRules {
                required_worker: Some(busy),
                ..Default::default()
            },
        ))
        .await
        .unwrap();

    let task = coordinator.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.assigned_worker, Some(busy));
}

#[tokio::test]
async fn preferred_worker_miss_falls_through_to_selection() {
    let coordinator = coordinator().await;
    let gone = register_worker(&coordinator, "gone", &["c"], 5).await;
    coordinator.unregister_worker(gone).await.unwrap();
    let alive = register_worker(&coordinator, "alive", &["c"], 5).await;

    let task_id = coordinator
        .submit_task(with_affinity(
            "t",
            AffinityRules {
                preferred_worker: Some(gone),
                ..Default::default()
            },
        ))
        .await
        .unwrap();

    // unlike required_worker, a preferred miss still assigns
    let task = coordinator.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.assigned_worker, Some(alive));
}

#[tokio::test]
async fn excluded_workers_are_filtered_out() {
    let coordinator = coordinator().await;
    let banned = register_worker(&coordinator, "banned", &["c"], 5).await;
    let other = register_worker(&coordinator, "other", &["c"], 5).await;

    let task_id = coordinator
        .submit_task(with_affinity(
            "t",
            AffinityRules {
                excluded_workers: Some(vec![banned]),
                ..Default::default()
            },
        ))
        .await
        .unwrap();

    let task = coordinator.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.assigned_worker, Some(other));
}

#[tokio::test]
async fn same_worker_as_binds_to_the_other_tasks_owner() {
    let coordinator = coordinator().await;
    let _w1 = register_worker(&coordinator, "w1", &["c"], 5).await;
    let _w2 = register_worker(&coordinator, "w2", &["c"], 5).await;

    let first = coordinator
        .submit_task(submission("t", &["c"], 3))
        .await
        .unwrap();
    let owner = coordinator
        .get_task(first)
        .await
        .unwrap()
        .unwrap()
        .assigned_worker
        .unwrap();

    let second = coordinator
        .submit_task(with_affinity(
            "t",
            AffinityRules {
                same_worker_as: Some(first),
                ..Default::default()
            },
        ))
        .await
        .unwrap();

    let task = coordinator.get_task(second).await.unwrap().unwrap();
    assert_eq!(task.assigned_worker, Some(owner));
}

#[tokio::test]
async fn capability_mismatch_leaves_task_pending() {
    let coordinator = coordinator().await;
    register_worker(&coordinator, "w1", &["search"], 5).await;

    let task_id = coordinator
        .submit_task(submission("t", &["gpu"], 3))
        .await
        .unwrap();
    let task = coordinator.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
}

#[tokio::test]
async fn reassign_moves_load_between_workers() {
    let coordinator = coordinator().await;
    let w1 = register_worker(&coordinator, "w1", &["c"], 5).await;
    let w2 = register_worker(&coordinator, "w2", &["c"], 5).await;

    let task_id = coordinator
        .submit_task(with_affinity(
            "t",
            AffinityRules {
                required_worker: Some(w1),
                ..Default::default()
            },
        ))
        .await
        .unwrap();
    assert_eq!(coordinator.workers().get(w1).await.unwrap().current_load, 1);

    coordinator
        .distributor()
        .reassign_task(task_id, w2)
        .await
        .unwrap();

    assert_eq!(coordinator.workers().get(w1).await.unwrap().current_load, 0);
    assert_eq!(coordinator.workers().get(w2).await.unwrap().current_load, 1);

    let task = coordinator.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.assigned_worker, Some(w2));
    assert_eq!(task.status, TaskStatus::Assigned);
}

#[tokio::test]
async fn reassign_to_current_owner_is_a_noop() {
    let coordinator = coordinator().await;
    let w1 = register_worker(&coordinator, "w1", &["c"], 5).await;

    let task_id = coordinator
        .submit_task(submission("t", &["c"], 3))
        .await
        .unwrap();
    coordinator
        .distributor()
        .reassign_task(task_id, w1)
        .await
        .unwrap();

    // load unchanged: old decrement and new increment net to zero
    assert_eq!(coordinator.workers().get(w1).await.unwrap().current_load, 1);
}

#[tokio::test]
async fn reassignment_count_is_capped() {
    let coordinator = coordinator().await;
    let workers: Vec<_> = {
        let mut ids = Vec::new();
        for name in ["a", "b", "c", "d", "e", "f", "g"] {
            ids.push(register_worker(&coordinator, name, &["c"], 5).await);
        }
        ids
    };

    let task_id = coordinator
        .submit_task(with_affinity(
            "t",
            AffinityRules {
                required_worker: Some(workers[0]),
                ..Default::default()
            },
        ))
        .await
        .unwrap();

    // five reassignments are allowed, the sixth hits the cap
    for target in &workers[1..6] {
        coordinator
            .distributor()
            .reassign_task(task_id, *target)
            .await
            .unwrap();
    }
    let err = coordinator
        .distributor()
        .reassign_task(task_id, workers[6])
        .await
        .unwrap_err();
    assert!(matches!(err, ForemanError::ReassignmentLimit { .. }));
}

#[tokio::test]
async fn non_retryable_error_skips_the_retry_loop() {
    let coordinator = coordinator().await;
    register_worker(&coordinator, "w1", &["c"], 5).await;

    let task_id = coordinator
        .submit_task(
            TaskSubmission::builder()
                .task_type("t")
                .retry_policy(foreman::RetryPolicy {
                    max_retries: 3,
                    base_delay_ms: 0,
                    max_delay_ms: 0,
                    backoff_factor: 1.0,
                    retryable_errors: Some(vec!["rate limit".to_string()]),
                })
                .build(),
        )
        .await
        .unwrap();

    coordinator.start_task(task_id).await.unwrap();
    coordinator
        .complete_task(task_id, TaskOutcome::err("schema validation failed"))
        .await
        .unwrap();

    // budget remained, but the error is outside the retryable set
    let dead = coordinator.queue().dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].retry_count, 1);
}

#[tokio::test]
async fn worker_error_state_blocks_selection_until_heartbeat() {
    let coordinator = coordinator().await;
    let w1 = register_worker(&coordinator, "w1", &["c"], 5).await;
    for _ in 0..3 {
        coordinator.workers().record_failure(w1).await.unwrap();
    }
    assert_eq!(
        coordinator.workers().get(w1).await.unwrap().state,
        WorkerState::Error
    );

    let task_id = coordinator
        .submit_task(submission("t", &["c"], 3))
        .await
        .unwrap();
    assert_eq!(
        coordinator.get_task(task_id).await.unwrap().unwrap().status,
        TaskStatus::Pending
    );

    // prescribed recovery: heartbeat reporting idle
    coordinator
        .worker_heartbeat(
            w1,
            foreman::Heartbeat {
                status: Some(WorkerState::Idle),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    coordinator.process_queue().await.unwrap();
    assert_eq!(
        coordinator.get_task(task_id).await.unwrap().unwrap().status,
        TaskStatus::Assigned
    );
}

#[tokio::test]
async fn dead_letter_replay_returns_task_to_queue() {
    let coordinator = coordinator().await;
    register_worker(&coordinator, "w1", &["c"], 5).await;

    let task_id = coordinator
        .submit_task(submission("t", &["c"], 0))
        .await
        .unwrap();
    coordinator.start_task(task_id).await.unwrap();
    coordinator
        .complete_task(task_id, TaskOutcome::err("boom"))
        .await
        .unwrap();
    assert_eq!(coordinator.queue().dead_letters(10).await.unwrap().len(), 1);

    coordinator.queue().replay_dead_letter(task_id).await.unwrap();
    coordinator.process_queue().await.unwrap();

    let task = coordinator.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Assigned);
    assert_eq!(task.attempt_count, 0);
}
