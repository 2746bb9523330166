//! Shared fixtures for coordinator integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use foreman::{
    Coordinator, CoordinatorConfig, RetryPolicy, Store, TaskSubmission, WorkerManagerConfig,
    WorkerRegistration,
};
use uuid::Uuid;

/// Coordinator over a fresh in-memory store with default config.
pub async fn coordinator() -> Arc<Coordinator> {
    Coordinator::new(
        Store::open_in_memory().await.unwrap(),
        CoordinatorConfig::default(),
        WorkerManagerConfig::default(),
    )
}

/// Coordinator over an on-disk store (multi-connection pool), for tests
/// that interleave concurrent pollers.
pub async fn coordinator_on_disk(dir: &tempfile::TempDir) -> Arc<Coordinator> {
    Coordinator::new(
        Store::open(dir.path().join("foreman.db")).await.unwrap(),
        CoordinatorConfig::default(),
        WorkerManagerConfig::default(),
    )
}

/// Register a worker with the given capabilities and max load.
pub async fn register_worker(
    coordinator: &Coordinator,
    name: &str,
    capabilities: &[&str],
    max_load: i64,
) -> Uuid {
    coordinator
        .register_worker(
            WorkerRegistration::builder()
                .name(name)
                .capabilities(
                    capabilities
                        .iter()
                        .map(|c| c.to_string())
                        .collect::<Vec<_>>(),
                )
                .max_load(max_load)
                .build(),
        )
        .await
        .unwrap()
}

/// A retry policy with no backoff delay, so retried tasks are immediately
/// dispatchable in tests.
pub fn immediate_retry(max_retries: i64) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay_ms: 0,
        max_delay_ms: 0,
        backoff_factor: 1.0,
        retryable_errors: None,
    }
}

/// A submission with required capabilities and an immediate retry policy.
pub fn submission(task_type: &str, capabilities: &[&str], max_retries: i64) -> TaskSubmission {
    TaskSubmission::builder()
        .task_type(task_type)
        .payload(serde_json::json!({"work": task_type}))
        .required_capabilities(
            capabilities
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>(),
        )
        .retry_policy(immediate_retry(max_retries))
        .max_retries(max_retries)
        .build()
}
