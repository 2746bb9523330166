//! Durable task coordination core.
//!
//! A single long-running coordinator accepts heterogeneous tasks, dispatches
//! them to registered workers under load-balancing and affinity policy,
//! tracks their lifecycle through a priority-ordered durable queue, enforces
//! timeouts and retries with exponential backoff, shepherds exhausted work
//! into a dead-letter sink, and runs DAG-structured workflows on top.
//!
//! # Architecture
//!
//! ```text
//! Coordinator
//!     │
//!     ├─► TaskQueue ───────► SQLite store (WAL)
//!     ├─► WorkerManager ───► heartbeats, liveness, selection
//!     ├─► TaskDistributor ─► atomic task↔worker binding, timeouts, retries
//!     └─► EventBus ────────► task:* / worker:* / workflow:* events
//! ```
//!
//! Workers are external processes: they register, heartbeat, poll for
//! assignments, and report start/completion back through the coordinator.
//! The core never interprets task payloads.

pub mod config;
pub mod coordinator;
pub mod distributor;
pub mod error;
pub mod events;
pub mod manager;
pub mod queue;
pub mod schema;
pub mod store;
pub mod task;
pub mod views;
pub mod worker;
pub mod workflow;

pub use config::{Config, CoordinatorConfig, DistributorConfig, LoadBalancerConfig, WorkerManagerConfig};
pub use coordinator::{Coordinator, ProgressReport};
pub use distributor::TaskDistributor;
pub use error::{ForemanError, Result};
pub use events::{CoordinatorEvent, EventBus, EventKind};
pub use manager::{LoadBalancingStrategy, WorkerManager, WorkerStats};
pub use queue::{QueueStats, TaskQueue};
pub use store::Store;
pub use task::{
    AffinityRules, Assignment, AssignmentReason, DeadLetterEntry, DependencyKind, RetryPolicy,
    Task, TaskDependency, TaskOutcome, TaskPriority, TaskResult, TaskStatus, TaskSubmission,
};
pub use views::SystemHealth;
pub use worker::{Heartbeat, Worker, WorkerRegistration, WorkerState};
pub use workflow::{WorkflowDefinition, WorkflowExecution, WorkflowStatus, WorkflowTask};
