//! Coordinator lifecycle events.
//!
//! Events are facts about the task/worker/workflow lifecycle, not commands.
//! Two subscription surfaces exist:
//!
//! - a named-callback registry keyed by [`EventKind`]; callbacks run in the
//!   emitter's context and a failing callback never affects the others,
//! - a broadcast channel for async subscribers (at-most-once, in-memory,
//!   no replay; slow receivers may lag).

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default broadcast capacity before slow receivers start lagging.
const DEFAULT_CAPACITY: usize = 1024;

/// Event names, used as callback-registry keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    TaskEnqueued,
    TaskAssigned,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskTimeout,
    WorkerRegistered,
    WorkerOffline,
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::TaskEnqueued => "task:enqueued",
            EventKind::TaskAssigned => "task:assigned",
            EventKind::TaskStarted => "task:started",
            EventKind::TaskCompleted => "task:completed",
            EventKind::TaskFailed => "task:failed",
            EventKind::TaskTimeout => "task:timeout",
            EventKind::WorkerRegistered => "worker:registered",
            EventKind::WorkerOffline => "worker:offline",
            EventKind::WorkflowStarted => "workflow:started",
            EventKind::WorkflowCompleted => "workflow:completed",
            EventKind::WorkflowFailed => "workflow:failed",
        };
        write!(f, "{}", name)
    }
}

/// Typed event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoordinatorEvent {
    TaskEnqueued {
        task_id: Uuid,
        task_type: String,
    },
    TaskAssigned {
        task_id: Uuid,
        worker_id: Uuid,
    },
    TaskStarted {
        task_id: Uuid,
        worker_id: Uuid,
        attempt: i64,
    },
    TaskCompleted {
        task_id: Uuid,
        worker_id: Uuid,
        duration_ms: i64,
    },
    TaskFailed {
        task_id: Uuid,
        error: String,
        will_retry: bool,
    },
    TaskTimeout {
        task_id: Uuid,
        worker_id: Option<Uuid>,
    },
    WorkerRegistered {
        worker_id: Uuid,
        name: String,
    },
    WorkerOffline {
        worker_id: Uuid,
    },
    WorkflowStarted {
        execution_id: String,
    },
    WorkflowCompleted {
        execution_id: String,
    },
    WorkflowFailed {
        execution_id: String,
        error: String,
    },
}

impl CoordinatorEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CoordinatorEvent::TaskEnqueued { .. } => EventKind::TaskEnqueued,
            CoordinatorEvent::TaskAssigned { .. } => EventKind::TaskAssigned,
            CoordinatorEvent::TaskStarted { .. } => EventKind::TaskStarted,
            CoordinatorEvent::TaskCompleted { .. } => EventKind::TaskCompleted,
            CoordinatorEvent::TaskFailed { .. } => EventKind::TaskFailed,
            CoordinatorEvent::TaskTimeout { .. } => EventKind::TaskTimeout,
            CoordinatorEvent::WorkerRegistered { .. } => EventKind::WorkerRegistered,
            CoordinatorEvent::WorkerOffline { .. } => EventKind::WorkerOffline,
            CoordinatorEvent::WorkflowStarted { .. } => EventKind::WorkflowStarted,
            CoordinatorEvent::WorkflowCompleted { .. } => EventKind::WorkflowCompleted,
            CoordinatorEvent::WorkflowFailed { .. } => EventKind::WorkflowFailed,
        }
    }
}

type Callback = Box<dyn Fn(&CoordinatorEvent) -> anyhow::Result<()> + Send + Sync>;

/// In-process event bus.
pub struct EventBus {
    sender: broadcast::Sender<CoordinatorEvent>,
    callbacks: RwLock<HashMap<EventKind, Vec<Callback>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            callbacks: RwLock::new(HashMap::new()),
        }
    }

    /// Register a callback for one event kind. Multiple callbacks per kind
    /// are invoked in registration order.
    pub fn on<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&CoordinatorEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind)
            .or_default()
            .push(Box::new(callback));
    }

    /// Subscribe to the broadcast stream of all events.
    ///
    /// Only events emitted after subscription are received.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.sender.subscribe()
    }

    /// Emit an event: invoke registered callbacks for its kind, then fan out
    /// over the broadcast channel. A callback error is logged and does not
    /// affect the remaining callbacks or subscribers.
    ///
    /// Returns the number of broadcast receivers that saw the event.
    pub fn emit(&self, event: CoordinatorEvent) -> usize {
        let kind = event.kind();
        {
            let callbacks = self.callbacks.read().unwrap_or_else(|e| e.into_inner());
            if let Some(list) = callbacks.get(&kind) {
                for callback in list {
                    if let Err(e) = callback(&event) {
                        tracing::warn!(event = %kind, error = %e, "event callback failed");
                    }
                }
            }
        }
        self.sender.send(event).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
