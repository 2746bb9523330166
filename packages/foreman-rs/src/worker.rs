//! Worker model: registered executor processes that heartbeat and report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Worker liveness / availability states.
///
/// Active means `idle` or `busy`. Workers enter `error` after three
/// consecutive failures and stay excluded from selection until a heartbeat
/// reports them healthy again. `offline` comes from unregistration or the
/// stale-heartbeat sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Idle,
    Busy,
    Offline,
    Error,
}

impl WorkerState {
    pub fn is_active(&self) -> bool {
        matches!(self, WorkerState::Idle | WorkerState::Busy)
    }
}

/// A registered executor process.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: Uuid,
    pub name: String,
    pub capabilities: Json<Vec<String>>,
    pub state: WorkerState,
    pub current_load: i64,
    pub max_load: i64,
    pub last_heartbeat: DateTime<Utc>,
    pub heartbeat_interval_ms: i64,
    pub consecutive_failures: i64,
    pub model_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl Worker {
    /// Current load over max load, clamped to [0, 1].
    pub fn load_factor(&self) -> f64 {
        if self.max_load <= 0 {
            return 1.0;
        }
        (self.current_load as f64 / self.max_load as f64).clamp(0.0, 1.0)
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn has_capacity(&self) -> bool {
        self.current_load < self.max_load
    }

    pub fn remaining_capacity(&self) -> i64 {
        (self.max_load - self.current_load).max(0)
    }

    /// Whether this worker's capability set is a superset of `required`.
    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.0.contains(c))
    }

    /// Stale iff the last heartbeat is older than the heartbeat interval
    /// times the given multiplier.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_multiplier: u32) -> bool {
        let budget_ms = self.heartbeat_interval_ms.saturating_mul(stale_multiplier as i64);
        (now - self.last_heartbeat).num_milliseconds() > budget_ms
    }
}

/// Inbound worker registration.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct WorkerRegistration {
    pub name: String,
    pub capabilities: Vec<String>,
    #[builder(default, setter(strip_option))]
    pub max_load: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub heartbeat_interval_ms: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub model_id: Option<String>,
    #[builder(default = serde_json::Value::Null)]
    pub metadata: serde_json::Value,
}

impl WorkerRegistration {
    pub fn new(name: impl Into<String>, capabilities: Vec<String>) -> Self {
        Self::builder().name(name).capabilities(capabilities).build()
    }
}

/// Heartbeat payload; every field except the id is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Heartbeat {
    pub status: Option<WorkerState>,
    pub current_load: Option<i64>,
    pub metadata: Option<serde_json::Value>,
}
