//! Worker registry: registration, heartbeat liveness, capability filtering,
//! load tracking, and selection under a load-balancing strategy.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::WorkerManagerConfig;
use crate::error::{ForemanError, Result};
use crate::store::Store;
use crate::worker::{Heartbeat, Worker, WorkerRegistration, WorkerState};

pub(crate) const WORKER_COLUMNS: &str = "id, name, capabilities, state, current_load, max_load, \
     last_heartbeat, heartbeat_interval_ms, consecutive_failures, model_id, created_at, metadata";

/// Consecutive failures that push a worker into the error state.
const ERROR_STATE_THRESHOLD: i64 = 3;

// ============================================================================
// Load-balancing strategies
// ============================================================================

/// Worker-selection policy, applied after capability and capacity filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingStrategy {
    /// Minimum load factor; ties broken by enumeration order.
    #[default]
    LeastLoaded,
    /// Rotating cursor over the candidate list.
    RoundRobin,
    /// Prefer an exact capability-set match, falling back to least-loaded.
    CapabilityMatch,
    /// Uniform random pick.
    Random,
    /// Random pick weighted by remaining capacity.
    Weighted,
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadBalancingStrategy::LeastLoaded => "least-loaded",
            LoadBalancingStrategy::RoundRobin => "round-robin",
            LoadBalancingStrategy::CapabilityMatch => "capability-match",
            LoadBalancingStrategy::Random => "random",
            LoadBalancingStrategy::Weighted => "weighted",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for LoadBalancingStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "least-loaded" => Ok(LoadBalancingStrategy::LeastLoaded),
            "round-robin" => Ok(LoadBalancingStrategy::RoundRobin),
            "capability-match" => Ok(LoadBalancingStrategy::CapabilityMatch),
            "random" => Ok(LoadBalancingStrategy::Random),
            "weighted" => Ok(LoadBalancingStrategy::Weighted),
            other => Err(format!("unknown load-balancing strategy '{}'", other)),
        }
    }
}

impl LoadBalancingStrategy {
    /// Pick one candidate. `cursor` feeds the round-robin rotation; the
    /// other strategies ignore it. Returns none on an empty candidate set.
    pub fn select<'a>(
        &self,
        candidates: &'a [Worker],
        required_capabilities: Option<&[String]>,
        cursor: usize,
    ) -> Option<&'a Worker> {
        if candidates.is_empty() {
            return None;
        }
        match self {
            LoadBalancingStrategy::LeastLoaded => least_loaded(candidates),
            LoadBalancingStrategy::RoundRobin => candidates.get(cursor % candidates.len()),
            LoadBalancingStrategy::CapabilityMatch => {
                if let Some(required) = required_capabilities.filter(|r| !r.is_empty()) {
                    if let Some(exact) = candidates.iter().find(|w| exact_match(w, required)) {
                        return Some(exact);
                    }
                }
                least_loaded(candidates)
            }
            LoadBalancingStrategy::Random => {
                let idx = rand::thread_rng().gen_range(0..candidates.len());
                candidates.get(idx)
            }
            LoadBalancingStrategy::Weighted => weighted_pick(candidates),
        }
    }
}

fn least_loaded(candidates: &[Worker]) -> Option<&Worker> {
    candidates.iter().fold(None, |best, worker| match best {
        None => Some(worker),
        Some(current)
            if worker
                .load_factor()
                .partial_cmp(&current.load_factor())
                .unwrap_or(Ordering::Equal)
                == Ordering::Less =>
        {
            Some(worker)
        }
        Some(current) => Some(current),
    })
}

fn exact_match(worker: &Worker, required: &[String]) -> bool {
    worker.capabilities.0.len() == required.len() && worker.has_capabilities(required)
}

/// Weight each candidate by remaining capacity and sample proportionally.
fn weighted_pick(candidates: &[Worker]) -> Option<&Worker> {
    let total: i64 = candidates.iter().map(Worker::remaining_capacity).sum();
    if total <= 0 {
        return candidates.first();
    }
    let mut roll = rand::thread_rng().gen_range(0..total);
    for worker in candidates {
        roll -= worker.remaining_capacity();
        if roll < 0 {
            return Some(worker);
        }
    }
    candidates.last()
}

// ============================================================================
// Worker manager
// ============================================================================

/// Aggregate registry statistics.
#[derive(FromRow, Debug, Clone, Default)]
pub struct WorkerStats {
    pub total: i64,
    pub idle: i64,
    pub busy: i64,
    pub offline: i64,
    pub error: i64,
    pub avg_load_factor: f64,
    /// Sum of max_load over active workers.
    pub total_capacity: i64,
    /// Sum of current_load over active workers.
    pub used_capacity: i64,
}

impl WorkerStats {
    pub fn available_capacity(&self) -> i64 {
        (self.total_capacity - self.used_capacity).max(0)
    }
}

/// The worker registry.
pub struct WorkerManager {
    store: Store,
    config: WorkerManagerConfig,
    round_robin_cursor: AtomicUsize,
}

impl WorkerManager {
    pub fn new(store: Store, config: WorkerManagerConfig) -> Self {
        Self {
            store,
            config,
            round_robin_cursor: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &WorkerManagerConfig {
        &self.config
    }

    /// Advance the shared round-robin cursor. Callers assembling their own
    /// candidate lists feed this into [`LoadBalancingStrategy::select`].
    pub fn next_cursor(&self) -> usize {
        self.round_robin_cursor.fetch_add(1, AtomicOrdering::Relaxed)
    }

    /// Register a new worker; returns its fresh id. Name and capability list
    /// must be non-empty.
    pub async fn register(&self, registration: WorkerRegistration) -> Result<Uuid> {
        if registration.name.is_empty() {
            return Err(ForemanError::InvalidSubmission("empty worker name".into()));
        }
        if registration.capabilities.is_empty() {
            return Err(ForemanError::InvalidSubmission(
                "worker must declare at least one capability".into(),
            ));
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let max_load = registration
            .max_load
            .unwrap_or(self.config.default_max_load);
        let heartbeat_interval_ms = registration
            .heartbeat_interval_ms
            .unwrap_or(self.config.default_heartbeat_interval_ms);

        self.store
            .with_tx(|tx| {
                let registration = registration.clone();
                Box::pin(async move {
                    sqlx::query(
                        "INSERT INTO workers (id, name, capabilities, state, current_load, \
                         max_load, last_heartbeat, heartbeat_interval_ms, consecutive_failures, \
                         model_id, created_at, metadata) \
                         VALUES (?, ?, ?, 'idle', 0, ?, ?, ?, 0, ?, ?, ?)",
                    )
                    .bind(id)
                    .bind(&registration.name)
                    .bind(sqlx::types::Json(&registration.capabilities))
                    .bind(max_load)
                    .bind(now)
                    .bind(heartbeat_interval_ms)
                    .bind(&registration.model_id)
                    .bind(now)
                    .bind(&registration.metadata)
                    .execute(&mut **tx)
                    .await?;

                    // seed the metrics row so performance views show zeros
                    sqlx::query(
                        "INSERT INTO worker_metrics (worker_id, updated_at) VALUES (?, ?)",
                    )
                    .bind(id)
                    .bind(now)
                    .execute(&mut **tx)
                    .await?;
                    Ok(())
                })
            })
            .await?;

        info!(worker_id = %id, name = %registration.name, "worker registered");
        Ok(id)
    }

    /// Transition the worker to offline. The row is kept; in-flight
    /// assignments stay bound until their tasks complete or are reassigned.
    pub async fn unregister(&self, id: Uuid) -> Result<()> {
        let updated = sqlx::query("UPDATE workers SET state = 'offline' WHERE id = ?")
            .bind(id)
            .execute(self.store.pool())
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(ForemanError::WorkerNotFound(id));
        }
        info!(worker_id = %id, "worker unregistered");
        Ok(())
    }

    /// Record a heartbeat: refresh the liveness instant, reset the
    /// consecutive-failure counter, and apply any reported status, load, or
    /// metadata. A heartbeat for an unknown id is ignored.
    pub async fn heartbeat(&self, id: Uuid, heartbeat: Heartbeat) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE workers SET last_heartbeat = ?, consecutive_failures = 0, \
             state = COALESCE(?, state), \
             current_load = MAX(MIN(COALESCE(?, current_load), max_load), 0), \
             metadata = COALESCE(?, metadata) \
             WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(heartbeat.status)
        .bind(heartbeat.current_load)
        .bind(heartbeat.metadata)
        .bind(id)
        .execute(self.store.pool())
        .await?
        .rows_affected();

        if updated == 0 {
            warn!(worker_id = %id, "heartbeat from unknown worker ignored");
        }
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Worker> {
        self.try_get(id).await?.ok_or(ForemanError::WorkerNotFound(id))
    }

    pub async fn try_get(&self, id: Uuid) -> Result<Option<Worker>> {
        let sql = format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?");
        Ok(sqlx::query_as::<_, Worker>(&sql)
            .bind(id)
            .fetch_optional(self.store.pool())
            .await?)
    }

    pub async fn get_all(&self, include_offline: bool) -> Result<Vec<Worker>> {
        let sql = if include_offline {
            format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY created_at ASC")
        } else {
            format!(
                "SELECT {WORKER_COLUMNS} FROM workers WHERE state != 'offline' \
                 ORDER BY created_at ASC"
            )
        };
        Ok(sqlx::query_as::<_, Worker>(&sql)
            .fetch_all(self.store.pool())
            .await?)
    }

    /// Active = idle or busy; error and offline workers are excluded.
    pub async fn get_active(&self) -> Result<Vec<Worker>> {
        let sql = format!(
            "SELECT {WORKER_COLUMNS} FROM workers WHERE state IN ('idle', 'busy') \
             ORDER BY created_at ASC"
        );
        Ok(sqlx::query_as::<_, Worker>(&sql)
            .fetch_all(self.store.pool())
            .await?)
    }

    pub async fn get_idle(&self) -> Result<Vec<Worker>> {
        let sql = format!(
            "SELECT {WORKER_COLUMNS} FROM workers WHERE state = 'idle' \
             ORDER BY created_at ASC"
        );
        Ok(sqlx::query_as::<_, Worker>(&sql)
            .fetch_all(self.store.pool())
            .await?)
    }

    /// Active workers whose capability set is a superset of `required`.
    pub async fn get_with_capabilities(&self, required: &[String]) -> Result<Vec<Worker>> {
        let workers = self.get_active().await?;
        Ok(workers
            .into_iter()
            .filter(|w| w.has_capabilities(required))
            .collect())
    }

    /// Apply the strategy over active workers with spare capacity,
    /// optionally restricted to those carrying the required capabilities.
    pub async fn select_worker(
        &self,
        strategy: LoadBalancingStrategy,
        required_capabilities: Option<&[String]>,
    ) -> Result<Option<Worker>> {
        let candidates: Vec<Worker> = self
            .get_active()
            .await?
            .into_iter()
            .filter(Worker::has_capacity)
            .filter(|w| match required_capabilities {
                Some(required) => w.has_capabilities(required),
                None => true,
            })
            .collect();

        let cursor = self.round_robin_cursor.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(strategy
            .select(&candidates, required_capabilities, cursor)
            .cloned())
    }

    /// Add one unit of load; fails with an optimistic-lock error when the
    /// worker is already at capacity.
    pub async fn increment_load(&self, id: Uuid) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE workers SET current_load = current_load + 1, \
             state = CASE WHEN state = 'idle' THEN 'busy' ELSE state END \
             WHERE id = ? AND current_load < max_load",
        )
        .bind(id)
        .execute(self.store.pool())
        .await?
        .rows_affected();

        if updated == 0 {
            self.get(id).await?;
            return Err(ForemanError::OptimisticLock {
                entity: "worker",
                id,
            });
        }
        Ok(())
    }

    /// Remove one unit of load, clamped at zero. Busy workers drop back to
    /// idle when their load empties.
    pub async fn decrement_load(&self, id: Uuid) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE workers SET current_load = MAX(current_load - 1, 0), \
             state = CASE WHEN current_load <= 1 AND state = 'busy' THEN 'idle' ELSE state END \
             WHERE id = ?",
        )
        .bind(id)
        .execute(self.store.pool())
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(ForemanError::WorkerNotFound(id));
        }
        Ok(())
    }

    pub async fn update_status(&self, id: Uuid, state: WorkerState) -> Result<()> {
        let updated = sqlx::query("UPDATE workers SET state = ? WHERE id = ?")
            .bind(state)
            .bind(id)
            .execute(self.store.pool())
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(ForemanError::WorkerNotFound(id));
        }
        Ok(())
    }

    /// Bump the consecutive-failure counter; crossing the threshold moves
    /// the worker to the error state until a heartbeat reports it healthy.
    pub async fn record_failure(&self, id: Uuid) -> Result<i64> {
        let count: Option<i64> = sqlx::query_scalar(
            "UPDATE workers SET consecutive_failures = consecutive_failures + 1, \
             state = CASE WHEN consecutive_failures + 1 >= ? AND state != 'offline' \
                          THEN 'error' ELSE state END \
             WHERE id = ? RETURNING consecutive_failures",
        )
        .bind(ERROR_STATE_THRESHOLD)
        .bind(id)
        .fetch_optional(self.store.pool())
        .await?;

        let count = count.ok_or(ForemanError::WorkerNotFound(id))?;
        if count >= ERROR_STATE_THRESHOLD {
            warn!(worker_id = %id, failures = count, "worker moved to error state");
        }
        Ok(count)
    }

    /// Workers overdue for a heartbeat and not already offline.
    pub async fn get_stale(&self) -> Result<Vec<Worker>> {
        let sql = format!(
            "SELECT {WORKER_COLUMNS} FROM workers WHERE state != 'offline' \
             AND (julianday('now') - julianday(last_heartbeat)) * 86400000 \
                 > heartbeat_interval_ms * ?"
        );
        Ok(sqlx::query_as::<_, Worker>(&sql)
            .bind(self.config.stale_multiplier as i64)
            .fetch_all(self.store.pool())
            .await?)
    }

    /// Offline every stale worker; returns the workers that transitioned.
    pub async fn mark_stale_as_offline(&self) -> Result<Vec<Worker>> {
        let stale = self.get_stale().await?;
        for worker in &stale {
            sqlx::query("UPDATE workers SET state = 'offline' WHERE id = ?")
                .bind(worker.id)
                .execute(self.store.pool())
                .await?;
            warn!(worker_id = %worker.id, name = %worker.name, "stale worker marked offline");
        }
        Ok(stale)
    }

    /// Periodic maintenance entry point; a no-op when auto-cleanup is off.
    pub async fn auto_cleanup(&self) -> Result<Vec<Worker>> {
        if !self.config.auto_cleanup {
            return Ok(Vec::new());
        }
        self.mark_stale_as_offline().await
    }

    pub async fn stats(&self) -> Result<WorkerStats> {
        Ok(sqlx::query_as::<_, WorkerStats>(
            "SELECT COUNT(*) AS total, \
             COALESCE(SUM(state = 'idle'), 0) AS idle, \
             COALESCE(SUM(state = 'busy'), 0) AS busy, \
             COALESCE(SUM(state = 'offline'), 0) AS offline, \
             COALESCE(SUM(state = 'error'), 0) AS error, \
             COALESCE(AVG(CASE WHEN state IN ('idle', 'busy') \
                              THEN CAST(current_load AS REAL) / max_load END), 0.0) \
                 AS avg_load_factor, \
             COALESCE(SUM(CASE WHEN state IN ('idle', 'busy') THEN max_load END), 0) \
                 AS total_capacity, \
             COALESCE(SUM(CASE WHEN state IN ('idle', 'busy') THEN current_load END), 0) \
                 AS used_capacity \
             FROM workers",
        )
        .fetch_one(self.store.pool())
        .await?)
    }
}
