//! Configuration for the coordinator and its components.
//!
//! Everything has a default; `Config::from_env` overrides from `FOREMAN_*`
//! environment variables (a `.env` file is honored in development).

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::manager::LoadBalancingStrategy;
use crate::task::RetryPolicy;

/// Worker-selection policy knobs.
#[derive(Debug, Clone)]
pub struct LoadBalancerConfig {
    pub strategy: LoadBalancingStrategy,
    /// Restrict selection to workers carrying the task's required capabilities.
    pub consider_capabilities: bool,
    /// Honor per-task affinity rules.
    pub respect_affinity: bool,
    /// Skip workers whose load factor is at or above this threshold.
    pub max_load_threshold: f64,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::LeastLoaded,
            consider_capabilities: true,
            respect_affinity: true,
            max_load_threshold: 0.9,
        }
    }
}

/// Top-level coordinator settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How often the stale-heartbeat sweep runs.
    pub heartbeat_check_interval: Duration,
    /// How often the timeout sweep runs.
    pub timeout_check_interval: Duration,
    pub max_concurrent_tasks: i64,
    pub default_timeout_ms: i64,
    pub default_retry_policy: RetryPolicy,
    pub load_balancer: LoadBalancerConfig,
    /// Bound on the drain phase of shutdown.
    pub shutdown_timeout: Duration,
    /// Polling cadence for workflow sub-task completion.
    pub workflow_poll_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_check_interval: Duration::from_secs(30),
            timeout_check_interval: Duration::from_secs(10),
            max_concurrent_tasks: 50,
            default_timeout_ms: 300_000,
            default_retry_policy: RetryPolicy::default(),
            load_balancer: LoadBalancerConfig::default(),
            shutdown_timeout: Duration::from_secs(60),
            workflow_poll_interval: Duration::from_millis(100),
        }
    }
}

/// Worker-registry settings.
///
/// The stale multiplier is the single source of truth for worker death:
/// a worker is stale once `now − last_heartbeat` exceeds its own heartbeat
/// interval times this multiplier.
#[derive(Debug, Clone)]
pub struct WorkerManagerConfig {
    pub default_max_load: i64,
    pub default_heartbeat_interval_ms: i64,
    pub stale_multiplier: u32,
    /// Whether the periodic sweep offlines stale workers automatically.
    pub auto_cleanup: bool,
}

impl Default for WorkerManagerConfig {
    fn default() -> Self {
        Self {
            default_max_load: 5,
            default_heartbeat_interval_ms: 30_000,
            stale_multiplier: 2,
            auto_cleanup: true,
        }
    }
}

/// Distributor settings, derived from the coordinator's load-balancer config
/// at composition time.
#[derive(Debug, Clone)]
pub struct DistributorConfig {
    pub strategy: LoadBalancingStrategy,
    /// Cap on per-task reassignments before the distributor gives up and
    /// requeues instead.
    pub max_assignment_attempts: i64,
    pub enable_affinity: bool,
    pub enable_timeouts: bool,
    pub timeout_check_interval: Duration,
    pub consider_capabilities: bool,
    pub max_load_threshold: f64,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self::from_coordinator(&CoordinatorConfig::default())
    }
}

impl DistributorConfig {
    pub fn from_coordinator(config: &CoordinatorConfig) -> Self {
        Self {
            strategy: config.load_balancer.strategy,
            max_assignment_attempts: 5,
            enable_affinity: config.load_balancer.respect_affinity,
            enable_timeouts: true,
            timeout_check_interval: config.timeout_check_interval,
            consider_capabilities: config.load_balancer.consider_capabilities,
            max_load_threshold: config.load_balancer.max_load_threshold,
        }
    }
}

/// Full application configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub database_path: String,
    pub coordinator: CoordinatorConfig,
    pub worker_manager: WorkerManagerConfig,
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        // Load .env if present (development)
        let _ = dotenv();

        let mut coordinator = CoordinatorConfig {
            heartbeat_check_interval: Duration::from_secs(env_parse(
                "FOREMAN_HEARTBEAT_CHECK_SECS",
                30u64,
            )?),
            timeout_check_interval: Duration::from_secs(env_parse(
                "FOREMAN_TIMEOUT_CHECK_SECS",
                10u64,
            )?),
            max_concurrent_tasks: env_parse("FOREMAN_MAX_CONCURRENT_TASKS", 50i64)?,
            default_timeout_ms: env_parse("FOREMAN_DEFAULT_TIMEOUT_MS", 300_000i64)?,
            ..CoordinatorConfig::default()
        };
        coordinator.load_balancer.strategy =
            env_parse("FOREMAN_STRATEGY", LoadBalancingStrategy::LeastLoaded)?;

        let worker_manager = WorkerManagerConfig {
            default_max_load: env_parse("FOREMAN_DEFAULT_MAX_LOAD", 5i64)?,
            default_heartbeat_interval_ms: env_parse(
                "FOREMAN_DEFAULT_HEARTBEAT_INTERVAL_MS",
                30_000i64,
            )?,
            stale_multiplier: env_parse("FOREMAN_STALE_MULTIPLIER", 2u32)?,
            auto_cleanup: env_parse("FOREMAN_AUTO_CLEANUP", true)?,
        };

        Ok(Self {
            database_path: env::var("FOREMAN_DB_PATH").unwrap_or_else(|_| "foreman.db".into()),
            coordinator,
            worker_manager,
        })
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("{} has an invalid value", key)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.heartbeat_check_interval, Duration::from_secs(30));
        assert_eq!(config.timeout_check_interval, Duration::from_secs(10));
        assert_eq!(config.max_concurrent_tasks, 50);
        assert_eq!(config.default_timeout_ms, 300_000);
        assert_eq!(config.default_retry_policy.max_retries, 3);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(60));
    }

    #[test]
    fn worker_manager_defaults() {
        let config = WorkerManagerConfig::default();
        assert_eq!(config.default_max_load, 5);
        assert_eq!(config.stale_multiplier, 2);
        assert!(config.auto_cleanup);
    }

    #[test]
    fn distributor_inherits_load_balancer_settings() {
        let mut coordinator = CoordinatorConfig::default();
        coordinator.load_balancer.respect_affinity = false;
        coordinator.load_balancer.strategy = LoadBalancingStrategy::Weighted;

        let distributor = DistributorConfig::from_coordinator(&coordinator);
        assert!(!distributor.enable_affinity);
        assert_eq!(distributor.strategy, LoadBalancingStrategy::Weighted);
        assert_eq!(distributor.max_assignment_attempts, 5);
    }
}
