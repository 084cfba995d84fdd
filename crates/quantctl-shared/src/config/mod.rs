//! # Configuration
//!
//! Typed configuration assembled the way the rest of this lineage loads it:
//! a base TOML file, an environment-specific overlay, and environment
//! variable overrides, layered through [`config::Config`]'s builder.
//!
//! `AppConfig::load` is the single entry point. It is infallible to *call*
//! (it never panics) but returns a `Result` — a malformed file or an
//! out-of-range value is a reported [`QuantctlError::Config`], not a crash.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::QuantctlError;
use crate::resilience::config::TomlCircuitBreakerConfig;

/// `[bus]` — message bus backend selection.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BusBackend {
    Memory,
    Remote,
}

impl Default for BusBackend {
    fn default() -> Self {
        BusBackend::Memory
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    pub message_queue: BusBackend,
    /// Bound on the in-memory backend's per-instance dispatch queue.
    pub queue_bound: usize,
    /// Postgres connection string for the remote (pgmq-backed) backend.
    pub broker_url: Option<String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            message_queue: BusBackend::Memory,
            queue_bound: 1024,
            broker_url: None,
        }
    }
}

/// `[health_check]` nested under a service entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub failure_threshold: u32,
    pub endpoint: Option<String>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 10,
            timeout_secs: 5,
            failure_threshold: 3,
            endpoint: None,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// `[services.<name>]` — one supervised service's launch spec + policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub service_type: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<String>,
    pub auto_start: bool,
    pub auto_restart: bool,
    pub max_retries: u32,
    pub backoff_base_secs: u64,
    pub stop_grace_secs: u64,
    pub health_check: HealthCheckConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_type: "trader".to_string(),
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            auto_start: false,
            auto_restart: true,
            max_retries: 3,
            backoff_base_secs: 1,
            stop_grace_secs: 10,
            health_check: HealthCheckConfig::default(),
        }
    }
}

/// `[shutdown]` — step ordering and the global force-kill deadline.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub order: Vec<String>,
    pub force_after_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            force_after_secs: 30,
        }
    }
}

impl ShutdownConfig {
    pub fn force_after(&self) -> Duration {
        Duration::from_secs(self.force_after_secs)
    }
}

/// `[gatekeeper]` — mandatory-backtest and promotion thresholds.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct GatekeeperConfig {
    pub min_backtest_days: u32,
    pub min_sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub min_win_rate: f64,
    pub min_total_return: f64,
    pub max_trades_per_day: f64,
    pub revalidation_days: i64,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            min_backtest_days: 365,
            min_sharpe_ratio: 0.5,
            max_drawdown: 0.20,
            min_win_rate: 0.40,
            min_total_return: 0.05,
            max_trades_per_day: 10.0,
            revalidation_days: 30,
        }
    }
}

/// `[optimization]` — search defaults and result-sharing policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OptimizationConfig {
    pub method: String,
    pub grid_size: usize,
    pub max_iterations: usize,
    pub result_sharing_enabled: bool,
    pub result_sharing_mode: String,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            method: "grid".to_string(),
            grid_size: 5,
            max_iterations: 100,
            result_sharing_enabled: true,
            result_sharing_mode: "global-best".to_string(),
        }
    }
}

/// Root configuration object, assembled by [`AppConfig::load`].
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub environment: String,
    pub bus: BusConfig,
    pub services: HashMap<String, ServiceConfig>,
    pub shutdown: ShutdownConfig,
    pub gatekeeper: GatekeeperConfig,
    pub optimization: OptimizationConfig,
    pub resilience: TomlCircuitBreakerConfig,
}

impl AppConfig {
    /// Load configuration for `environment`.
    ///
    /// Layering, lowest to highest precedence:
    /// 1. `config/base.toml`
    /// 2. `config/{environment}.toml`
    /// 3. Environment variables prefixed `QUANTCTL__`, `__`-separated for
    ///    nested keys (e.g. `QUANTCTL__BUS__QUEUE_BOUND=4096`).
    ///
    /// Missing files are not an error — a fresh checkout with no config
    /// directory still boots on defaults; only a malformed file or an
    /// env var that fails to deserialize into the target type is reported.
    pub fn load(environment: &str) -> Result<Self, QuantctlError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/base").required(false))
            .add_source(
                config::File::with_name(&format!("config/{environment}")).required(false),
            )
            .add_source(
                config::Environment::with_prefix("QUANTCTL")
                    .separator("__")
                    .try_parsing(true),
            );

        let raw = builder
            .build()
            .map_err(|e| QuantctlError::Config(e.to_string()))?;

        let mut parsed: AppConfig = raw
            .try_deserialize()
            .map_err(|e| QuantctlError::Config(e.to_string()))?;
        parsed.environment = environment.to_string();
        Ok(parsed)
    }
}
