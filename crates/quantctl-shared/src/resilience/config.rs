//! Configuration types for the resilience module, decoupled from how a
//! particular crate loads its TOML (see [`crate::config`]).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-breaker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (in `Closed`) before tripping to `Open`.
    pub failure_threshold: u32,
    /// How long the breaker stays `Open` before probing again (`HalfOpen`).
    pub timeout: Duration,
    /// Consecutive successes in `HalfOpen` before returning to `Closed`.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// Per-component threshold override, as loaded from TOML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct CircuitBreakerComponentConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
}

/// Fallback thresholds applied to any component without an explicit override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct CircuitBreakerDefaultConfig {
    pub failure_threshold: u32,
    pub timeout_seconds: u32,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerDefaultConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_seconds: 30,
            success_threshold: 2,
        }
    }
}

/// Named component overrides recognized by the workspace. New components can
/// be added here as they grow a circuit breaker of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ComponentCircuitBreakerConfigs {
    pub messaging: CircuitBreakerComponentConfig,
    pub exchange: CircuitBreakerComponentConfig,
    pub health_probe: CircuitBreakerComponentConfig,
}

impl Default for ComponentCircuitBreakerConfigs {
    fn default() -> Self {
        let default = CircuitBreakerComponentConfig {
            failure_threshold: 5,
            success_threshold: 2,
        };
        Self {
            messaging: default,
            exchange: default,
            health_probe: default,
        }
    }
}

/// Top-level `[resilience.circuit_breaker]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
pub struct TomlCircuitBreakerConfig {
    pub global_settings: GlobalCircuitBreakerSettings,
    pub default_config: CircuitBreakerDefaultConfig,
    pub component_configs: ComponentCircuitBreakerConfigs,
}

impl TomlCircuitBreakerConfig {
    /// Resolve the component configuration for `name`, falling back to
    /// `default_config` for anything unrecognized.
    pub fn config_for_component(&self, name: &str) -> CircuitBreakerComponentConfig {
        match name {
            "messaging" => self.component_configs.messaging,
            "exchange" => self.component_configs.exchange,
            "health_probe" => self.component_configs.health_probe,
            _ => CircuitBreakerComponentConfig {
                failure_threshold: self.default_config.failure_threshold,
                success_threshold: self.default_config.success_threshold,
            },
        }
    }
}

impl CircuitBreakerComponentConfig {
    /// Convert into a runtime [`CircuitBreakerConfig`], supplying the shared
    /// timeout since TOML only overrides thresholds per component.
    pub fn to_resilience_config_with_timeout(
        &self,
        default_timeout_seconds: u32,
    ) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            timeout: Duration::from_secs(default_timeout_seconds as u64),
            success_threshold: self.success_threshold,
        }
    }
}

/// Global knobs that apply across every circuit breaker instance.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct GlobalCircuitBreakerSettings {
    pub metrics_collection_interval_seconds: u32,
    pub min_state_transition_interval_seconds: f64,
}

impl Default for GlobalCircuitBreakerSettings {
    fn default() -> Self {
        Self {
            metrics_collection_interval_seconds: 15,
            min_state_transition_interval_seconds: 0.5,
        }
    }
}

impl GlobalCircuitBreakerSettings {
    pub fn metrics_collection_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_collection_interval_seconds as u64)
    }

    pub fn min_state_transition_interval(&self) -> Duration {
        Duration::from_secs_f64(self.min_state_transition_interval_seconds)
    }
}
