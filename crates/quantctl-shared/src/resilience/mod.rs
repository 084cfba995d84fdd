//! # Resilience Primitives
//!
//! Circuit-breaker protection for external collaborators: the message bus's
//! broker-backed path, the exchange adapter, and the health prober's probe
//! path. Every breaker shares the same state machine
//! ([`CircuitBreaker`]/[`CircuitState`]) and the same narrow interface
//! ([`CircuitBreakerBehavior`]) so callers can reason about any of them
//! uniformly.

mod behavior;
mod circuit_breaker;
pub mod config;
mod metrics;

#[cfg(test)]
mod toml_config_test;

pub use behavior::CircuitBreakerBehavior;
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use config::CircuitBreakerConfig;
pub use metrics::{CircuitBreakerMetrics, MetricsCollector, PrometheusMetricsExporter};
