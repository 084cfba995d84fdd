//! # Logging & Observability
//!
//! Every component logs via `tracing` with structured fields — never
//! `println!`. `init_tracing` installs an `EnvFilter` plus a `fmt` subscriber
//! once per process: JSON output when stdout is not a TTY (container,
//! supervised process), compact output in an interactive terminal.

use std::sync::Once;

use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Install the global tracing subscriber. Safe to call more than once; only
/// the first call takes effect.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let is_tty = std::io::IsTerminal::is_terminal(&std::io::stdout());

        if is_tty {
            fmt()
                .with_env_filter(filter)
                .with_target(true)
                .compact()
                .init();
        } else {
            fmt()
                .with_env_filter(filter)
                .with_target(true)
                .json()
                .init();
        }
    });
}

/// Write-only structured metrics emitter. The default implementation logs
/// through `tracing`; a real exporter (Prometheus, statsd, ...) can implement
/// the same trait without touching call sites.
pub trait MetricsSink: Send + Sync + std::fmt::Debug {
    fn record_counter(&self, name: &str, value: u64, labels: &[(&str, &str)]);
    fn record_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]);
    fn record_duration(&self, name: &str, duration_ms: f64, labels: &[(&str, &str)]);
}

/// "Log now, export later" default.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record_counter(&self, name: &str, value: u64, labels: &[(&str, &str)]) {
        tracing::info!(metric = name, value, ?labels, kind = "counter", "metric");
    }

    fn record_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        tracing::info!(metric = name, value, ?labels, kind = "gauge", "metric");
    }

    fn record_duration(&self, name: &str, duration_ms: f64, labels: &[(&str, &str)]) {
        tracing::info!(
            metric = name,
            duration_ms,
            ?labels,
            kind = "duration",
            "metric"
        );
    }
}
