//! # Quantctl Orchestration Server
//!
//! Production deployment target for the supervisory control plane: wires the
//! configured service registry, process supervisor, health prober, task
//! scheduler, optimization orchestrator, and graceful shutdown coordinator
//! together and runs until a shutdown signal arrives.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin quantctl-server
//! QUANTCTL_ENV=production cargo run --bin quantctl-server
//! ```

use std::collections::HashMap;
use std::time::Duration;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use quantctl_orchestration::health::HealthProber;
use quantctl_orchestration::optimization::{Objective, OptimizationOrchestrator, OptimizationRequest};
use quantctl_orchestration::orchestrator::Orchestrator;
use quantctl_orchestration::process::ProcessSupervisor;
use quantctl_orchestration::scheduler::TaskScheduler;
use quantctl_orchestration::shutdown::{handler_fn, ShutdownCoordinator};
use quantctl_shared::config::{AppConfig, BusBackend};
use quantctl_shared::logging;
use quantctl_shared::messaging::{topics, MessageBus};

/// Sharpe-ratio-like stand-in objective. A real deployment supplies its own
/// [`Objective`] wired to the backtest engine; this one keeps the server
/// runnable standalone, with no exchange or backtest dependency configured.
struct PlaceholderObjective;

impl Objective for PlaceholderObjective {
    fn evaluate(&mut self, params: &HashMap<String, f64>) -> f64 {
        params.values().sum::<f64>() / params.len().max(1) as f64
    }
}

const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_tracing();

    let environment = std::env::var("QUANTCTL_ENV").unwrap_or_else(|_| "development".to_string());
    info!(
        environment = %environment,
        version = env!("CARGO_PKG_VERSION"),
        "starting quantctl orchestration server"
    );

    let config = AppConfig::load(&environment)?;
    let cancellation = CancellationToken::new();

    let bus = match config.bus.message_queue {
        BusBackend::Memory => MessageBus::in_memory(config.bus.queue_bound),
        BusBackend::Remote => {
            return Err(
                "remote bus backend requires a pgmq-backed RemoteBus, which this binary does not \
                 construct on its own; wire one up via quantctl_shared::messaging::RemoteBus before \
                 selecting message_queue = \"remote\""
                    .into(),
            );
        }
    };
    bus.verify_queues(topics::ALL).await?;

    let supervisor = ProcessSupervisor::new(bus.clone(), cancellation.clone());
    let prober = HealthProber::new(supervisor.clone(), cancellation.clone());
    let scheduler = TaskScheduler::new(cancellation.clone());
    let shutdown = ShutdownCoordinator::new(
        config.shutdown.order.clone(),
        config.shutdown.force_after(),
    );

    let optimizer = OptimizationOrchestrator::new(
        bus.clone(),
        config.optimization.result_sharing_enabled,
        || PlaceholderObjective,
    );
    bus.subscribe(
        topics::OPTIMIZATION_REQUEST,
        handler_fn(move |message| {
            let optimizer = optimizer.clone();
            async move {
                let request: OptimizationRequest = serde_json::from_value(message.payload)
                    .map_err(|e| quantctl_shared::messaging::MessagingError::Transient(e.to_string()))?;
                if let Err(e) = optimizer.run(request).await {
                    warn!(error = %e, "optimization request failed");
                }
                Ok(())
            }
        }),
    )
    .await?;

    let orchestrator = Orchestrator::new(
        config.services.clone(),
        supervisor.clone(),
        prober.clone(),
        bus.clone(),
    );
    orchestrator.auto_start().await;

    prober.start(HEALTH_PROBE_INTERVAL);
    scheduler.start();

    {
        let orchestrator = orchestrator.clone();
        shutdown
            .register(
                "services",
                10,
                Duration::from_secs(30),
                handler_fn(move || {
                    let orchestrator = orchestrator.clone();
                    async move {
                        for status in orchestrator.service_status() {
                            if status.state.is_some() {
                                orchestrator
                                    .stop_service(&status.name)
                                    .await
                                    .map_err(|e| e.to_string())?;
                            }
                        }
                        Ok(())
                    }
                }),
            )
            .await;
    }
    {
        let bus = bus.clone();
        shutdown
            .register(
                "bus",
                0,
                Duration::from_secs(5),
                handler_fn(move || {
                    let bus = bus.clone();
                    async move { bus.close(Duration::from_secs(2)).await.map_err(|e| e.to_string()) }
                }),
            )
            .await;
    }

    info!("quantctl orchestration server started, press Ctrl+C to shut down");
    shutdown_signal().await;
    info!("shutdown signal received, initiating graceful shutdown");
    cancellation.cancel();

    match shutdown.shutdown().await {
        Ok(outcomes) => {
            for outcome in outcomes {
                if !outcome.succeeded {
                    error!(step = %outcome.name, error = ?outcome.error, "shutdown step did not complete cleanly");
                }
            }
        }
        Err(e) => error!(error = %e, "shutdown rejected"),
    }

    info!("quantctl orchestration server shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
