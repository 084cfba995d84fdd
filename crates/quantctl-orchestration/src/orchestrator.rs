//! Front-door Orchestrator: composes the Process Supervisor and Health
//! Prober behind the small surface a caller (CLI, REST layer, scheduler job)
//! actually needs, and owns the registry of configured services.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use quantctl_shared::config::ServiceConfig;
use quantctl_shared::error::ErrorKind;
use quantctl_shared::messaging::{topics, MessageBus};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::health::{HealthProber, HealthStatus};
use crate::optimization::OptimizationRequest;
use crate::process::{LaunchSpec, ProcessRecord, ProcessState, ProcessSupervisor, ProcessType, RestartPolicy};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown service '{0}'")]
    UnknownService(String),

    #[error("service '{0}' is already running")]
    AlreadyRunning(String),

    #[error(transparent)]
    Supervisor(#[from] crate::process::SupervisorError),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::UnknownService(_) => ErrorKind::InvalidState,
            OrchestratorError::AlreadyRunning(_) => ErrorKind::InvalidState,
            OrchestratorError::Supervisor(e) => e.kind(),
        }
    }
}

/// A point-in-time view over one configured service, joining its process
/// record with its health-prober verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub configured: bool,
    pub state: Option<ProcessState>,
    pub pid: Option<u32>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub health: Option<HealthStatus>,
}

fn process_type_for(service_type: &str) -> ProcessType {
    match service_type {
        "optimizer" => ProcessType::Optimizer,
        "market-ingestor" => ProcessType::MarketIngestor,
        "monitor" => ProcessType::Monitor,
        _ => ProcessType::Trader,
    }
}

/// Resolves an `{command, args, env, working_dir, auto_restart, max_retries,
/// backoff_base_secs}` entry into the lower-level spec/policy pair the
/// supervisor takes.
fn launch_spec_and_policy(cfg: &ServiceConfig) -> (LaunchSpec, RestartPolicy) {
    let spec = LaunchSpec {
        command: cfg.command.clone(),
        args: cfg.args.clone(),
        env: cfg.env.clone(),
        working_dir: cfg.working_dir.clone(),
    };
    let policy = RestartPolicy {
        auto_restart: cfg.auto_restart,
        max_attempts: cfg.max_retries,
        backoff_base: Duration::from_secs(cfg.backoff_base_secs),
    };
    (spec, policy)
}

/// The registry of configured services plus the two components every
/// service launch needs wired together: [`ProcessSupervisor`] for the
/// fork-exec lifecycle and [`HealthProber`] for liveness/endpoint checks.
#[derive(Debug)]
pub struct Orchestrator {
    services: HashMap<String, ServiceConfig>,
    supervisor: Arc<ProcessSupervisor>,
    prober: Arc<HealthProber>,
    bus: MessageBus,
}

impl Orchestrator {
    pub fn new(
        services: HashMap<String, ServiceConfig>,
        supervisor: Arc<ProcessSupervisor>,
        prober: Arc<HealthProber>,
        bus: MessageBus,
    ) -> Arc<Self> {
        Arc::new(Self { services, supervisor, prober, bus })
    }

    /// Launch every service marked `auto_start`. A single failure is logged
    /// and does not prevent the remaining services from starting.
    pub async fn auto_start(self: &Arc<Self>) {
        let names: Vec<String> = self
            .services
            .iter()
            .filter(|(_, cfg)| cfg.auto_start)
            .map(|(name, _)| name.clone())
            .collect();

        for name in names {
            if let Err(e) = self.start_service(&name).await {
                error!(service = %name, error = %e, "auto-start failed, continuing with remaining services");
            }
        }
    }

    pub async fn start_service(self: &Arc<Self>, name: &str) -> Result<ProcessRecord, OrchestratorError> {
        let cfg = self
            .services
            .get(name)
            .ok_or_else(|| OrchestratorError::UnknownService(name.to_string()))?;

        let (spec, policy) = launch_spec_and_policy(cfg);
        let process_type = process_type_for(&cfg.service_type);
        let record = self
            .supervisor
            .start_process(name, process_type, spec, policy)
            .await?;

        if cfg.health_check.enabled {
            self.prober.register(name, cfg.health_check.clone());
        }

        info!(service = name, pid = ?record.pid, "service started");
        Ok(record)
    }

    pub async fn stop_service(&self, name: &str) -> Result<(), OrchestratorError> {
        let cfg = self
            .services
            .get(name)
            .ok_or_else(|| OrchestratorError::UnknownService(name.to_string()))?;

        let grace = Duration::from_secs(cfg.stop_grace_secs);
        self.supervisor.stop_process(name, grace).await?;
        self.prober.unregister(name);
        info!(service = name, "service stopped");
        Ok(())
    }

    pub async fn restart_service(self: &Arc<Self>, name: &str) -> Result<ProcessRecord, OrchestratorError> {
        if self.services.get(name).is_none() {
            return Err(OrchestratorError::UnknownService(name.to_string()));
        }

        if self.stop_service(name).await.is_err() {
            warn!(service = name, "restart: stop failed or service was not running, starting anyway");
        }
        self.start_service(name).await
    }

    /// Snapshot every *configured* service, whether or not it currently has
    /// a process record.
    pub fn service_status(&self) -> Vec<ServiceStatus> {
        self.services
            .keys()
            .map(|name| {
                let record = self.supervisor.get_process(name);
                let health = self.prober.get_health(name).map(|h| h.last_status);
                ServiceStatus {
                    name: name.clone(),
                    configured: true,
                    state: record.as_ref().map(|r| r.state),
                    pid: record.as_ref().and_then(|r| r.pid),
                    started_at: record.as_ref().and_then(|r| r.started_at),
                    health,
                }
            })
            .collect()
    }

    /// Ensure the optimizer service is running, then publish the request on
    /// the bus and return immediately; the caller listens on
    /// `optimization.result` for the answer.
    pub async fn request_optimization(
        self: &Arc<Self>,
        request: OptimizationRequest,
    ) -> Result<(), OrchestratorError> {
        let optimizer_name = self
            .services
            .iter()
            .find(|(_, cfg)| cfg.service_type == "optimizer")
            .map(|(name, _)| name.clone());

        if let Some(name) = optimizer_name {
            if self
                .supervisor
                .get_process(&name)
                .map(|r| !r.state.is_terminal())
                != Some(true)
            {
                self.start_service(&name).await?;
            }
        }

        let payload = serde_json::to_value(&request).unwrap_or_default();
        if let Err(e) = self.bus.publish(topics::OPTIMIZATION_REQUEST, payload).await {
            warn!(error = %e, "failed to publish optimization request");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quantctl_shared::config::HealthCheckConfig;
    use tokio_util::sync::CancellationToken;

    fn echo_service() -> ServiceConfig {
        ServiceConfig {
            service_type: "trader".to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "sleep 5".to_string()],
            env: HashMap::new(),
            working_dir: None,
            auto_start: true,
            auto_restart: false,
            max_retries: 0,
            backoff_base_secs: 1,
            stop_grace_secs: 1,
            health_check: HealthCheckConfig::default(),
        }
    }

    fn test_orchestrator(services: HashMap<String, ServiceConfig>) -> Arc<Orchestrator> {
        let bus = MessageBus::in_memory(16);
        let supervisor = ProcessSupervisor::new(bus.clone(), CancellationToken::new());
        let prober = HealthProber::new(supervisor.clone(), CancellationToken::new());
        Orchestrator::new(services, supervisor, prober, bus)
    }

    #[tokio::test]
    async fn unknown_service_is_rejected() {
        let orch = test_orchestrator(HashMap::new());
        let err = orch.start_service("nope").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownService(_)));
    }

    #[tokio::test]
    async fn start_then_status_reports_running() {
        let mut services = HashMap::new();
        services.insert("trader-1".to_string(), echo_service());
        let orch = test_orchestrator(services);

        orch.start_service("trader-1").await.unwrap();
        let statuses = orch.service_status();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].state, Some(ProcessState::Running));

        orch.stop_service("trader-1").await.unwrap();
    }

    #[tokio::test]
    async fn auto_start_launches_only_marked_services() {
        let mut services = HashMap::new();
        services.insert("trader-1".to_string(), echo_service());
        let mut disabled = echo_service();
        disabled.auto_start = false;
        services.insert("trader-2".to_string(), disabled);

        let orch = test_orchestrator(services);
        orch.auto_start().await;

        let statuses: HashMap<_, _> = orch.service_status().into_iter().map(|s| (s.name.clone(), s)).collect();
        assert_eq!(statuses["trader-1"].state, Some(ProcessState::Running));
        assert_eq!(statuses["trader-2"].state, None);

        orch.stop_service("trader-1").await.unwrap();
    }

    #[tokio::test]
    async fn restart_tolerates_stop_of_not_running() {
        let mut services = HashMap::new();
        services.insert("trader-1".to_string(), echo_service());
        let orch = test_orchestrator(services);

        // Never started: stop_service will fail internally, restart should
        // still bring it up rather than propagating that failure.
        orch.restart_service("trader-1").await.unwrap();
        let statuses = orch.service_status();
        assert_eq!(statuses[0].state, Some(ProcessState::Running));

        orch.stop_service("trader-1").await.unwrap();
    }
}
