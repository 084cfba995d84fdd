//! Workspace-level end-to-end tests: exercise the process supervisor, the
//! message bus, the lifecycle gatekeeper, and the optimization orchestrator
//! wired together the way `quantctl-server` wires them, rather than each in
//! isolation inside its own crate.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use quantctl_orchestration::gatekeeper::{
    assess_risk, build_validation_record, BacktestResult, LifecycleGatekeeper, RiskInputs,
    StrategyVersion, Transition, VersionState,
};
use quantctl_orchestration::health::HealthProber;
use quantctl_orchestration::optimization::{
    Objective, OptimizationOrchestrator, OptimizationRequest, ParameterRange, SearchMethod,
};
use quantctl_orchestration::orchestrator::Orchestrator;
use quantctl_orchestration::process::ProcessSupervisor;
use quantctl_shared::config::{GatekeeperConfig, ServiceConfig};
use quantctl_shared::messaging::{topics, Message, MessageBus};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct SumObjective;

impl Objective for SumObjective {
    fn evaluate(&mut self, params: &HashMap<String, f64>) -> f64 {
        params.values().sum()
    }
}

fn sleeper_service(auto_start: bool) -> ServiceConfig {
    ServiceConfig {
        service_type: "monitor".to_string(),
        command: "sh".to_string(),
        args: vec!["-c".to_string(), "sleep 5".to_string()],
        env: HashMap::new(),
        working_dir: None,
        auto_start,
        auto_restart: false,
        max_retries: 0,
        backoff_base_secs: 1,
        stop_grace_secs: 2,
        health_check: Default::default(),
    }
}

#[tokio::test]
async fn orchestrator_auto_starts_configured_services_and_reports_status() {
    let bus = MessageBus::in_memory(64);
    let cancellation = CancellationToken::new();
    let supervisor = ProcessSupervisor::new(bus.clone(), cancellation.clone());
    let prober = HealthProber::new(supervisor.clone(), cancellation.clone());

    let mut services = HashMap::new();
    services.insert("watchdog".to_string(), sleeper_service(true));
    services.insert("idle".to_string(), sleeper_service(false));

    let orchestrator = Orchestrator::new(services, supervisor.clone(), prober, bus);
    orchestrator.auto_start().await;

    let statuses: HashMap<_, _> = orchestrator
        .service_status()
        .into_iter()
        .map(|s| (s.name.clone(), s))
        .collect();

    assert!(statuses["watchdog"].pid.is_some());
    assert!(statuses["idle"].pid.is_none());

    orchestrator.stop_service("watchdog").await.unwrap();
}

#[tokio::test]
async fn optimization_request_published_on_bus_is_picked_up_and_answered() {
    let bus = MessageBus::in_memory(64);
    let optimizer = OptimizationOrchestrator::new(bus.clone(), true, || SumObjective);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
    bus.subscribe(
        topics::OPTIMIZATION_RESULT,
        quantctl_shared::messaging::handler_fn(move |message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message);
                Ok(())
            }
        }),
    )
    .await
    .unwrap();

    let mut parameter_space = HashMap::new();
    parameter_space.insert("x".to_string(), ParameterRange { lo: 0.0, hi: 1.0 });

    let request = OptimizationRequest {
        request_id: "req-1".to_string(),
        strategy_id: "strat-1".to_string(),
        parameter_space,
        method: SearchMethod::Grid,
        grid_size: 3,
        max_iterations: 10,
    };

    bus.publish(topics::OPTIMIZATION_REQUEST, serde_json::to_value(&request).unwrap())
        .await
        .unwrap();

    let result = optimizer.run(request).await.unwrap();
    assert_eq!(result.iterations, 3);

    let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("optimization.result should be published")
        .expect("channel must not close");
    assert_eq!(received.topic, topics::OPTIMIZATION_RESULT);
}

#[tokio::test]
async fn strategy_version_promotes_end_to_end_through_the_gatekeeper() {
    let bus = MessageBus::in_memory(16);
    let config = GatekeeperConfig::default();
    let gatekeeper = LifecycleGatekeeper::new(config, bus);

    let version_id = Uuid::now_v7();
    gatekeeper
        .register_version(StrategyVersion {
            version_id,
            strategy_id: "strat-e2e".to_string(),
            version_label: "v1".to_string(),
            config_blob: serde_json::json!({}),
            state: VersionState::Draft,
            performance_snapshot: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await;

    let backtest = BacktestResult {
        window_days: 400,
        sharpe_ratio: 1.1,
        max_drawdown: 0.1,
        win_rate: 0.6,
        total_return: 0.2,
        trades_per_day: 4.0,
    };
    let risk = assess_risk(RiskInputs {
        drawdown_score: 90.0,
        volatility_score: 85.0,
        leverage_score: 90.0,
        concentration_score: 80.0,
        liquidity_score: 95.0,
    });
    let record = build_validation_record("strat-e2e", backtest, risk, &GatekeeperConfig::default());
    assert!(record.passed);
    gatekeeper.record_validation(record).await;

    gatekeeper.transition(version_id, Transition::Submit).await.unwrap();
    let after_approve = gatekeeper
        .transition(version_id, Transition::Approve)
        .await
        .unwrap();
    assert_eq!(after_approve.state, VersionState::Paper);

    gatekeeper.transition(version_id, Transition::Promote).await.unwrap();
    gatekeeper.transition(version_id, Transition::Promote).await.unwrap();
    let live = gatekeeper.transition(version_id, Transition::Promote).await.unwrap();
    assert_eq!(live.state, VersionState::Live);
}
