//! Lifecycle Gatekeeper: enforces the Strategy Version promotion state
//! machine, the mandatory backtest gate, risk scoring, and the approval
//! workflow that authorizes a promotion past `in-review`.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use quantctl_shared::config::GatekeeperConfig;
use quantctl_shared::error::ErrorKind;
use quantctl_shared::messaging::{topics, MessageBus};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionState {
    Draft,
    InReview,
    Paper,
    Shadow,
    Canary,
    Live,
    Paused,
    Disabled,
}

impl VersionState {
    fn is_terminal(self) -> bool {
        matches!(self, VersionState::Disabled)
    }

    /// Non-`disable` transitions allowed from this state, per the directed
    /// graph: draft -> in-review -> paper -> shadow -> canary -> live, with
    /// a reject edge back to draft and a pause/resume loop on live.
    fn allowed_next(self, action: Transition) -> Option<VersionState> {
        use Transition::*;
        use VersionState::*;
        match (self, action) {
            (Draft, Submit) => Some(InReview),
            (InReview, Approve) => Some(Paper),
            (InReview, Reject) => Some(Draft),
            (Paper, Promote) => Some(Shadow),
            (Shadow, Promote) => Some(Canary),
            (Canary, Promote) => Some(Live),
            (Live, Pause) => Some(Paused),
            (Paused, Resume) => Some(Live),
            (_, Disable) if self != Disabled => Some(Disabled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Submit,
    Approve,
    Reject,
    Promote,
    Pause,
    Resume,
    Disable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyVersion {
    pub version_id: Uuid,
    pub strategy_id: String,
    pub version_label: String,
    pub config_blob: serde_json::Value,
    pub state: VersionState,
    pub performance_snapshot: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Raw backtest output, as returned by the external backtest engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub window_days: u32,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub total_return: f64,
    pub trades_per_day: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Unacceptable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub score: f64,
    pub level: RiskLevel,
}

/// Weighted sub-scores (each already normalized to [0, 100]) feeding the
/// composite risk score: drawdown 30%, volatility 20%, leverage 25%,
/// concentration 15%, liquidity 10%.
#[derive(Debug, Clone, Copy)]
pub struct RiskInputs {
    pub drawdown_score: f64,
    pub volatility_score: f64,
    pub leverage_score: f64,
    pub concentration_score: f64,
    pub liquidity_score: f64,
}

pub fn assess_risk(inputs: RiskInputs) -> RiskAssessment {
    let score = inputs.drawdown_score * 0.30
        + inputs.volatility_score * 0.20
        + inputs.leverage_score * 0.25
        + inputs.concentration_score * 0.15
        + inputs.liquidity_score * 0.10;
    let level = if score >= 80.0 {
        RiskLevel::Low
    } else if score >= 60.0 {
        RiskLevel::Medium
    } else if score >= 40.0 {
        RiskLevel::High
    } else {
        RiskLevel::Unacceptable
    };
    RiskAssessment { score, level }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub strategy_id: String,
    pub backtest_result: BacktestResult,
    pub risk_assessment: RiskAssessment,
    pub passed: bool,
    pub failure_reasons: Vec<String>,
    pub next_revalidation_at: DateTime<Utc>,
}

/// Check the mandatory-backtest gate, collecting every failing reason
/// rather than short-circuiting on the first.
pub fn evaluate_backtest(result: &BacktestResult, config: &GatekeeperConfig) -> Vec<String> {
    let mut reasons = Vec::new();
    if result.window_days < config.min_backtest_days {
        reasons.push(format!("window<{}", config.min_backtest_days));
    }
    if result.sharpe_ratio < config.min_sharpe_ratio {
        reasons.push(format!("sharpe<{}", config.min_sharpe_ratio));
    }
    if result.max_drawdown > config.max_drawdown {
        reasons.push(format!("drawdown>{:.2}", config.max_drawdown));
    }
    if result.win_rate < config.min_win_rate {
        reasons.push(format!("win_rate<{}", config.min_win_rate));
    }
    if result.total_return < config.min_total_return {
        reasons.push(format!("total_return<{}", config.min_total_return));
    }
    if result.trades_per_day > config.max_trades_per_day {
        reasons.push(format!("trades_per_day>{}", config.max_trades_per_day));
    }
    reasons
}

pub fn build_validation_record(
    strategy_id: &str,
    result: BacktestResult,
    risk: RiskAssessment,
    config: &GatekeeperConfig,
) -> ValidationRecord {
    let mut reasons = evaluate_backtest(&result, config);
    if risk.level == RiskLevel::Unacceptable {
        reasons.push("risk=unacceptable".to_string());
    }
    let passed = reasons.is_empty();
    ValidationRecord {
        strategy_id: strategy_id.to_string(),
        backtest_result: result,
        risk_assessment: risk,
        passed,
        failure_reasons: reasons,
        next_revalidation_at: Utc::now() + ChronoDuration::days(config.revalidation_days),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    Activation,
    ParameterChange,
    RiskLimitChange,
    ModeChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub approval_type: ApprovalType,
    pub strategy_id: String,
    pub version_id: Uuid,
    pub status: ApprovalStatus,
    pub requester: String,
    pub approver: Option<String>,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum GatekeeperError {
    #[error("invalid state transition for version {0}")]
    InvalidTransition(Uuid),

    #[error("validation failed: {0:?}")]
    ValidationFailed(Vec<String>),

    #[error("no current validation record for strategy {0}")]
    NoValidationRecord(String),

    #[error("validation record expired for strategy {0}")]
    ValidationExpired(String),

    #[error("approval request {0} not found")]
    ApprovalNotFound(Uuid),
}

impl GatekeeperError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatekeeperError::InvalidTransition(_) => ErrorKind::InvalidState,
            GatekeeperError::ValidationFailed(_) => ErrorKind::ValidationFailed,
            GatekeeperError::NoValidationRecord(_) => ErrorKind::ValidationFailed,
            GatekeeperError::ValidationExpired(_) => ErrorKind::ValidationFailed,
            GatekeeperError::ApprovalNotFound(_) => ErrorKind::InvalidState,
        }
    }
}

/// In-process state for versions/validations/approvals. Persistence at the
/// boundary is delegated to whatever implements the external persistence
/// interface; this struct is the authoritative in-memory projection the
/// gatekeeper operates against between flushes.
#[derive(Debug, Default)]
struct GatekeeperState {
    versions: std::collections::HashMap<Uuid, StrategyVersion>,
    validations: std::collections::HashMap<String, ValidationRecord>,
    approvals: std::collections::HashMap<Uuid, ApprovalRequest>,
}

#[derive(Debug)]
pub struct LifecycleGatekeeper {
    config: GatekeeperConfig,
    bus: MessageBus,
    state: tokio::sync::RwLock<GatekeeperState>,
}

impl LifecycleGatekeeper {
    pub fn new(config: GatekeeperConfig, bus: MessageBus) -> Arc<Self> {
        Arc::new(Self {
            config,
            bus,
            state: tokio::sync::RwLock::new(GatekeeperState::default()),
        })
    }

    pub async fn register_version(&self, version: StrategyVersion) {
        self.state.write().await.versions.insert(version.version_id, version);
    }

    pub async fn record_validation(&self, record: ValidationRecord) {
        self.state
            .write()
            .await
            .validations
            .insert(record.strategy_id.clone(), record);
    }

    pub async fn get_version(&self, version_id: Uuid) -> Option<StrategyVersion> {
        self.state.read().await.versions.get(&version_id).cloned()
    }

    /// Apply `action` to `version_id`. Transitions beyond `in-review`
    /// require a current, unexpired, passing validation record.
    pub async fn transition(
        &self,
        version_id: Uuid,
        action: Transition,
    ) -> Result<StrategyVersion, GatekeeperError> {
        let mut state = self.state.write().await;
        let version = state
            .versions
            .get(&version_id)
            .cloned()
            .ok_or(GatekeeperError::InvalidTransition(version_id))?;

        if version.state.is_terminal() {
            return Err(GatekeeperError::InvalidTransition(version_id));
        }

        let next = version
            .state
            .allowed_next(action)
            .ok_or(GatekeeperError::InvalidTransition(version_id))?;

        let requires_validation = !matches!(
            (version.state, next),
            (VersionState::Draft, VersionState::InReview) | (VersionState::InReview, VersionState::Draft)
        );

        if requires_validation && next != VersionState::Disabled {
            let record = state
                .validations
                .get(&version.strategy_id)
                .ok_or_else(|| GatekeeperError::NoValidationRecord(version.strategy_id.clone()))?;
            if record.next_revalidation_at < Utc::now() {
                return Err(GatekeeperError::ValidationExpired(version.strategy_id.clone()));
            }
            if !record.passed {
                return Err(GatekeeperError::ValidationFailed(record.failure_reasons.clone()));
            }
        }

        let mut updated = version.clone();
        updated.state = next;
        updated.updated_at = Utc::now();
        state.versions.insert(version_id, updated.clone());
        Ok(updated)
    }

    /// Force-move to `disabled` regardless of current state (except an
    /// already-terminal version, which is a no-op).
    pub async fn force_disable(&self, version_id: Uuid) -> Result<StrategyVersion, GatekeeperError> {
        let mut state = self.state.write().await;
        let version = state
            .versions
            .get(&version_id)
            .cloned()
            .ok_or(GatekeeperError::InvalidTransition(version_id))?;
        if version.state.is_terminal() {
            return Ok(version);
        }
        let mut updated = version;
        updated.state = VersionState::Disabled;
        updated.updated_at = Utc::now();
        state.versions.insert(version_id, updated.clone());
        Ok(updated)
    }

    pub async fn submit_approval(
        &self,
        approval_type: ApprovalType,
        strategy_id: &str,
        version_id: Uuid,
        requester: &str,
    ) -> ApprovalRequest {
        let now = Utc::now();
        let request = ApprovalRequest {
            id: Uuid::now_v7(),
            approval_type,
            strategy_id: strategy_id.to_string(),
            version_id,
            status: ApprovalStatus::Pending,
            requester: requester.to_string(),
            approver: None,
            comment: None,
            created_at: now,
            updated_at: now,
        };
        self.state.write().await.approvals.insert(request.id, request.clone());
        request
    }

    /// Idempotent-when-pending: a second approve/reject on an already
    /// decided request is a no-op that returns the existing record.
    pub async fn decide_approval(
        &self,
        request_id: Uuid,
        approve: bool,
        approver: &str,
        comment: Option<String>,
    ) -> Result<ApprovalRequest, GatekeeperError> {
        let decided = {
            let mut state = self.state.write().await;
            let request = state
                .approvals
                .get_mut(&request_id)
                .ok_or(GatekeeperError::ApprovalNotFound(request_id))?;

            if request.status != ApprovalStatus::Pending {
                return Ok(request.clone());
            }

            request.status = if approve {
                ApprovalStatus::Approved
            } else {
                ApprovalStatus::Rejected
            };
            request.approver = Some(approver.to_string());
            request.comment = comment;
            request.updated_at = Utc::now();
            request.clone()
        };

        let _ = self
            .bus
            .publish(
                topics::APPROVAL_STATE_CHANGED,
                serde_json::json!({
                    "request_id": decided.id,
                    "strategy_id": decided.strategy_id,
                    "version_id": decided.version_id,
                    "status": decided.status,
                    "approver": decided.approver,
                    "comment": decided.comment,
                }),
            )
            .await;

        Ok(decided)
    }

    pub async fn get_approval(&self, request_id: Uuid) -> Option<ApprovalRequest> {
        self.state.read().await.approvals.get(&request_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passing_backtest() -> BacktestResult {
        BacktestResult {
            window_days: 400,
            sharpe_ratio: 1.2,
            max_drawdown: 0.10,
            win_rate: 0.55,
            total_return: 0.20,
            trades_per_day: 4.0,
        }
    }

    fn low_risk() -> RiskAssessment {
        RiskAssessment { score: 90.0, level: RiskLevel::Low }
    }

    fn new_version(strategy_id: &str) -> StrategyVersion {
        let now = Utc::now();
        StrategyVersion {
            version_id: Uuid::now_v7(),
            strategy_id: strategy_id.to_string(),
            version_label: "v1".to_string(),
            config_blob: serde_json::json!({}),
            state: VersionState::Draft,
            performance_snapshot: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn risk_score_buckets_match_thresholds() {
        let inputs = RiskInputs {
            drawdown_score: 90.0,
            volatility_score: 90.0,
            leverage_score: 90.0,
            concentration_score: 90.0,
            liquidity_score: 90.0,
        };
        assert_eq!(assess_risk(inputs).level, RiskLevel::Low);

        let low_inputs = RiskInputs {
            drawdown_score: 20.0,
            volatility_score: 20.0,
            leverage_score: 20.0,
            concentration_score: 20.0,
            liquidity_score: 20.0,
        };
        assert_eq!(assess_risk(low_inputs).level, RiskLevel::Unacceptable);
    }

    #[test]
    fn failing_backtest_reports_exact_reason_strings() {
        let config = GatekeeperConfig::default();
        let result = BacktestResult {
            window_days: 400,
            sharpe_ratio: 0.3,
            max_drawdown: 0.25,
            win_rate: 0.55,
            total_return: 0.20,
            trades_per_day: 4.0,
        };
        let reasons = evaluate_backtest(&result, &config);
        assert!(reasons.contains(&"sharpe<0.5".to_string()));
        assert!(reasons.contains(&"drawdown>0.20".to_string()));
    }

    #[tokio::test]
    async fn promotion_blocked_without_validation_record() {
        let bus = MessageBus::in_memory(16);
        let gk = LifecycleGatekeeper::new(GatekeeperConfig::default(), bus);
        let version = new_version("s1");
        let id = version.version_id;
        gk.register_version(version).await;

        gk.transition(id, Transition::Submit).await.unwrap();
        let err = gk.transition(id, Transition::Approve).await.unwrap_err();
        assert!(matches!(err, GatekeeperError::NoValidationRecord(_)));
    }

    #[tokio::test]
    async fn full_promotion_path_with_passing_validation() {
        let bus = MessageBus::in_memory(16);
        let gk = LifecycleGatekeeper::new(GatekeeperConfig::default(), bus);
        let version = new_version("s1");
        let id = version.version_id;
        gk.register_version(version).await;
        let record = build_validation_record("s1", passing_backtest(), low_risk(), &GatekeeperConfig::default());
        assert!(record.passed);
        gk.record_validation(record).await;

        gk.transition(id, Transition::Submit).await.unwrap();
        let v = gk.transition(id, Transition::Approve).await.unwrap();
        assert_eq!(v.state, VersionState::Paper);
        let v = gk.transition(id, Transition::Promote).await.unwrap();
        assert_eq!(v.state, VersionState::Shadow);
        let v = gk.transition(id, Transition::Promote).await.unwrap();
        assert_eq!(v.state, VersionState::Canary);
        let v = gk.transition(id, Transition::Promote).await.unwrap();
        assert_eq!(v.state, VersionState::Live);
    }

    #[tokio::test]
    async fn approve_twice_is_idempotent() {
        let bus = MessageBus::in_memory(16);
        let gk = LifecycleGatekeeper::new(GatekeeperConfig::default(), bus);
        let request = gk
            .submit_approval(ApprovalType::Activation, "s1", Uuid::now_v7(), "alice")
            .await;

        let first = gk.decide_approval(request.id, true, "bob", None).await.unwrap();
        assert_eq!(first.status, ApprovalStatus::Approved);
        let second = gk.decide_approval(request.id, false, "carol", None).await.unwrap();
        assert_eq!(second.status, ApprovalStatus::Approved);
        assert_eq!(second.approver, Some("bob".to_string()));
    }
}
