//! External collaborator interfaces: the narrow contracts the core depends
//! on without knowing how they're backed. Each trait is the boundary the
//! domain logic actually needs, not a general-purpose client API; an
//! in-memory fake of each lives under `#[cfg(test)]` below for unit tests
//! that exercise the domain logic without a database, exchange, or
//! backtest engine behind it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::gatekeeper::{ApprovalRequest, BacktestResult, StrategyVersion, ValidationRecord};
use crate::process::ProcessRecord;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("persistence backend error: {0}")]
    Backend(String),
}

/// Append/upsert-style storage for every record the core produces, keyed
/// for lookup by id, by strategy, and by timestamp range. No transactional
/// guarantees are required of an implementation.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn put_strategy_version(&self, version: StrategyVersion) -> Result<(), PersistenceError>;
    async fn get_strategy_version(&self, id: Uuid) -> Result<StrategyVersion, PersistenceError>;
    async fn list_strategy_versions(&self, strategy_id: &str) -> Result<Vec<StrategyVersion>, PersistenceError>;

    async fn put_validation_record(&self, record: ValidationRecord) -> Result<(), PersistenceError>;
    async fn get_validation_record(&self, strategy_id: &str) -> Result<ValidationRecord, PersistenceError>;

    async fn put_backtest_result(&self, strategy_id: &str, result: BacktestResult) -> Result<(), PersistenceError>;

    async fn put_approval_request(&self, request: ApprovalRequest) -> Result<(), PersistenceError>;
    async fn get_approval_request(&self, id: Uuid) -> Result<ApprovalRequest, PersistenceError>;

    async fn put_process_audit(&self, record: ProcessRecord) -> Result<(), PersistenceError>;
    async fn list_process_audits_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ProcessRecord>, PersistenceError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    pub asset: String,
    pub free: f64,
    pub locked: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub entry_price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub limit_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub filled_quantity: f64,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub tick_size: f64,
    pub lot_size: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_position_size: f64,
    pub max_leverage: f64,
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transient exchange I/O error: {0}")]
    Transient(String),
    #[error("exchange rejected the request: {0}")]
    Rejected(String),
}

impl ExchangeError {
    pub fn kind(&self) -> quantctl_shared::error::ErrorKind {
        match self {
            ExchangeError::Transient(_) => quantctl_shared::error::ErrorKind::TransientIo,
            ExchangeError::Rejected(_) => quantctl_shared::error::ErrorKind::InvalidState,
        }
    }
}

/// Everything a trading process needs from the venue it trades on. The
/// core treats every failure as retriable-or-terminal per [`ExchangeError::kind`].
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn server_time(&self) -> Result<DateTime<Utc>, ExchangeError>;
    async fn account_balance(&self) -> Result<Vec<AccountBalance>, ExchangeError>;
    async fn positions(&self) -> Result<Vec<Position>, ExchangeError>;
    async fn place_order(&self, order: OrderRequest) -> Result<OrderRecord, ExchangeError>;
    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError>;
    async fn get_order(&self, order_id: &str) -> Result<OrderRecord, ExchangeError>;
    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo, ExchangeError>;
    async fn risk_limits(&self) -> Result<RiskLimits, ExchangeError>;
}

#[derive(Debug, Error)]
pub enum BacktestEngineError {
    #[error("backtest engine error: {0}")]
    Failed(String),
}

/// Accepts a strategy version and a time window, returns the backtest result
/// the gatekeeper evaluates against its promotion thresholds.
#[async_trait]
pub trait BacktestEngine: Send + Sync {
    async fn run(
        &self,
        strategy_version: &StrategyVersion,
        window_days: u32,
    ) -> Result<BacktestResult, BacktestEngineError>;
}
