//! # Message Bus
//!
//! Pluggable at-least-once pub/sub with identical semantics across two
//! backends: an in-memory fast path ([`InMemoryBus`]) and a broker-backed
//! remote path ([`RemoteBus`], over `quantctl-pgmq`). [`MessageBus`] is an
//! enum-dispatch facade over both (enum dispatch instead of `Arc<dyn Trait>`,
//! since the set of backends is closed and known at compile time).

mod bus;
mod memory;
mod remote;

pub use bus::{handler_fn, Message, MessageHandler, MessagingError, SubscriptionId};
pub use memory::InMemoryBus;
pub use remote::RemoteBus;

use std::sync::Arc;
use std::time::Duration;

/// Enum-dispatch facade implementing the Publish/Subscribe/Unsubscribe/Close
/// contract identically regardless of backend.
#[derive(Debug, Clone)]
pub enum MessageBus {
    InMemory(Arc<InMemoryBus>),
    Remote(Arc<RemoteBus>),
}

impl MessageBus {
    pub fn in_memory(queue_bound: usize) -> Self {
        Self::InMemory(Arc::new(InMemoryBus::new(queue_bound)))
    }

    pub fn remote(bus: RemoteBus) -> Self {
        Self::Remote(Arc::new(bus))
    }

    pub fn provider_name(&self) -> &'static str {
        match self {
            MessageBus::InMemory(_) => "in_memory",
            MessageBus::Remote(_) => "remote",
        }
    }

    pub async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), MessagingError> {
        match self {
            MessageBus::InMemory(b) => b.publish(topic, payload).await,
            MessageBus::Remote(b) => b.publish(topic, payload).await,
        }
    }

    pub async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionId, MessagingError> {
        match self {
            MessageBus::InMemory(b) => b.subscribe(topic, handler).await,
            MessageBus::Remote(b) => b.subscribe(topic, handler).await,
        }
    }

    pub async fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> Result<(), MessagingError> {
        match self {
            MessageBus::InMemory(b) => b.unsubscribe(topic, id).await,
            MessageBus::Remote(b) => b.unsubscribe(topic, id).await,
        }
    }

    pub async fn close(&self, drain_deadline: Duration) -> Result<(), MessagingError> {
        match self {
            MessageBus::InMemory(b) => b.close(drain_deadline).await,
            MessageBus::Remote(b) => b.close(drain_deadline).await,
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            MessageBus::InMemory(b) => b.is_closed(),
            MessageBus::Remote(b) => b.is_closed(),
        }
    }

    /// Confirm the bus's backing storage exists for every topic in the
    /// catalog. A no-op on the in-memory backend, which has no durable
    /// storage to verify.
    pub async fn verify_queues(&self, topics: &[&str]) -> Result<(), MessagingError> {
        match self {
            MessageBus::InMemory(_) => Ok(()),
            MessageBus::Remote(b) => b.verify_queues(topics).await,
        }
    }
}

/// Bus topic catalog — part of the wire contract, shared by every
/// producer/consumer in the workspace.
pub mod topics {
    pub const OPTIMIZATION_REQUEST: &str = "optimization.request";
    pub const OPTIMIZATION_RESULT: &str = "optimization.result";
    pub const PROCESS_EXIT: &str = "process.exit";
    pub const TRADE_SIGNAL: &str = "trade.signal";
    pub const MARKET_DATA: &str = "market.data";
    pub const APPROVAL_STATE_CHANGED: &str = "approval.state-changed";
    pub const BACKTEST_COMPLETED: &str = "backtest.completed";

    pub const ALL: &[&str] = &[
        OPTIMIZATION_REQUEST,
        OPTIMIZATION_RESULT,
        PROCESS_EXIT,
        TRADE_SIGNAL,
        MARKET_DATA,
        APPROVAL_STATE_CHANGED,
        BACKTEST_COMPLETED,
    ];
}
