//! Message bus contract: the narrow capability set
//! `{Publish, Subscribe, Unsubscribe, Close}` shared by both backends.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;

/// A message in flight on the bus. Payload is opaque JSON by convention:
/// the bus itself never interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub topic: String,
    pub payload: serde_json::Value,
    pub enqueue_time: DateTime<Utc>,
    pub delivery_attempts: u32,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            topic: topic.into(),
            payload,
            enqueue_time: Utc::now(),
            delivery_attempts: 0,
        }
    }
}

/// Opaque handle returned by `subscribe`, needed to `unsubscribe` later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

/// Errors a bus backend can surface. These map onto the orthogonal taxonomy
/// via [`MessagingError::kind`].
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("bus queue is full")]
    QueueFull,

    #[error("bus is closed")]
    Closed,

    #[error("circuit breaker open for {0}")]
    CircuitBreakerOpen(String),

    #[error("transient messaging error: {0}")]
    Transient(String),

    #[error("invalid topic name: {0}")]
    InvalidTopic(String),

    #[error("operation timed out")]
    Timeout,
}

impl MessagingError {
    pub fn circuit_breaker_open(name: impl Into<String>) -> Self {
        Self::CircuitBreakerOpen(name.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MessagingError::QueueFull => ErrorKind::QueueFull,
            MessagingError::Closed => ErrorKind::InvalidState,
            MessagingError::CircuitBreakerOpen(_) => ErrorKind::TransientIo,
            MessagingError::Transient(_) => ErrorKind::TransientIo,
            MessagingError::InvalidTopic(_) => ErrorKind::InvalidState,
            MessagingError::Timeout => ErrorKind::Timeout,
        }
    }
}

/// A subscriber's handler. Handlers run under panic recovery: a panic or an
/// `Err` return must not affect delivery to other handlers or other messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<(), MessagingError>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), MessagingError>> + Send,
{
    async fn handle(&self, message: Message) -> Result<(), MessagingError> {
        (self.f)(message).await
    }
}

/// Wrap a closure as a [`MessageHandler`], for tests and for simple
/// subscribers that don't need their own type.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), MessagingError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

pub(crate) fn validate_topic(topic: &str) -> Result<(), MessagingError> {
    if topic.is_empty() || topic.len() > 255 {
        return Err(MessagingError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

pub(crate) fn new_subscription_id() -> SubscriptionId {
    SubscriptionId::new()
}
