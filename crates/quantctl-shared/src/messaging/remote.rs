//! Broker-backed bus backend, built on `quantctl_pgmq::PgmqClient`.
//!
//! Each topic maps 1:1 onto a pgmq queue (the topic name itself, sanitized).
//! `publish` serializes and hands off to the broker; `subscribe` spawns a
//! poll-loop task per subscription that reads, dispatches, and acks/nacks.
//! Ordering is best-effort per topic only: two pollers on the same topic
//! race for the same underlying queue, so cross-subscriber ordering is not
//! guaranteed here the way it is on the in-memory backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use quantctl_pgmq::{PgmqClient, PgmqError};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::resilience::{CircuitBreaker, CircuitBreakerBehavior};

use super::bus::{new_subscription_id, validate_topic, Message, MessageHandler, MessagingError, SubscriptionId};

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const VISIBILITY_TIMEOUT_SECS: i32 = 30;
const READ_BATCH: i32 = 10;

fn sanitize_queue_name(topic: &str) -> String {
    topic
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

impl From<PgmqError> for MessagingError {
    fn from(e: PgmqError) -> Self {
        MessagingError::Transient(e.to_string())
    }
}

/// Broker-backed message bus, circuit-breaker protected.
#[derive(Debug)]
pub struct RemoteBus {
    client: Arc<PgmqClient>,
    breaker: Arc<CircuitBreaker>,
    pollers: DashMap<(String, SubscriptionId), JoinHandle<()>>,
    closed: Arc<AtomicBool>,
}

impl RemoteBus {
    pub fn new(client: PgmqClient, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            client: Arc::new(client),
            breaker,
            pollers: DashMap::new(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn ensure_queue(&self, queue: &str) -> Result<(), MessagingError> {
        self.client
            .create_queue(queue)
            .await
            .map_err(MessagingError::from)
    }

    pub async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), MessagingError> {
        if self.is_closed() {
            return Err(MessagingError::Closed);
        }
        validate_topic(topic)?;

        if !self.breaker.should_allow() {
            return Err(MessagingError::circuit_breaker_open("bus.remote"));
        }

        let queue = sanitize_queue_name(topic);
        let start = std::time::Instant::now();
        let result = async {
            self.ensure_queue(&queue).await?;
            self.client
                .send_json_message(&queue, &payload)
                .await
                .map(|_| ())
                .map_err(MessagingError::from)
        }
        .await;

        match &result {
            Ok(()) => self.breaker.record_success(start.elapsed()),
            Err(_) => self.breaker.record_failure(start.elapsed()),
        }
        result
    }

    pub async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionId, MessagingError> {
        if self.is_closed() {
            return Err(MessagingError::Closed);
        }
        validate_topic(topic)?;

        let queue = sanitize_queue_name(topic);
        self.ensure_queue(&queue).await?;

        let id = new_subscription_id();
        let client = self.client.clone();
        let topic_owned = topic.to_string();
        let closed = self.closed.clone();

        let task = tokio::spawn(async move {
            loop {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                match client
                    .read_messages(&queue, Some(VISIBILITY_TIMEOUT_SECS), Some(READ_BATCH))
                    .await
                {
                    Ok(messages) => {
                        for pgmq_msg in messages {
                            let message = Message {
                                id: uuid::Uuid::now_v7(),
                                topic: topic_owned.clone(),
                                payload: pgmq_msg.message.clone(),
                                enqueue_time: pgmq_msg.enqueued_at,
                                delivery_attempts: pgmq_msg.read_ct.max(0) as u32,
                            };
                            match handler.handle(message).await {
                                Ok(()) => {
                                    if let Err(e) = client.delete_message(&queue, pgmq_msg.msg_id).await {
                                        warn!(topic = %topic_owned, error = %e, "failed to ack message");
                                    }
                                }
                                Err(e) => {
                                    error!(topic = %topic_owned, error = %e, "handler failed, leaving message for redelivery");
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!(topic = %topic_owned, error = %e, "poll failed");
                    }
                }
                sleep(POLL_INTERVAL).await;
            }
            debug!(topic = %topic_owned, "remote bus poller exiting");
        });

        self.pollers.insert((topic.to_string(), id), task);
        Ok(id)
    }

    pub async fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> Result<(), MessagingError> {
        if let Some((_, task)) = self.pollers.remove(&(topic.to_string(), id)) {
            task.abort();
        }
        Ok(())
    }

    pub async fn close(&self, drain_deadline: Duration) -> Result<(), MessagingError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        sleep(drain_deadline).await;
        for entry in self.pollers.iter() {
            entry.value().abort();
        }
        self.pollers.clear();
        Ok(())
    }

    /// Confirm every expected topic's backing queue exists, for startup
    /// health checks.
    pub async fn verify_queues(&self, topics: &[&str]) -> Result<(), MessagingError> {
        for topic in topics {
            self.ensure_queue(&sanitize_queue_name(topic)).await?;
        }
        Ok(())
    }
}
