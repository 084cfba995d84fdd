//! In-memory bus backend: a bounded queue feeding a single dispatch loop.
//!
//! Fan-out is implemented by forwarding each dispatched message to one
//! unbounded per-subscriber channel, each drained by its own dedicated task.
//! This gives FIFO delivery within a single (topic, subscriber) pair (the
//! per-subscriber task processes its inbox strictly in arrival order) while
//! still letting distinct subscribers — and distinct topics — make progress
//! concurrently and independently.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::bus::{new_subscription_id, validate_topic, Message, MessageHandler, MessagingError, SubscriptionId};

struct Subscriber {
    id: SubscriptionId,
    tx: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
}

/// In-memory pub/sub backend. Cheap to construct; intended to be wrapped in
/// an `Arc` and shared (it already is, internally, via `DashMap`/channels).
#[derive(Debug)]
pub struct InMemoryBus {
    publish_tx: mpsc::Sender<Message>,
    subscribers: Arc<DashMap<String, Vec<Subscriber>>>,
    closed: Arc<AtomicBool>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber").field("id", &self.id).finish()
    }
}

impl InMemoryBus {
    /// Create a new bus with a bounded publish queue of `queue_bound`.
    pub fn new(queue_bound: usize) -> Self {
        let (publish_tx, mut publish_rx) = mpsc::channel::<Message>(queue_bound.max(1));
        let subscribers: Arc<DashMap<String, Vec<Subscriber>>> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let dispatch_subscribers = subscribers.clone();
        let dispatch_task = tokio::spawn(async move {
            while let Some(message) = publish_rx.recv().await {
                if let Some(entry) = dispatch_subscribers.get(&message.topic) {
                    for sub in entry.iter() {
                        if sub.tx.send(message.clone()).is_err() {
                            warn!(topic = %message.topic, subscription = ?sub.id, "subscriber channel closed, dropping");
                        }
                    }
                }
            }
            debug!("in-memory bus dispatch loop exiting");
        });

        Self {
            publish_tx,
            subscribers,
            closed,
            dispatch_task: Mutex::new(Some(dispatch_task)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), MessagingError> {
        if self.is_closed() {
            return Err(MessagingError::Closed);
        }
        validate_topic(topic)?;
        let message = Message::new(topic, payload);
        self.publish_tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => MessagingError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => MessagingError::Closed,
        })
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

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let id = new_subscription_id();
        let topic_owned = topic.to_string();

        let task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let result = AssertUnwindSafe(handler.handle(message.clone()))
                    .catch_unwind()
                    .await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        error!(topic = %topic_owned, message_id = %message.id, error = %err, "subscriber handler returned an error");
                    }
                    Err(_) => {
                        error!(topic = %topic_owned, message_id = %message.id, "subscriber handler panicked");
                    }
                }
            }
        });

        self.subscribers
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber { id, tx, task });

        Ok(id)
    }

    pub async fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> Result<(), MessagingError> {
        if let Some(mut entry) = self.subscribers.get_mut(topic) {
            if let Some(pos) = entry.iter().position(|s| s.id == id) {
                let sub = entry.swap_remove(pos);
                sub.task.abort();
            }
        }
        Ok(())
    }

    /// Idempotent, draining close. No further publish succeeds; buffered
    /// messages already in the dispatch queue are allowed to drain up to
    /// `drain_deadline` before subscriber tasks are aborted.
    pub async fn close(&self, drain_deadline: Duration) -> Result<(), MessagingError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(()); // already closed
        }

        let mut guard = self.dispatch_task.lock().await;
        if let Some(task) = guard.take() {
            // The dispatch loop's receiver only sees the channel close once
            // every sender is dropped, and `self.publish_tx` lives as long
            // as we do; give buffered messages a grace period to reach
            // subscriber inboxes, then tear the loop down unconditionally.
            tokio::time::sleep(drain_deadline).await;
            task.abort();
        }

        for mut entry in self.subscribers.iter_mut() {
            for sub in entry.value_mut().drain(..) {
                sub.task.abort();
            }
        }
        self.subscribers.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn publish_fans_out_to_all_subscribers() {
        let bus = InMemoryBus::new(16);
        let counter_a = Arc::new(AtomicU32::new(0));
        let counter_b = Arc::new(AtomicU32::new(0));

        let ca = counter_a.clone();
        bus.subscribe(
            "trade.signal",
            super::super::bus::handler_fn(move |_msg| {
                let ca = ca.clone();
                async move {
                    ca.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

        let cb = counter_b.clone();
        bus.subscribe(
            "trade.signal",
            super::super::bus::handler_fn(move |_msg| {
                let cb = cb.clone();
                async move {
                    cb.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

        bus.publish("trade.signal", serde_json::json!({"x": 1}))
            .await
            .unwrap();

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert_eq!(counter_a.load(Ordering::SeqCst), 1);
        assert_eq!(counter_b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn queue_full_fails_fast() {
        let bus = InMemoryBus::new(2);
        // No subscribers: publishes still occupy the bounded dispatch queue
        // until the dispatch loop drains them, so a burst can race ahead of
        // the loop. Use a handler that blocks briefly to guarantee backlog.
        bus.subscribe(
            "slow",
            super::super::bus::handler_fn(|_m| async move {
                tokio::time::sleep(StdDuration::from_millis(200)).await;
                Ok(())
            }),
        )
        .await
        .unwrap();

        let mut results = Vec::new();
        for i in 0..4 {
            results.push(
                bus.publish("slow", serde_json::json!({"i": i}))
                    .await,
            );
        }
        assert!(results.iter().any(|r| matches!(r, Err(MessagingError::QueueFull))));
    }

    #[tokio::test]
    async fn handler_panic_does_not_affect_other_subscribers() {
        let bus = InMemoryBus::new(16);
        let counter = Arc::new(AtomicU32::new(0));

        bus.subscribe(
            "panicky",
            super::super::bus::handler_fn(|_m| async move {
                panic!("boom");
            }),
        )
        .await
        .unwrap();

        let c = counter.clone();
        bus.subscribe(
            "panicky",
            super::super::bus::handler_fn(move |_m| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

        bus.publish("panicky", serde_json::json!(null)).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_further_publish() {
        let bus = InMemoryBus::new(4);
        bus.close(StdDuration::from_millis(100)).await.unwrap();
        bus.close(StdDuration::from_millis(100)).await.unwrap();

        let err = bus.publish("x", serde_json::json!(null)).await.unwrap_err();
        assert!(matches!(err, MessagingError::Closed));
    }

    #[tokio::test]
    async fn fifo_order_within_topic_subscriber_pair() {
        let bus = InMemoryBus::new(32);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        bus.subscribe(
            "ordered",
            super::super::bus::handler_fn(move |msg| {
                let seen_clone = seen_clone.clone();
                async move {
                    let n = msg.payload.get("n").and_then(|v| v.as_i64()).unwrap();
                    seen_clone.lock().await.push(n);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

        for i in 0..10 {
            bus.publish("ordered", serde_json::json!({"n": i})).await.unwrap();
        }

        tokio::time::sleep(StdDuration::from_millis(100)).await;
        let collected = seen.lock().await.clone();
        assert_eq!(collected, (0..10).collect::<Vec<_>>());
    }
}
