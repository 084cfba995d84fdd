use serde::{Deserialize, Serialize};

/// Fired when a message becomes visible on a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageReadyEvent {
    pub msg_id: i64,
    pub queue_name: String,
    pub namespace: String,
}

impl MessageReadyEvent {
    pub fn new(msg_id: i64, queue_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            msg_id,
            queue_name: queue_name.into(),
            namespace: namespace.into(),
        }
    }
}

/// Fired when `pgmq.create` registers a new queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueCreatedEvent {
    pub queue_name: String,
    pub namespace: String,
}

impl QueueCreatedEvent {
    pub fn new(queue_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            namespace: namespace.into(),
        }
    }
}

/// Decoded payload of a `pg_notify` event on a pgmq channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PgmqNotifyEvent {
    MessageReady(MessageReadyEvent),
    QueueCreated(QueueCreatedEvent),
}

impl PgmqNotifyEvent {
    pub fn namespace(&self) -> &str {
        match self {
            Self::MessageReady(e) => &e.namespace,
            Self::QueueCreated(e) => &e.namespace,
        }
    }

    pub fn queue_name(&self) -> &str {
        match self {
            Self::MessageReady(e) => &e.queue_name,
            Self::QueueCreated(e) => &e.queue_name,
        }
    }

    pub fn msg_id(&self) -> Option<i64> {
        match self {
            Self::MessageReady(e) => Some(e.msg_id),
            Self::QueueCreated(_) => None,
        }
    }
}
