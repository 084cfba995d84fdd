use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::OnceLock;

use crate::config::PgmqNotifyConfig;
use crate::error::PgmqError;
use crate::events::{MessageReadyEvent, PgmqNotifyEvent, QueueCreatedEvent};
use crate::Result;

fn namespace_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(?P<namespace>\w+)_queue$").expect("valid regex"))
}

fn queue_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9_]+$").expect("valid regex"))
}

fn validate_queue_name(name: &str) -> Result<()> {
    if queue_name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(PgmqError::InvalidQueueName(name.to_string()))
    }
}

/// A single message read back from a queue.
#[derive(Debug, Clone)]
pub struct PgmqMessage<T = Value> {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: DateTime<Utc>,
    pub vt: DateTime<Utc>,
    pub message: T,
}

fn row_to_message(row: PgRow) -> std::result::Result<PgmqMessage<Value>, sqlx::Error> {
    Ok(PgmqMessage {
        msg_id: row.try_get("msg_id")?,
        read_ct: row.try_get("read_ct")?,
        enqueued_at: row.try_get("enqueued_at")?,
        vt: row.try_get("vt")?,
        message: row.try_get("message")?,
    })
}

/// Per-queue depth/age snapshot, grounded on `pgmq.metrics`.
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    pub queue_name: String,
    pub message_count: i64,
    pub newest_msg_age_sec: Option<i64>,
    pub oldest_msg_age_sec: Option<i64>,
    pub total_messages: i64,
}

/// Connectivity summary returned by `get_client_status`.
#[derive(Debug, Clone)]
pub struct ClientStatus {
    pub connected: bool,
    pub client_type: String,
    pub notify_enabled: bool,
}

/// Async wrapper over the `pgmq` Postgres extension.
///
/// Queue mutation goes through the extension's SQL functions
/// (`pgmq.create`, `pgmq.send`, `pgmq.read`, ...) rather than hand-rolled
/// DDL or table access, with the exception of `read_specific_message`,
/// which has no extension-provided equivalent and reads the queue's
/// backing table directly.
#[derive(Debug, Clone)]
pub struct PgmqClient {
    pool: PgPool,
    config: PgmqNotifyConfig,
}

impl PgmqClient {
    /// Build a client from an existing pool, using default (triggers
    /// disabled) notify configuration.
    pub async fn new_with_pool(pool: PgPool) -> Self {
        Self::new_with_pool_and_config(pool, PgmqNotifyConfig::default()).await
    }

    pub(crate) async fn new_with_pool_and_config(pool: PgPool, config: PgmqNotifyConfig) -> Self {
        Self { pool, config }
    }

    pub fn config(&self) -> &PgmqNotifyConfig {
        &self.config
    }

    pub fn has_notify_capabilities(&self) -> bool {
        self.config.enable_triggers
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn create_queue(&self, queue: &str) -> Result<()> {
        validate_queue_name(queue)?;
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue)
            .execute(&self.pool)
            .await?;
        self.notify_queue_created(queue).await;
        Ok(())
    }

    pub async fn drop_queue(&self, queue: &str) -> Result<()> {
        validate_queue_name(queue)?;
        sqlx::query("SELECT pgmq.drop_queue($1)")
            .bind(queue)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn send_json_message<T: Serialize + Sync>(
        &self,
        queue: &str,
        message: &T,
    ) -> Result<i64> {
        self.send_message_with_delay(queue, message, 0).await
    }

    pub async fn send_message_with_delay<T: Serialize + Sync>(
        &self,
        queue: &str,
        message: &T,
        delay_secs: i32,
    ) -> Result<i64> {
        let payload = serde_json::to_value(message)?;
        let row = sqlx::query("SELECT * FROM pgmq.send($1, $2::jsonb, $3)")
            .bind(queue)
            .bind(&payload)
            .bind(delay_secs)
            .fetch_one(&self.pool)
            .await?;
        let msg_id: i64 = row.try_get(0)?;
        self.notify_message_ready(queue, msg_id).await;
        Ok(msg_id)
    }

    pub async fn send_with_transaction<T: Serialize + Sync>(
        &self,
        queue: &str,
        message: &T,
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<i64> {
        let payload = serde_json::to_value(message)?;
        let row = sqlx::query("SELECT * FROM pgmq.send($1, $2::jsonb)")
            .bind(queue)
            .bind(&payload)
            .fetch_one(&mut **tx)
            .await?;
        let msg_id: i64 = row.try_get(0)?;
        Ok(msg_id)
    }

    pub async fn read_messages(
        &self,
        queue: &str,
        vt_seconds: Option<i32>,
        limit: Option<i32>,
    ) -> Result<Vec<PgmqMessage<Value>>> {
        let vt = vt_seconds.unwrap_or(30);
        let limit = limit.unwrap_or(1);
        let rows = sqlx::query("SELECT * FROM pgmq.read($1, $2, $3)")
            .bind(queue)
            .bind(vt)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(row_to_message)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(PgmqError::from)
    }

    pub async fn pop_message(&self, queue: &str) -> Result<Option<PgmqMessage<Value>>> {
        let row = sqlx::query("SELECT * FROM pgmq.pop($1)")
            .bind(queue)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_message).transpose().map_err(PgmqError::from)
    }

    pub async fn delete_message(&self, queue: &str, msg_id: i64) -> Result<bool> {
        let row = sqlx::query("SELECT pgmq.delete($1, $2)")
            .bind(queue)
            .bind(msg_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<bool, _>(0)?)
    }

    pub async fn archive_message(&self, queue: &str, msg_id: i64) -> Result<bool> {
        let row = sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(queue)
            .bind(msg_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<bool, _>(0)?)
    }

    pub async fn set_visibility_timeout(
        &self,
        queue: &str,
        msg_id: i64,
        vt_seconds: i32,
    ) -> Result<()> {
        sqlx::query("SELECT * FROM pgmq.set_vt($1, $2, $3)")
            .bind(queue)
            .bind(msg_id)
            .bind(vt_seconds)
            .fetch_optional(&self.pool)
            .await?;
        Ok(())
    }

    /// Read a single message by id regardless of visibility, without
    /// consuming it. There is no `pgmq.*` function for this, so this reads
    /// the queue's backing table directly.
    pub async fn read_specific_message<T: DeserializeOwned>(
        &self,
        queue: &str,
        msg_id: i64,
        vt_seconds: i32,
    ) -> Result<Option<PgmqMessage<T>>> {
        validate_queue_name(queue)?;
        let sql = format!(
            "UPDATE pgmq.q_{queue} SET vt = clock_timestamp() + ($2 || ' seconds')::interval \
             WHERE msg_id = $1 RETURNING msg_id, read_ct, enqueued_at, vt, message"
        );
        let row = sqlx::query(&sql)
            .bind(msg_id)
            .bind(vt_seconds.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let message: Value = row.try_get("message")?;
        Ok(Some(PgmqMessage {
            msg_id: row.try_get("msg_id")?,
            read_ct: row.try_get("read_ct")?,
            enqueued_at: row.try_get("enqueued_at")?,
            vt: row.try_get("vt")?,
            message: serde_json::from_value(message)?,
        }))
    }

    pub async fn queue_metrics(&self, queue: &str) -> Result<QueueMetrics> {
        let row = sqlx::query("SELECT * FROM pgmq.metrics($1)")
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;
        Ok(QueueMetrics {
            queue_name: row.try_get("queue_name")?,
            message_count: row.try_get("queue_length")?,
            newest_msg_age_sec: row.try_get("newest_msg_age_sec").ok(),
            oldest_msg_age_sec: row.try_get("oldest_msg_age_sec").ok(),
            total_messages: row.try_get("total_messages").unwrap_or(0),
        })
    }

    pub async fn health_check(&self) -> Result<bool> {
        let row = sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        let _: i32 = row.try_get(0)?;
        Ok(true)
    }

    pub async fn get_client_status(&self) -> Result<ClientStatus> {
        let connected = self.health_check().await.unwrap_or(false);
        Ok(ClientStatus {
            connected,
            client_type: "pgmq-unified".to_string(),
            notify_enabled: self.config.enable_triggers,
        })
    }

    /// `extract_namespace("orders_queue") == Some("orders")`. Mirrors the
    /// namespace convention worker queues are created under
    /// (`worker_{namespace}_queue`).
    pub fn extract_namespace(&self, queue_name: &str) -> Option<String> {
        namespace_pattern()
            .captures(queue_name)
            .map(|c| c["namespace"].to_string())
    }

    pub async fn initialize_namespace_queues(&self, namespaces: &[&str]) -> Result<()> {
        for ns in namespaces {
            let queue = format!("worker_{ns}_queue");
            self.create_queue(&queue).await?;
        }
        Ok(())
    }

    pub async fn process_namespace_queue(
        &self,
        namespace: &str,
        vt_seconds: Option<i32>,
        limit: i32,
    ) -> Result<Vec<PgmqMessage<Value>>> {
        let queue = format!("worker_{namespace}_queue");
        self.read_messages(&queue, vt_seconds, Some(limit)).await
    }

    pub async fn complete_message(&self, namespace: &str, msg_id: i64) -> Result<bool> {
        let queue = format!("worker_{namespace}_queue");
        self.delete_message(&queue, msg_id).await
    }

    /// Announce a newly-sent message on both the namespace-scoped and the
    /// global `pgmq_message_ready` channels, if the client is configured for
    /// push notifications. Failures here are logged, never surfaced: a
    /// missed NOTIFY degrades to polling, it does not lose the message (it
    /// is still durably in the queue).
    async fn notify_message_ready(&self, queue: &str, msg_id: i64) {
        if !self.config.enable_triggers {
            return;
        }
        let namespace = self
            .extract_namespace(queue)
            .unwrap_or_else(|| queue.to_string());
        let event = PgmqNotifyEvent::MessageReady(MessageReadyEvent::new(
            msg_id,
            queue.to_string(),
            namespace.clone(),
        ));
        self.pg_notify("pgmq_message_ready", &event).await;
        self.pg_notify(&format!("pgmq_message_ready.{namespace}"), &event)
            .await;
    }

    async fn notify_queue_created(&self, queue: &str) {
        if !self.config.enable_triggers {
            return;
        }
        let namespace = self
            .extract_namespace(queue)
            .unwrap_or_else(|| queue.to_string());
        let event = PgmqNotifyEvent::QueueCreated(QueueCreatedEvent::new(
            queue.to_string(),
            namespace,
        ));
        self.pg_notify("pgmq_queue_created", &event).await;
    }

    async fn pg_notify(&self, channel: &str, event: &PgmqNotifyEvent) {
        let Ok(payload) = serde_json::to_string(event) else {
            return;
        };
        if let Err(error) = sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(&payload)
            .execute(&self.pool)
            .await
        {
            tracing::warn!(channel, %error, "failed to publish pgmq notify event");
        }
    }
}

/// Convenience constructors for [`PgmqClient`], mirroring the way workers
/// bootstrap a client from a pool they already hold (rather than owning the
/// pool themselves).
#[derive(Debug)]
pub struct PgmqNotifyClientFactory;

impl PgmqNotifyClientFactory {
    pub async fn create_with_pool(pool: PgPool) -> PgmqClient {
        PgmqClient::new_with_pool(pool).await
    }

    pub async fn create_with_pool_and_config(pool: PgPool, config: PgmqNotifyConfig) -> PgmqClient {
        PgmqClient::new_with_pool_and_config(pool, config).await
    }
}
