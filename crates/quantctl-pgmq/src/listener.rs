//! Push-notification listener built on `sqlx::postgres::PgListener`.
//!
//! Channel naming convention: `pgmq_queue_created` for queue creation, and
//! `pgmq_message_ready[.{namespace}]` for message arrival (the namespaced
//! variant lets a worker listen only to the namespace it serves; the
//! unsuffixed variant is a global firehose).

use async_trait::async_trait;
use futures::StreamExt;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::PgmqNotifyConfig;
use crate::events::PgmqNotifyEvent;

#[derive(Debug, Error)]
pub enum PgmqNotifyError {
    #[error("listener is not connected")]
    NotConnected,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid notify payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Snapshot of a listener's connection and traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub connected: bool,
    pub channels_listening: usize,
    pub events_received: u64,
    pub parse_errors: u64,
}

/// Callback-style alternative to polling [`PgmqNotifyListener::next_event`].
#[async_trait]
pub trait PgmqEventHandler: Send + Sync {
    async fn handle_event(&self, event: PgmqNotifyEvent) -> crate::Result<()>;
    async fn handle_parse_error(&self, channel: &str, payload: &str, error: PgmqNotifyError);
    async fn handle_connection_error(&self, error: PgmqNotifyError);
}

/// Owns a single `PgListener` connection and the set of channels it is
/// subscribed to.
///
/// `connect`/`disconnect` and channel subscription are independent of
/// whether the listener is actively streaming: `start_listening` (or
/// `start_listening_with_handler`) hands the underlying connection to a
/// background task, after which further `listen_channel` calls are not
/// supported (matching the one-shot nature of `PgListener::into_stream`).
pub struct PgmqNotifyListener {
    pool: PgPool,
    config: PgmqNotifyConfig,
    buffer_size: usize,
    listener: Option<PgListener>,
    channels: HashSet<String>,
    connected: Arc<AtomicBool>,
    events_received: Arc<AtomicU64>,
    parse_errors: Arc<AtomicU64>,
    event_rx: Option<mpsc::Receiver<PgmqNotifyEvent>>,
    background: Option<JoinHandle<()>>,
}

impl fmt::Debug for PgmqNotifyListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgmqNotifyListener")
            .field("channels", &self.channels)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .field("buffer_size", &self.buffer_size)
            .finish()
    }
}

impl PgmqNotifyListener {
    pub async fn new(
        pool: PgPool,
        config: PgmqNotifyConfig,
        buffer_size: usize,
    ) -> Result<Self, PgmqNotifyError> {
        Ok(Self {
            pool,
            config,
            buffer_size,
            listener: None,
            channels: HashSet::new(),
            connected: Arc::new(AtomicBool::new(false)),
            events_received: Arc::new(AtomicU64::new(0)),
            parse_errors: Arc::new(AtomicU64::new(0)),
            event_rx: None,
            background: None,
        })
    }

    pub fn config(&self) -> &PgmqNotifyConfig {
        &self.config
    }

    pub fn stats(&self) -> ListenerStats {
        ListenerStats {
            connected: self.connected.load(Ordering::Relaxed),
            channels_listening: self.channels.len(),
            events_received: self.events_received.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
        }
    }

    pub async fn is_healthy(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn listening_channels(&self) -> Vec<String> {
        self.channels.iter().cloned().collect()
    }

    /// Idempotent: connecting while already connected is a no-op.
    pub async fn connect(&mut self) -> Result<(), PgmqNotifyError> {
        if self.connected.load(Ordering::Relaxed) {
            return Ok(());
        }
        let listener = PgListener::connect_with(&self.pool).await?;
        self.listener = Some(listener);
        self.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    pub async fn disconnect(&mut self) -> Result<(), PgmqNotifyError> {
        if let Some(task) = self.background.take() {
            task.abort();
        }
        self.listener = None;
        self.event_rx = None;
        self.channels.clear();
        self.connected.store(false, Ordering::Relaxed);
        Ok(())
    }

    pub async fn listen_channel(&mut self, channel: &str) -> Result<(), PgmqNotifyError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(PgmqNotifyError::NotConnected);
        }
        if self.channels.contains(channel) {
            tracing::warn!(channel, "already listening on channel, ignoring duplicate listen");
            return Ok(());
        }
        let listener = self
            .listener
            .as_mut()
            .ok_or(PgmqNotifyError::NotConnected)?;
        listener.listen(channel).await?;
        self.channels.insert(channel.to_string());
        Ok(())
    }

    pub async fn unlisten_channel(&mut self, channel: &str) -> Result<(), PgmqNotifyError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(PgmqNotifyError::NotConnected);
        }
        let listener = self
            .listener
            .as_mut()
            .ok_or(PgmqNotifyError::NotConnected)?;
        listener.unlisten(channel).await?;
        self.channels.remove(channel);
        Ok(())
    }

    pub async fn listen_queue_created(&mut self) -> Result<(), PgmqNotifyError> {
        self.listen_channel("pgmq_queue_created").await
    }

    pub async fn listen_message_ready_for_namespace(
        &mut self,
        namespace: &str,
    ) -> Result<(), PgmqNotifyError> {
        self.listen_channel(&format!("pgmq_message_ready.{namespace}"))
            .await
    }

    pub async fn listen_message_ready_global(&mut self) -> Result<(), PgmqNotifyError> {
        self.listen_channel("pgmq_message_ready").await
    }

    pub async fn listen_default_namespaces(&mut self) -> Result<(), PgmqNotifyError> {
        let namespaces = self.config.default_namespaces.clone();
        for namespace in namespaces {
            self.listen_message_ready_for_namespace(&namespace).await?;
        }
        Ok(())
    }

    /// Hand the connection to a background task and begin decoding
    /// notifications into an internal channel drained by [`Self::next_event`].
    pub async fn start_listening(&mut self) -> Result<(), PgmqNotifyError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(PgmqNotifyError::NotConnected);
        }
        let listener = self
            .listener
            .take()
            .ok_or(PgmqNotifyError::NotConnected)?;
        let (tx, rx) = mpsc::channel(self.buffer_size.max(1));
        self.event_rx = Some(rx);

        let events_received = Arc::clone(&self.events_received);
        let parse_errors = Arc::clone(&self.parse_errors);
        let connected = Arc::clone(&self.connected);
        let handle = tokio::spawn(async move {
            let mut stream = listener.into_stream();
            while let Some(next) = stream.next().await {
                match next {
                    Ok(notification) => {
                        match serde_json::from_str::<PgmqNotifyEvent>(notification.payload()) {
                            Ok(event) => {
                                events_received.fetch_add(1, Ordering::Relaxed);
                                if tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(_) => {
                                parse_errors.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    Err(error) => {
                        tracing::warn!(%error, "pgmq listener stream error, stopping");
                        break;
                    }
                }
            }
            connected.store(false, Ordering::Relaxed);
        });
        self.background = Some(handle);
        Ok(())
    }

    pub async fn next_event(&mut self) -> Result<Option<PgmqNotifyEvent>, PgmqNotifyError> {
        let rx = self
            .event_rx
            .as_mut()
            .ok_or(PgmqNotifyError::NotConnected)?;
        Ok(rx.recv().await)
    }

    /// Like [`Self::start_listening`] but dispatches each event to `handler`
    /// instead of an internal queue. Returns the task handle so the caller
    /// can abort it directly.
    pub async fn start_listening_with_handler<H>(
        &mut self,
        handler: H,
    ) -> Result<JoinHandle<()>, PgmqNotifyError>
    where
        H: PgmqEventHandler + 'static,
    {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(PgmqNotifyError::NotConnected);
        }
        let listener = self
            .listener
            .take()
            .ok_or(PgmqNotifyError::NotConnected)?;
        let events_received = Arc::clone(&self.events_received);
        let parse_errors = Arc::clone(&self.parse_errors);
        let connected = Arc::clone(&self.connected);
        let handler = Arc::new(handler);
        let handle = tokio::spawn(async move {
            let mut stream = listener.into_stream();
            while let Some(next) = stream.next().await {
                match next {
                    Ok(notification) => {
                        let channel = notification.channel().to_string();
                        let payload = notification.payload().to_string();
                        match serde_json::from_str::<PgmqNotifyEvent>(&payload) {
                            Ok(event) => {
                                events_received.fetch_add(1, Ordering::Relaxed);
                                if let Err(error) = handler.handle_event(event).await {
                                    tracing::warn!(%error, "pgmq event handler returned an error");
                                }
                            }
                            Err(error) => {
                                parse_errors.fetch_add(1, Ordering::Relaxed);
                                handler
                                    .handle_parse_error(&channel, &payload, PgmqNotifyError::Json(error))
                                    .await;
                            }
                        }
                    }
                    Err(error) => {
                        handler
                            .handle_connection_error(PgmqNotifyError::Database(error))
                            .await;
                        break;
                    }
                }
            }
            connected.store(false, Ordering::Relaxed);
        });
        Ok(handle)
    }
}
