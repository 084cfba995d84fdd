//! Thin async wrapper over the `pgmq` Postgres extension's SQL functions,
//! with an application-level NOTIFY convention layered on top so callers can
//! get push notifications for new messages instead of polling.
//!
//! This crate does not assume any particular database migration state beyond
//! the `pgmq` extension being installed; queue creation goes through
//! `pgmq.create`/`pgmq.drop_queue` rather than hand-rolled DDL.

mod client;
mod config;
mod error;
mod events;
pub mod listener;

pub use client::{ClientStatus, PgmqClient, PgmqMessage, PgmqNotifyClientFactory, QueueMetrics};
pub use config::PgmqNotifyConfig;
pub use error::PgmqError;
pub use events::{MessageReadyEvent, PgmqNotifyEvent, QueueCreatedEvent};
pub use listener::{PgmqEventHandler, PgmqNotifyError, PgmqNotifyListener, ListenerStats};

pub type Result<T> = std::result::Result<T, PgmqError>;
