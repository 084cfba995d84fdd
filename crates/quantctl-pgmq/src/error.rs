use thiserror::Error;

/// Errors surfaced by the pgmq wrapper.
///
/// These map onto the `transient-io` error kind at the caller's boundary;
/// this crate does not itself decide retry policy.
#[derive(Debug, Error)]
pub enum PgmqError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("message serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queue name '{0}' is invalid: must match [a-z0-9_]+")]
    InvalidQueueName(String),

    #[error("notify channel error: {0}")]
    Notify(String),
}
