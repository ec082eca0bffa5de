//! Queue adapter error types.

use thiserror::Error;

use crate::models::ModelError;

#[derive(Debug, Error)]
pub enum QueueError {
    /// Broker unreachable or connection dropped. Worth retrying.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    /// Broker reachable but rejected the operation.
    #[error("Backend error: {0}")]
    Backend(String),
    /// A delivered payload that could not be parsed. Already discarded.
    #[error("Malformed task {entry}: {reason}")]
    MalformedTask { entry: String, reason: String },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Delivery handle {0} does not belong to this backend")]
    InvalidHandle(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl QueueError {
    /// Whether the operation may succeed if retried after a delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }

    pub(crate) fn malformed(entry: impl Into<String>, err: ModelError) -> Self {
        QueueError::MalformedTask {
            entry: entry.into(),
            reason: err.to_string(),
        }
    }
}

#[cfg(feature = "redis-backend")]
impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
        {
            QueueError::Unavailable(e.to_string())
        } else {
            QueueError::Backend(e.to_string())
        }
    }
}

#[cfg(feature = "amqp-broker")]
impl From<lapin::Error> for QueueError {
    fn from(e: lapin::Error) -> Self {
        match e {
            lapin::Error::IOError(_)
            | lapin::Error::InvalidChannelState(_)
            | lapin::Error::InvalidConnectionState(_) => QueueError::Unavailable(e.to_string()),
            other => QueueError::Backend(other.to_string()),
        }
    }
}
