//! Queue adapter abstraction for the claim/acknowledge/reclaim lifecycle.
//!
//! Workers talk to the broker only through [`TaskQueue`], so the same loop
//! runs over Redis Streams (consumer groups, idle-based reclaim) and RabbitMQ
//! (per-message acks, TTL retry queue, dead-letter queue). The backend is
//! selected once at startup via [`connect`].

mod error;
mod handle;
pub mod memory;
pub mod retry;

#[cfg(feature = "amqp-broker")]
pub mod amqp;
#[cfg(feature = "redis-backend")]
pub mod stream;

pub use error::QueueError;
pub use handle::{Delivery, DeliveryHandle};
pub use memory::InMemoryQueue;
pub use retry::{Backoff, RetryPolicy, RetryRoute};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{Backend, Settings};
use crate::models::{Task, TaskResult};

/// Best-effort snapshot of queue depth for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Tasks still held by the backend (waiting or in flight).
    pub total: u64,
    /// Tasks delivered to a consumer but not yet acknowledged.
    pub pending_unacked: u64,
    /// Results published so far.
    pub delivered: u64,
    /// Tasks parked in the dead-letter queue.
    pub dead_lettered: u64,
}

/// Outcome of the one-time queue initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    /// This worker created the topology and enqueued this many tasks.
    Seeded(usize),
    /// Another worker got there first.
    AlreadyInitialized,
}

/// What the backend did with a task whose processing failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Failed result recorded and the delivery acknowledged.
    Recorded,
    /// Rescheduled after `retry_in`; `attempt` is the next delivery attempt.
    Retried { attempt: u32, retry_in: Duration },
    /// Retries exhausted; parked for manual inspection.
    DeadLettered { attempt: u32 },
}

/// A shared task queue with at-least-once delivery.
///
/// Implementations guarantee that a task is held by at most one consumer at
/// a time; it only moves to another consumer after an explicit rejection or
/// a reclaim of an abandoned delivery.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Backend kind, for logging.
    fn backend(&self) -> Backend;

    /// Create the run's topology and enqueue `tasks`, unless another worker
    /// already did. The race is settled by the backend, not by the caller.
    async fn seed(&self, tasks: &[Task]) -> Result<SeedOutcome, QueueError>;

    /// Publish tasks. Returns how many were accepted by the broker.
    async fn enqueue(&self, tasks: &[Task]) -> Result<usize, QueueError>;

    /// Wait up to `block_timeout` for the next undelivered task.
    ///
    /// `Ok(None)` means the wait timed out.
    async fn claim_next(
        &self,
        consumer_id: &str,
        block_timeout: Duration,
    ) -> Result<Option<Delivery>, QueueError>;

    /// Mark a delivery as done.
    async fn acknowledge(&self, handle: &DeliveryHandle) -> Result<(), QueueError>;

    /// Settle a delivery whose processing failed, recording `result`.
    async fn fail(
        &self,
        delivery: &Delivery,
        result: &TaskResult,
    ) -> Result<FailureOutcome, QueueError>;

    /// Append a result to the results channel.
    async fn publish_result(&self, result: &TaskResult) -> Result<(), QueueError>;

    /// Take over up to `max_count` deliveries idle for at least `min_idle`.
    ///
    /// Backends whose broker requeues on disconnect return an empty list.
    async fn reclaim_stale(
        &self,
        consumer_id: &str,
        min_idle: Duration,
        max_count: usize,
    ) -> Result<Vec<Delivery>, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Release the connection. Unacknowledged deliveries stay recoverable.
    async fn close(&self) -> Result<(), QueueError>;
}

/// Boxed queue shared by the worker loop.
pub type BoxedTaskQueue = Arc<dyn TaskQueue>;

/// Open a connection to the configured backend.
pub async fn connect(settings: &Settings) -> Result<BoxedTaskQueue, QueueError> {
    match settings.backend {
        Backend::Memory => Ok(Arc::new(InMemoryQueue::new())),
        Backend::Stream => connect_stream(settings).await,
        Backend::Broker => connect_broker(settings).await,
    }
}

#[cfg(feature = "redis-backend")]
async fn connect_stream(settings: &Settings) -> Result<BoxedTaskQueue, QueueError> {
    let url = settings
        .redis_url
        .as_deref()
        .ok_or_else(|| QueueError::Config("stream backend requires redis_url".into()))?;
    let names = stream::StreamNames::new(&settings.key_prefix, &settings.run_id);
    Ok(Arc::new(stream::RedisStreamQueue::connect(url, names).await?))
}

#[cfg(not(feature = "redis-backend"))]
async fn connect_stream(_settings: &Settings) -> Result<BoxedTaskQueue, QueueError> {
    Err(QueueError::Config(
        "stream backend requires the 'redis-backend' feature".into(),
    ))
}

#[cfg(feature = "amqp-broker")]
async fn connect_broker(settings: &Settings) -> Result<BoxedTaskQueue, QueueError> {
    let url = settings
        .broker_url
        .as_deref()
        .ok_or_else(|| QueueError::Config("broker backend requires broker_url".into()))?;
    let names = amqp::QueueNames::new(&settings.key_prefix, &settings.run_id);
    let policy = RetryPolicy::new(settings.max_retry_attempts, settings.retry_delay());
    Ok(Arc::new(amqp::AmqpQueue::connect(url, names, policy).await?))
}

#[cfg(not(feature = "amqp-broker"))]
async fn connect_broker(_settings: &Settings) -> Result<BoxedTaskQueue, QueueError> {
    Err(QueueError::Config(
        "broker backend requires the 'amqp-broker' feature".into(),
    ))
}
