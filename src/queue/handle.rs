//! Delivery handle: binds one in-flight delivery of a task to one consumer.

use std::fmt;

use crate::models::Task;

/// Opaque backend token used to acknowledge or reject a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeliveryHandle {
    /// Stream entry ID (`1700000000000-0`). Survives ownership changes.
    StreamEntry(String),
    /// AMQP delivery tag. Only valid on the channel that received it.
    DeliveryTag(u64),
}

impl fmt::Display for DeliveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryHandle::StreamEntry(id) => write!(f, "entry:{}", id),
            DeliveryHandle::DeliveryTag(tag) => write!(f, "tag:{}", tag),
        }
    }
}

/// A task handed to a consumer, plus the token needed to settle it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub task: Task,
    pub handle: DeliveryHandle,
    /// 1-based delivery attempt for this task.
    pub attempt: u32,
    /// Obtained through `reclaim_stale` rather than a fresh claim.
    pub recovered: bool,
}

impl Delivery {
    pub fn new(task: Task, handle: DeliveryHandle, attempt: u32) -> Self {
        Self {
            task,
            handle,
            attempt: attempt.max(1),
            recovered: false,
        }
    }

    pub(crate) fn into_recovered(mut self) -> Self {
        self.recovered = true;
        self
    }
}
