//! Progress events emitted by the worker loop.
//!
//! Callers that want live progress (the CLI, tests) pass an mpsc sender to
//! [`Worker::with_events`](super::Worker::with_events). Events are best-effort:
//! a closed or full channel never stalls the worker.

use std::time::Duration;

use crate::queue::{FailureOutcome, QueueStats, SeedOutcome};

use super::ExitReason;

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Started {
        worker_id: String,
    },
    Initialized {
        outcome: SeedOutcome,
    },
    TaskClaimed {
        task_id: String,
        attempt: u32,
        recovered: bool,
    },
    TaskCompleted {
        task_id: String,
        duration: Duration,
    },
    TaskFailed {
        task_id: String,
        error: String,
        outcome: FailureOutcome,
    },
    /// Taken over from a consumer that stopped acknowledging.
    TaskRecovered {
        task_id: String,
        attempt: u32,
    },
    /// Malformed payload dropped by the backend.
    TaskDiscarded {
        entry: String,
        reason: String,
    },
    IdleExit {
        idle: Duration,
    },
    Stopped {
        exit: ExitReason,
        stats: Option<QueueStats>,
    },
}
