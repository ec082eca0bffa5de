//! Data models for taskfleet.

mod result;
mod task;

pub use result::{ResultStatus, TaskResult};
pub use task::{partition, Task};

use thiserror::Error;

/// Errors from building or parsing model records.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,
    #[error("missing field '{0}'")]
    MissingField(&'static str),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("task {id} has inconsistent range [{start}, {end}) with item_count {count}")]
    InconsistentRange {
        id: String,
        start: u64,
        end: u64,
        count: u64,
    },
}
