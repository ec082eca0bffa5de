//! Compute boundary between the worker loop and task-specific work.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::models::Task;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("{0}")]
    Failed(String),
    #[error("processor panicked: {0}")]
    Panicked(String),
}

/// Turns a claimed task into a result payload.
///
/// Implementations must be safe to run more than once for the same task:
/// delivery is at-least-once, so a task reclaimed from a slow worker may be
/// processed twice.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, task: &Task) -> Result<Map<String, Value>, ProcessError>;
}

type ComputeFn = dyn Fn(u64) -> Result<f64, ProcessError> + Send + Sync;

/// Applies a per-item function over the task's range and summarizes it.
///
/// The payload is `{items, sum, min, max, mean}`.
#[derive(Clone)]
pub struct RangeProcessor {
    compute: Arc<ComputeFn>,
}

impl RangeProcessor {
    pub fn new<F>(compute: F) -> Self
    where
        F: Fn(u64) -> Result<f64, ProcessError> + Send + Sync + 'static,
    {
        Self {
            compute: Arc::new(compute),
        }
    }
}

impl Default for RangeProcessor {
    /// Square root of each item.
    fn default() -> Self {
        Self::new(|item| Ok((item as f64).sqrt()))
    }
}

impl std::fmt::Debug for RangeProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeProcessor").finish_non_exhaustive()
    }
}

#[async_trait]
impl Processor for RangeProcessor {
    async fn process(&self, task: &Task) -> Result<Map<String, Value>, ProcessError> {
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut items = 0u64;

        for item in task.items() {
            let value = (self.compute)(item)?;
            sum += value;
            min = min.min(value);
            max = max.max(value);
            items += 1;
        }

        let payload = if items == 0 {
            json!({ "items": 0, "sum": 0.0, "min": null, "max": null, "mean": null })
        } else {
            json!({
                "items": items,
                "sum": sum,
                "min": min,
                "max": max,
                "mean": sum / items as f64,
            })
        };

        match payload {
            Value::Object(map) => Ok(map),
            _ => Err(ProcessError::Failed("payload is not an object".into())),
        }
    }
}
