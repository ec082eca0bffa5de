//! Result records appended to the results channel after a task is processed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::Task;

/// Outcome of processing a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    Failed,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// One processing outcome for one task, written by one worker.
///
/// Duplicates for the same `task_id` are possible under at-least-once
/// delivery; consumers of the results channel deduplicate by `task_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub worker_id: String,
    pub status: ResultStatus,
    pub duration_seconds: f64,
    pub payload: Map<String, Value>,
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn completed(
        task: &Task,
        worker_id: &str,
        duration_seconds: f64,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            task_id: task.id.clone(),
            worker_id: worker_id.to_string(),
            status: ResultStatus::Completed,
            duration_seconds,
            payload,
            completed_at: Utc::now(),
        }
    }

    /// Failed result; the error message is stored under `payload.error`.
    pub fn failed(task: &Task, worker_id: &str, duration_seconds: f64, error: &str) -> Self {
        let mut payload = Map::new();
        payload.insert("error".to_string(), Value::String(error.to_string()));
        Self {
            task_id: task.id.clone(),
            worker_id: worker_id.to_string(),
            status: ResultStatus::Failed,
            duration_seconds,
            payload,
            completed_at: Utc::now(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ResultStatus::Completed
    }

    /// Error message of a failed result.
    pub fn error(&self) -> Option<&str> {
        self.payload.get("error").and_then(Value::as_str)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::partition;

    #[test]
    fn test_failed_result_carries_error() {
        let task = partition(10, 10).unwrap().remove(0);
        let result = TaskResult::failed(&task, "w1", 0.5, "boom");
        assert_eq!(result.status, ResultStatus::Failed);
        assert_eq!(result.error(), Some("boom"));
        assert!(!result.is_completed());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let task = partition(10, 10).unwrap().remove(0);
        let result = TaskResult::completed(&task, "w1", 0.1, Map::new());
        let json = result.to_json().unwrap();
        assert!(json.contains("\"status\":\"completed\""));
        assert_eq!(ResultStatus::Failed.as_str(), "failed");
    }
}
