//! Task model: one contiguous range of items to process.
//!
//! Tasks are produced once per run by partitioning `[0, total_items)` into
//! fixed-size chunks and are immutable from then on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ModelError;

/// Minimum width of zero-padded task IDs.
const MIN_ID_WIDTH: usize = 6;

/// A bounded unit of work covering items `[range_start, range_end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Zero-padded sequence number, unique within a run.
    pub id: String,
    pub range_start: u64,
    pub range_end: u64,
    pub item_count: u64,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create the task for chunk `index` of width `chunk_size`.
    fn chunk(index: u64, chunk_size: u64, total_items: u64, width: usize, now: DateTime<Utc>) -> Self {
        let range_start = index * chunk_size;
        let range_end = (range_start + chunk_size).min(total_items);
        Self {
            id: format!("{:0width$}", index, width = width),
            range_start,
            range_end,
            item_count: range_end - range_start,
            created_at: now,
        }
    }

    /// Iterate over the item indices covered by this task.
    pub fn items(&self) -> std::ops::Range<u64> {
        self.range_start..self.range_end
    }

    /// Serialize to the JSON layout stored inside the broker.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse a task from broker payload bytes, checking range consistency.
    pub fn from_json(data: &[u8]) -> Result<Self, ModelError> {
        let task: Task = serde_json::from_slice(data)?;
        if task.range_end < task.range_start
            || task.range_end - task.range_start != task.item_count
        {
            return Err(ModelError::InconsistentRange {
                id: task.id,
                start: task.range_start,
                end: task.range_end,
                count: task.item_count,
            });
        }
        Ok(task)
    }
}

/// Split `[0, total_items)` into consecutive tasks of `chunk_size` items.
///
/// Chunk `k` always covers `[k*chunk_size, min((k+1)*chunk_size, total_items))`.
pub fn partition(total_items: u64, chunk_size: u64) -> Result<Vec<Task>, ModelError> {
    if chunk_size == 0 {
        return Err(ModelError::ZeroChunkSize);
    }

    let count = total_items.div_ceil(chunk_size);
    let width = count.to_string().len().max(MIN_ID_WIDTH);
    let now = Utc::now();

    Ok((0..count)
        .map(|k| Task::chunk(k, chunk_size, total_items, width, now))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_covers_range_contiguously() {
        let tasks = partition(1000, 10).unwrap();
        assert_eq!(tasks.len(), 100);

        let mut expected_start = 0;
        for task in &tasks {
            assert_eq!(task.range_start, expected_start);
            assert_eq!(task.item_count, 10);
            expected_start = task.range_end;
        }
        assert_eq!(expected_start, 1000);
    }

    #[test]
    fn test_partition_short_last_chunk() {
        let tasks = partition(25, 10).unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[2].range_start, 20);
        assert_eq!(tasks[2].range_end, 25);
        assert_eq!(tasks[2].item_count, 5);
    }

    #[test]
    fn test_partition_ids_are_unique_and_padded() {
        let tasks = partition(1000, 10).unwrap();
        assert_eq!(tasks[0].id, "000000");
        assert_eq!(tasks[99].id, "000099");

        let ids: std::collections::HashSet<_> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids.len(), tasks.len());
    }

    #[test]
    fn test_partition_is_deterministic() {
        let a = partition(97, 8).unwrap();
        let b = partition(97, 8).unwrap();
        let ranges = |tasks: &[Task]| {
            tasks
                .iter()
                .map(|t| (t.id.clone(), t.range_start, t.range_end))
                .collect::<Vec<_>>()
        };
        assert_eq!(ranges(&a), ranges(&b));
    }

    #[test]
    fn test_partition_empty_and_invalid() {
        assert!(partition(0, 10).unwrap().is_empty());
        assert!(matches!(partition(10, 0), Err(ModelError::ZeroChunkSize)));
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            Task::from_json(b"not json"),
            Err(ModelError::Json(_))
        ));
    }

    #[test]
    fn test_from_json_rejects_inconsistent_range() {
        let mut task = partition(10, 10).unwrap().remove(0);
        task.item_count = 3;
        let json = task.to_json().unwrap();
        assert!(matches!(
            Task::from_json(json.as_bytes()),
            Err(ModelError::InconsistentRange { .. })
        ));
    }
}
