//! Redis Streams task queue for distributed multi-process workers.
//!
//! Tasks are stream entries read through a consumer group. Redis tracks every
//! delivered-but-unacknowledged entry in the group's pending entries list, so
//! a crashed worker's tasks stay visible there until a peer reclaims them
//! with `XCLAIM`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingReply, StreamReadReply,
};

use super::{
    Delivery, DeliveryHandle, FailureOutcome, QueueError, QueueStats, SeedOutcome, TaskQueue,
};
use crate::config::Backend;
use crate::models::{ModelError, Task, TaskResult};

/// Stream field holding the task JSON.
const TASK_FIELD: &str = "task";
/// Stream field holding the result JSON.
const RESULT_FIELD: &str = "result";
/// Tasks per `XADD` pipeline round trip.
const ENQUEUE_BATCH: usize = 500;

/// Create the consumer group and add every task atomically.
/// Returns the number of tasks added, or -1 if the group already existed.
const SEED_SCRIPT: &str = r#"
local created = redis.pcall('XGROUP', 'CREATE', KEYS[1], ARGV[1], '0', 'MKSTREAM')
if type(created) == 'table' and created.err then
    if string.find(created.err, 'BUSYGROUP', 1, true) then
        return -1
    end
    return redis.error_reply(created.err)
end
for i = 3, #ARGV do
    redis.call('XADD', KEYS[1], '*', ARGV[2], ARGV[i])
end
return #ARGV - 2
"#;

fn is_missing_group(e: &redis::RedisError) -> bool {
    e.code() == Some("NOGROUP")
}

/// Keys used by one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamNames {
    pub tasks: String,
    pub group: String,
    pub results: String,
}

impl StreamNames {
    pub fn new(prefix: &str, run_id: &str) -> Self {
        Self {
            tasks: format!("{}:{}:tasks", prefix, run_id),
            group: format!("{}:{}:workers", prefix, run_id),
            results: format!("{}:{}:results", prefix, run_id),
        }
    }
}

/// Task queue over a Redis stream and consumer group.
pub struct RedisStreamQueue {
    conn: ConnectionManager,
    names: StreamNames,
}

impl RedisStreamQueue {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `names` - Stream and group keys for the run
    pub async fn connect(redis_url: &str, names: StreamNames) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::Config(format!("Invalid Redis URL: {}", e)))?;
        let conn = ConnectionManager::new(client).await?;
        tracing::debug!(tasks = %names.tasks, group = %names.group, "Connected to Redis");
        Ok(Self { conn, names })
    }

    pub fn names(&self) -> &StreamNames {
        &self.names
    }

    /// Acknowledge and drop an entry in one atomic round trip.
    async fn ack_entry(&self, entry_id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&self.names.tasks)
            .arg(&self.names.group)
            .arg(entry_id)
            .ignore()
            .cmd("XDEL")
            .arg(&self.names.tasks)
            .arg(entry_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Parse a stream entry into a delivery, discarding it if malformed.
    async fn to_delivery(&self, entry: &StreamId, attempt: u32) -> Result<Delivery, QueueError> {
        let parsed = match entry.get::<String>(TASK_FIELD) {
            Some(json) => Task::from_json(json.as_bytes()),
            None => Err(ModelError::MissingField(TASK_FIELD)),
        };

        match parsed {
            Ok(task) => Ok(Delivery::new(
                task,
                DeliveryHandle::StreamEntry(entry.id.clone()),
                attempt,
            )),
            Err(e) => {
                tracing::warn!(entry = %entry.id, error = %e, "Discarding malformed task");
                self.ack_entry(&entry.id).await?;
                Err(QueueError::malformed(entry.id.clone(), e))
            }
        }
    }
}

#[async_trait]
impl TaskQueue for RedisStreamQueue {
    fn backend(&self) -> Backend {
        Backend::Stream
    }

    async fn seed(&self, tasks: &[Task]) -> Result<SeedOutcome, QueueError> {
        let mut conn = self.conn.clone();
        let payloads = tasks
            .iter()
            .map(Task::to_json)
            .collect::<Result<Vec<_>, _>>()?;

        // Group creation and the task entries land in one script run, so no
        // peer can observe an initialized run with an empty stream.
        let seeded: i64 = redis::Script::new(SEED_SCRIPT)
            .key(&self.names.tasks)
            .arg(&self.names.group)
            .arg(TASK_FIELD)
            .arg(payloads)
            .invoke_async(&mut conn)
            .await?;

        match usize::try_from(seeded) {
            Ok(count) => Ok(SeedOutcome::Seeded(count)),
            Err(_) => Ok(SeedOutcome::AlreadyInitialized),
        }
    }

    async fn enqueue(&self, tasks: &[Task]) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        for batch in tasks.chunks(ENQUEUE_BATCH) {
            let mut pipe = redis::pipe();
            for task in batch {
                pipe.cmd("XADD")
                    .arg(&self.names.tasks)
                    .arg("*")
                    .arg(TASK_FIELD)
                    .arg(task.to_json()?)
                    .ignore();
            }
            pipe.query_async::<()>(&mut conn).await?;
        }
        Ok(tasks.len())
    }

    async fn claim_next(
        &self,
        consumer_id: &str,
        block_timeout: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn.clone();
        // BLOCK 0 would wait forever.
        let block_ms = block_timeout.as_millis().max(1) as u64;

        let reply: redis::RedisResult<Option<StreamReadReply>> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.names.group)
            .arg(consumer_id)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.names.tasks)
            .arg(">")
            .query_async(&mut conn)
            .await;

        let reply = match reply {
            Ok(reply) => reply,
            // Not seeded yet: wait like an empty read so the caller keeps polling.
            Err(e) if is_missing_group(&e) => {
                tracing::debug!(group = %self.names.group, "Consumer group not created yet");
                tokio::time::sleep(block_timeout).await;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let entry = reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .next();

        match entry {
            Some(entry) => self.to_delivery(&entry, 1).await.map(Some),
            None => Ok(None),
        }
    }

    async fn acknowledge(&self, handle: &DeliveryHandle) -> Result<(), QueueError> {
        match handle {
            DeliveryHandle::StreamEntry(id) => self.ack_entry(id).await,
            DeliveryHandle::DeliveryTag(_) => Err(QueueError::InvalidHandle(handle.to_string())),
        }
    }

    /// Failures are terminal here: record the failed result, then ack.
    async fn fail(
        &self,
        delivery: &Delivery,
        result: &TaskResult,
    ) -> Result<FailureOutcome, QueueError> {
        self.publish_result(result).await?;
        self.acknowledge(&delivery.handle).await?;
        Ok(FailureOutcome::Recorded)
    }

    async fn publish_result(&self, result: &TaskResult) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(&self.names.results)
            .arg("*")
            .arg(RESULT_FIELD)
            .arg(result.to_json()?)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn reclaim_stale(
        &self,
        consumer_id: &str,
        min_idle: Duration,
        max_count: usize,
    ) -> Result<Vec<Delivery>, QueueError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let min_idle_ms = min_idle.as_millis() as u64;

        let pending: redis::RedisResult<StreamPendingCountReply> = redis::cmd("XPENDING")
            .arg(&self.names.tasks)
            .arg(&self.names.group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(max_count)
            .query_async(&mut conn)
            .await;
        let pending = match pending {
            Ok(pending) => pending,
            Err(e) if is_missing_group(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        let previous: HashMap<String, (String, usize)> = pending
            .ids
            .into_iter()
            .map(|p| (p.id, (p.consumer, p.times_delivered)))
            .collect();
        let ids: Vec<&String> = previous.keys().collect();

        // XCLAIM re-checks the idle time, so a concurrent reclaimer that got
        // there first makes these entries drop out of our reply.
        let claimed: StreamClaimReply = redis::cmd("XCLAIM")
            .arg(&self.names.tasks)
            .arg(&self.names.group)
            .arg(consumer_id)
            .arg(min_idle_ms)
            .arg(ids)
            .query_async(&mut conn)
            .await?;

        let mut deliveries = Vec::with_capacity(claimed.ids.len());
        for entry in &claimed.ids {
            let (from, times) = previous
                .get(&entry.id)
                .map(|(c, t)| (c.as_str(), *t))
                .unwrap_or(("unknown", 0));
            let attempt = u32::try_from(times + 1).unwrap_or(u32::MAX);
            match self.to_delivery(entry, attempt).await {
                Ok(delivery) => {
                    tracing::debug!(entry = %entry.id, from, to = consumer_id, "Reclaimed stale entry");
                    deliveries.push(delivery.into_recovered());
                }
                Err(QueueError::MalformedTask { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(deliveries)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.conn.clone();

        let total: u64 = redis::cmd("XLEN")
            .arg(&self.names.tasks)
            .query_async(&mut conn)
            .await?;
        let delivered: u64 = redis::cmd("XLEN")
            .arg(&self.names.results)
            .query_async(&mut conn)
            .await?;

        let pending: redis::RedisResult<StreamPendingReply> = redis::cmd("XPENDING")
            .arg(&self.names.tasks)
            .arg(&self.names.group)
            .query_async(&mut conn)
            .await;
        let pending_unacked = match pending {
            Ok(reply) => reply.count() as u64,
            // Group not created yet: nothing can be pending.
            Err(e) if is_missing_group(&e) => 0,
            Err(e) => return Err(e.into()),
        };

        Ok(QueueStats {
            total,
            pending_unacked,
            delivered,
            dead_lettered: 0,
        })
    }

    async fn close(&self) -> Result<(), QueueError> {
        // The connection manager closes its socket when dropped.
        tracing::debug!(tasks = %self.names.tasks, "Closing Redis stream queue");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_names_are_scoped_to_run() {
        let names = StreamNames::new("taskfleet", "run42");
        assert_eq!(names.tasks, "taskfleet:run42:tasks");
        assert_eq!(names.group, "taskfleet:run42:workers");
        assert_eq!(names.results, "taskfleet:run42:results");
    }

    #[test]
    fn test_seed_script_creates_group_before_adding_entries() {
        let create = SEED_SCRIPT.find("'XGROUP', 'CREATE'").unwrap();
        let add = SEED_SCRIPT.find("'XADD'").unwrap();
        assert!(create < add);
        // An existing group returns early, before any XADD.
        let busy = SEED_SCRIPT.find("return -1").unwrap();
        assert!(busy < add);
    }
}
