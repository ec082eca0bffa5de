//! In-memory task queue for single-process operation.
//!
//! Behaves like a stream consumer group by default: deliveries sit in a
//! pending list until acknowledged and are taken over by `reclaim_stale` once
//! idle long enough. With a retry policy it behaves like the broker backend
//! instead: failed tasks go through a delayed retry list or the dead-letter
//! list, and `disconnect` returns a consumer's unacked deliveries to the queue.
//! State is not persisted across restarts.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use super::{
    Delivery, DeliveryHandle, FailureOutcome, QueueError, QueueStats, RetryPolicy, RetryRoute,
    SeedOutcome, TaskQueue,
};
use crate::config::Backend;
use crate::models::{Task, TaskResult};

/// A queued task payload. Kept as raw bytes so parse failures surface on
/// delivery, as they would with a real broker.
#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    payload: Vec<u8>,
    /// Times handed to a consumer.
    deliveries: u32,
    /// Times rejected and rescheduled (broker semantics only).
    retries: u32,
}

impl Entry {
    fn handle(&self) -> DeliveryHandle {
        DeliveryHandle::StreamEntry(format!("{}-0", self.seq))
    }
}

#[derive(Debug)]
struct PendingEntry {
    entry: Entry,
    consumer: String,
    delivered_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    initialized: bool,
    next_seq: u64,
    ready: VecDeque<Entry>,
    pending: BTreeMap<u64, PendingEntry>,
    delayed: Vec<(Instant, Entry)>,
    results: Vec<TaskResult>,
    dead: Vec<Entry>,
}

impl QueueState {
    fn push(&mut self, payload: Vec<u8>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ready.push_back(Entry {
            seq,
            payload,
            deliveries: 0,
            retries: 0,
        });
    }

    /// Move due retries back onto the ready queue.
    fn promote_delayed(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, entry) = self.delayed.remove(i);
                self.ready.push_back(entry);
            } else {
                i += 1;
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(due, _)| *due).min()
    }
}

#[derive(Debug, Clone, Copy)]
enum Semantics {
    Stream,
    Broker(RetryPolicy),
}

/// Lock-based task queue shared between workers of one process.
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    semantics: Semantics,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    /// Queue with stream semantics (pending list, idle-based reclaim).
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            semantics: Semantics::Stream,
        }
    }

    /// Queue with broker semantics (retry queue, dead letters, no reclaim).
    pub fn with_retry_policy(policy: RetryPolicy) -> Self {
        Self {
            semantics: Semantics::Broker(policy),
            ..Self::new()
        }
    }

    /// Enqueue an arbitrary payload, bypassing task serialization.
    pub async fn enqueue_raw(&self, payload: Vec<u8>) {
        self.state.lock().await.push(payload);
        self.notify.notify_waiters();
    }

    /// All results published so far, in publication order.
    pub async fn results(&self) -> Vec<TaskResult> {
        self.state.lock().await.results.clone()
    }

    /// Tasks parked in the dead-letter list.
    pub async fn dead_letters(&self) -> Vec<Task> {
        self.state
            .lock()
            .await
            .dead
            .iter()
            .filter_map(|e| Task::from_json(&e.payload).ok())
            .collect()
    }

    /// Consumers currently holding unacknowledged deliveries.
    pub async fn pending_owners(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .await
            .pending
            .values()
            .map(|p| (p.entry.handle().to_string(), p.consumer.clone()))
            .collect()
    }

    /// Drop a consumer's connection: its unacked deliveries go back to the
    /// front of the queue. Only meaningful with broker semantics.
    pub async fn disconnect(&self, consumer_id: &str) -> usize {
        let mut state = self.state.lock().await;
        let seqs: Vec<u64> = state
            .pending
            .iter()
            .filter(|(_, p)| p.consumer == consumer_id)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in seqs.iter().rev() {
            if let Some(p) = state.pending.remove(seq) {
                state.ready.push_front(p.entry);
            }
        }
        drop(state);
        if !seqs.is_empty() {
            tracing::debug!(consumer_id, requeued = seqs.len(), "Consumer disconnected");
            self.notify.notify_waiters();
        }
        seqs.len()
    }

    fn attempt(&self, entry: &Entry) -> u32 {
        match self.semantics {
            Semantics::Stream => entry.deliveries,
            Semantics::Broker(_) => entry.retries.saturating_add(1),
        }
    }

    /// Pop the next ready entry and register it as pending for `consumer_id`.
    fn deliver_next(
        &self,
        state: &mut QueueState,
        consumer_id: &str,
    ) -> Option<Result<Delivery, QueueError>> {
        state.promote_delayed(Instant::now());
        // Broker prefetch is one unacknowledged message per consumer.
        if matches!(self.semantics, Semantics::Broker(_))
            && state.pending.values().any(|p| p.consumer == consumer_id)
        {
            return None;
        }
        let mut entry = state.ready.pop_front()?;
        entry.deliveries += 1;

        let task = match Task::from_json(&entry.payload) {
            Ok(task) => task,
            Err(e) => {
                // Never enters the pending list, so it cannot loop.
                tracing::warn!(entry = entry.seq, error = %e, "Discarding malformed task");
                return Some(Err(QueueError::malformed(entry.handle().to_string(), e)));
            }
        };

        let delivery = Delivery::new(task, entry.handle(), self.attempt(&entry));
        state.pending.insert(
            entry.seq,
            PendingEntry {
                entry,
                consumer: consumer_id.to_string(),
                delivered_at: Instant::now(),
            },
        );
        Some(Ok(delivery))
    }
}

fn entry_seq(handle: &DeliveryHandle) -> Result<u64, QueueError> {
    match handle {
        DeliveryHandle::StreamEntry(id) => id
            .split('-')
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| QueueError::InvalidHandle(handle.to_string())),
        DeliveryHandle::DeliveryTag(_) => Err(QueueError::InvalidHandle(handle.to_string())),
    }
}

#[async_trait]
impl TaskQueue for InMemoryQueue {
    fn backend(&self) -> Backend {
        Backend::Memory
    }

    async fn seed(&self, tasks: &[Task]) -> Result<SeedOutcome, QueueError> {
        let mut state = self.state.lock().await;
        if state.initialized {
            return Ok(SeedOutcome::AlreadyInitialized);
        }
        state.initialized = true;
        for task in tasks {
            state.push(task.to_json()?.into_bytes());
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(SeedOutcome::Seeded(tasks.len()))
    }

    async fn enqueue(&self, tasks: &[Task]) -> Result<usize, QueueError> {
        let payloads = tasks
            .iter()
            .map(|t| t.to_json().map(String::into_bytes))
            .collect::<Result<Vec<_>, _>>()?;
        let mut state = self.state.lock().await;
        for payload in payloads {
            state.push(payload);
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(tasks.len())
    }

    async fn claim_next(
        &self,
        consumer_id: &str,
        block_timeout: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + block_timeout;
        loop {
            // Registered before checking state so a concurrent enqueue can't be missed.
            let notified = self.notify.notified();
            let wake_at = {
                let mut state = self.state.lock().await;
                if let Some(delivery) = self.deliver_next(&mut state, consumer_id) {
                    return delivery.map(Some);
                }
                state.next_due().map_or(deadline, |due| due.min(deadline))
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout(wake_at.saturating_duration_since(now), notified).await;
        }
    }

    async fn acknowledge(&self, handle: &DeliveryHandle) -> Result<(), QueueError> {
        let seq = entry_seq(handle)?;
        self.state.lock().await.pending.remove(&seq);
        Ok(())
    }

    async fn fail(
        &self,
        delivery: &Delivery,
        result: &TaskResult,
    ) -> Result<FailureOutcome, QueueError> {
        let seq = entry_seq(&delivery.handle)?;
        let mut state = self.state.lock().await;

        let policy = match self.semantics {
            Semantics::Stream => {
                state.results.push(result.clone());
                state.pending.remove(&seq);
                return Ok(FailureOutcome::Recorded);
            }
            Semantics::Broker(policy) => policy,
        };

        let Some(pending) = state.pending.remove(&seq) else {
            return Err(QueueError::InvalidHandle(delivery.handle.to_string()));
        };
        let mut entry = pending.entry;
        match policy.route(entry.retries) {
            RetryRoute::Retry { retries } => {
                entry.retries = retries;
                state.delayed.push((Instant::now() + policy.delay, entry));
                Ok(FailureOutcome::Retried {
                    attempt: retries.saturating_add(1),
                    retry_in: policy.delay,
                })
            }
            RetryRoute::DeadLetter { retries } => {
                entry.retries = retries;
                state.dead.push(entry);
                tracing::error!(
                    task_id = %delivery.task.id,
                    retries,
                    error = result.error().unwrap_or_default(),
                    "Task dead-lettered after exhausting retries"
                );
                Ok(FailureOutcome::DeadLettered { attempt: retries })
            }
        }
    }

    async fn publish_result(&self, result: &TaskResult) -> Result<(), QueueError> {
        self.state.lock().await.results.push(result.clone());
        Ok(())
    }

    async fn reclaim_stale(
        &self,
        consumer_id: &str,
        min_idle: Duration,
        max_count: usize,
    ) -> Result<Vec<Delivery>, QueueError> {
        if let Semantics::Broker(_) = self.semantics {
            return Ok(Vec::new());
        }

        let mut state = self.state.lock().await;
        let now = Instant::now();
        let stale: Vec<u64> = state
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.delivered_at) >= min_idle)
            .map(|(seq, _)| *seq)
            .take(max_count)
            .collect();

        let mut reclaimed = Vec::with_capacity(stale.len());
        for seq in stale {
            let Some(mut pending) = state.pending.remove(&seq) else {
                continue;
            };
            match Task::from_json(&pending.entry.payload) {
                Ok(task) => {
                    tracing::debug!(
                        entry = seq,
                        from = %pending.consumer,
                        to = consumer_id,
                        "Reclaimed stale delivery"
                    );
                    pending.entry.deliveries += 1;
                    pending.consumer = consumer_id.to_string();
                    pending.delivered_at = now;
                    let delivery =
                        Delivery::new(task, pending.entry.handle(), pending.entry.deliveries)
                            .into_recovered();
                    state.pending.insert(seq, pending);
                    reclaimed.push(delivery);
                }
                Err(e) => {
                    tracing::warn!(entry = seq, error = %e, "Discarding malformed stale task");
                }
            }
        }
        Ok(reclaimed)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.state.lock().await;
        Ok(QueueStats {
            total: (state.ready.len() + state.pending.len() + state.delayed.len()) as u64,
            pending_unacked: state.pending.len() as u64,
            delivered: state.results.len() as u64,
            dead_lettered: state.dead.len() as u64,
        })
    }

    async fn close(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
