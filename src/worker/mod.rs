//! Worker loop: seed the run, consume tasks, recover abandoned ones, exit when idle.
//!
//! One worker is one sequential loop over a [`BoxedTaskQueue`]. Several
//! workers (in one process or many) share a queue; the backend guarantees a
//! task is held by at most one of them at a time.

mod events;
mod processor;

pub use events::WorkerEvent;
pub use processor::{ProcessError, Processor, RangeProcessor};

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::config::Settings;
use crate::models::{partition, ModelError, TaskResult};
use crate::queue::{
    Backoff, BoxedTaskQueue, Delivery, FailureOutcome, QueueError, QueueStats, SeedOutcome,
};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("{operation} failed: {source}")]
    Backend {
        operation: &'static str,
        source: QueueError,
    },
    #[error("Model error: {0}")]
    Model(#[from] ModelError),
}

impl WorkerError {
    fn backend(operation: &'static str) -> impl FnOnce(QueueError) -> Self {
        move |source| WorkerError::Backend { operation, source }
    }
}

/// Why the loop ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    IdleTimeout,
    Cancelled,
}

/// Loop phases, logged on transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Initializing,
    Consuming,
    IdleWait,
    Draining,
    Stopped,
}

/// Counters returned when a worker exits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub worker_id: String,
    /// Tasks completed and acknowledged, including recovered ones.
    pub processed: u64,
    /// Deliveries taken over from other consumers.
    pub recovered: u64,
    pub failed: u64,
    /// Malformed payloads dropped.
    pub discarded: u64,
    pub exit: ExitReason,
}

/// `{hostname}-{pid}-{8 random hex chars}`.
pub fn default_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "worker".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host, std::process::id(), &suffix[..8])
}

/// Loop tuning, usually built from [`Settings`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Partition and seed the run before consuming.
    pub seed: bool,
    pub total_items: u64,
    pub chunk_size: u64,
    pub idle_timeout: Duration,
    pub stale_check_interval: Duration,
    pub stale_min_idle: Duration,
    pub stale_max_count: usize,
    pub block_timeout: Duration,
    pub backoff: Backoff,
}

impl WorkerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            worker_id: settings
                .worker_id
                .clone()
                .unwrap_or_else(default_worker_id),
            seed: settings.seed,
            total_items: settings.total_items,
            chunk_size: settings.chunk_size,
            idle_timeout: settings.idle_timeout(),
            stale_check_interval: settings.stale_check_interval(),
            stale_min_idle: settings.stale_min_idle(),
            stale_max_count: settings.stale_max_count,
            block_timeout: settings.block_timeout(),
            backoff: Backoff {
                attempts: settings.backend_retry_attempts,
                base_ms: settings.backend_retry_base_ms,
            },
        }
    }
}

pub struct Worker {
    queue: BoxedTaskQueue,
    processor: Arc<dyn Processor>,
    config: WorkerConfig,
    events: Option<mpsc::Sender<WorkerEvent>>,
    shutdown: Option<watch::Receiver<bool>>,
    state: WorkerState,
}

impl Worker {
    pub fn new(queue: BoxedTaskQueue, processor: Arc<dyn Processor>, config: WorkerConfig) -> Self {
        Self {
            queue,
            processor,
            config,
            events: None,
            shutdown: None,
            state: WorkerState::Initializing,
        }
    }

    pub fn with_events(mut self, events: mpsc::Sender<WorkerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Stop after the task in hand once `true` is sent.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run until idle timeout or shutdown. The queue connection is closed on
    /// every exit path; unacknowledged deliveries stay recoverable.
    pub async fn run(mut self) -> Result<WorkerReport, WorkerError> {
        let mut report = WorkerReport {
            worker_id: self.config.worker_id.clone(),
            processed: 0,
            recovered: 0,
            failed: 0,
            discarded: 0,
            exit: ExitReason::IdleTimeout,
        };

        let outcome = self.run_loop(&mut report).await;
        self.transition(WorkerState::Stopped);

        let stats = match self.queue.stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::debug!(error = %e, "Could not read final queue stats");
                None
            }
        };
        if let Err(e) = self.queue.close().await {
            tracing::warn!(worker = %self.config.worker_id, error = %e, "Failed to close queue");
        }

        let exit = outcome?;
        report.exit = exit;
        log_final(&report, stats.as_ref());
        self.emit(WorkerEvent::Stopped { exit, stats });
        Ok(report)
    }

    async fn run_loop(&mut self, report: &mut WorkerReport) -> Result<ExitReason, WorkerError> {
        tracing::info!(
            worker = %self.config.worker_id,
            backend = %self.queue.backend(),
            "Worker starting"
        );
        self.emit(WorkerEvent::Started {
            worker_id: self.config.worker_id.clone(),
        });

        if self.config.seed {
            self.initialize().await?;
        }

        self.transition(WorkerState::Consuming);
        let mut idle = Duration::ZERO;
        let mut last_stale_check: Option<Instant> = None;

        loop {
            if self.shutdown_requested() {
                self.transition(WorkerState::Draining);
                return Ok(ExitReason::Cancelled);
            }

            let stale_due = last_stale_check
                .map_or(true, |at| at.elapsed() >= self.config.stale_check_interval);
            if stale_due {
                last_stale_check = Some(Instant::now());
                let recovered = self.reclaim().await?;
                if !recovered.is_empty() {
                    idle = Duration::ZERO;
                    self.transition(WorkerState::Consuming);
                    for delivery in recovered {
                        if self.shutdown_requested() {
                            self.transition(WorkerState::Draining);
                            return Ok(ExitReason::Cancelled);
                        }
                        self.handle(delivery, report).await?;
                    }
                    continue;
                }
            }

            let waited = Instant::now();
            let claimed = self
                .config
                .backoff
                .run("claim_next", || {
                    self.queue
                        .claim_next(&self.config.worker_id, self.config.block_timeout)
                })
                .await;

            match claimed {
                Ok(Some(delivery)) => {
                    idle = Duration::ZERO;
                    self.transition(WorkerState::Consuming);
                    self.handle(delivery, report).await?;
                }
                Ok(None) => {
                    idle += waited.elapsed();
                    self.transition(WorkerState::IdleWait);
                    if idle >= self.config.idle_timeout {
                        tracing::info!(
                            worker = %self.config.worker_id,
                            idle_secs = idle.as_secs_f64(),
                            "No work left, exiting"
                        );
                        self.emit(WorkerEvent::IdleExit { idle });
                        return Ok(ExitReason::IdleTimeout);
                    }
                }
                Err(QueueError::MalformedTask { entry, reason }) => {
                    idle = Duration::ZERO;
                    report.discarded += 1;
                    tracing::warn!(worker = %self.config.worker_id, %entry, %reason, "Discarded malformed task");
                    self.emit(WorkerEvent::TaskDiscarded { entry, reason });
                }
                Err(e) => return Err(WorkerError::backend("claim_next")(e)),
            }
        }
    }

    async fn initialize(&mut self) -> Result<(), WorkerError> {
        let tasks = partition(self.config.total_items, self.config.chunk_size)?;
        let outcome = self
            .config
            .backoff
            .run("seed", || self.queue.seed(&tasks))
            .await
            .map_err(WorkerError::backend("seed"))?;

        match outcome {
            SeedOutcome::Seeded(count) => {
                tracing::info!(worker = %self.config.worker_id, tasks = count, "Seeded task queue")
            }
            SeedOutcome::AlreadyInitialized => {
                tracing::info!(worker = %self.config.worker_id, "Task queue already initialized")
            }
        }
        self.emit(WorkerEvent::Initialized { outcome });
        Ok(())
    }

    async fn reclaim(&self) -> Result<Vec<Delivery>, WorkerError> {
        let recovered = self
            .config
            .backoff
            .run("reclaim_stale", || {
                self.queue.reclaim_stale(
                    &self.config.worker_id,
                    self.config.stale_min_idle,
                    self.config.stale_max_count,
                )
            })
            .await
            .map_err(WorkerError::backend("reclaim_stale"))?;

        if !recovered.is_empty() {
            tracing::info!(
                worker = %self.config.worker_id,
                count = recovered.len(),
                "Recovered stale tasks"
            );
        }
        Ok(recovered)
    }

    /// Process one delivery and settle it with the backend.
    async fn handle(
        &self,
        delivery: Delivery,
        report: &mut WorkerReport,
    ) -> Result<(), WorkerError> {
        let task_id = delivery.task.id.clone();
        tracing::debug!(
            worker = %self.config.worker_id,
            task = %task_id,
            attempt = delivery.attempt,
            handle = %delivery.handle,
            "Claimed task"
        );
        self.emit(WorkerEvent::TaskClaimed {
            task_id: task_id.clone(),
            attempt: delivery.attempt,
            recovered: delivery.recovered,
        });
        if delivery.recovered {
            report.recovered += 1;
            self.emit(WorkerEvent::TaskRecovered {
                task_id: task_id.clone(),
                attempt: delivery.attempt,
            });
        }

        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.processor.process(&delivery.task))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ProcessError::Panicked(panic_message(panic.as_ref()))));
        let duration = started.elapsed();

        match outcome {
            Ok(payload) => {
                let result = TaskResult::completed(
                    &delivery.task,
                    &self.config.worker_id,
                    duration.as_secs_f64(),
                    payload,
                );
                // Result first: a crash between the two calls yields a
                // duplicate result, never a lost one.
                self.config
                    .backoff
                    .run("publish_result", || self.queue.publish_result(&result))
                    .await
                    .map_err(WorkerError::backend("publish_result"))?;
                self.config
                    .backoff
                    .run("acknowledge", || self.queue.acknowledge(&delivery.handle))
                    .await
                    .map_err(WorkerError::backend("acknowledge"))?;

                report.processed += 1;
                tracing::debug!(
                    worker = %self.config.worker_id,
                    task = %task_id,
                    duration_ms = duration.as_millis() as u64,
                    "Completed task"
                );
                self.emit(WorkerEvent::TaskCompleted { task_id, duration });
            }
            Err(e) => {
                let error = e.to_string();
                let result = TaskResult::failed(
                    &delivery.task,
                    &self.config.worker_id,
                    duration.as_secs_f64(),
                    &error,
                );
                let failure = self
                    .config
                    .backoff
                    .run("fail", || self.queue.fail(&delivery, &result))
                    .await
                    .map_err(WorkerError::backend("fail"))?;

                report.failed += 1;
                match failure {
                    FailureOutcome::Recorded => {
                        tracing::warn!(worker = %self.config.worker_id, task = %task_id, %error, "Task failed")
                    }
                    FailureOutcome::Retried { attempt, retry_in } => tracing::warn!(
                        worker = %self.config.worker_id,
                        task = %task_id,
                        %error,
                        next_attempt = attempt,
                        retry_in_secs = retry_in.as_secs_f64(),
                        "Task failed, scheduled for retry"
                    ),
                    FailureOutcome::DeadLettered { attempt } => tracing::error!(
                        worker = %self.config.worker_id,
                        task = %task_id,
                        %error,
                        attempts = attempt,
                        "Task failed permanently, moved to dead-letter queue"
                    ),
                }
                self.emit(WorkerEvent::TaskFailed {
                    task_id,
                    error,
                    outcome: failure,
                });
            }
        }
        Ok(())
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    fn transition(&mut self, next: WorkerState) {
        if self.state != next {
            tracing::trace!(worker = %self.config.worker_id, from = ?self.state, to = ?next, "State change");
            self.state = next;
        }
    }

    fn emit(&self, event: WorkerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.try_send(event);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn log_final(report: &WorkerReport, stats: Option<&QueueStats>) {
    tracing::info!(
        worker = %report.worker_id,
        exit = ?report.exit,
        processed = report.processed,
        recovered = report.recovered,
        failed = report.failed,
        discarded = report.discarded,
        "Worker stopped"
    );
    if let Some(stats) = stats {
        tracing::info!(
            total = stats.total,
            pending = stats.pending_unacked,
            results = stats.delivered,
            dead = stats.dead_lettered,
            "Queue snapshot at exit"
        );
    }
}
