//! Worker command.

use std::sync::Arc;

use console::style;
use tokio::sync::{mpsc, watch};

use taskfleet::config::Settings;
use taskfleet::queue::{self, FailureOutcome, SeedOutcome};
use taskfleet::worker::{ExitReason, RangeProcessor, Worker, WorkerConfig, WorkerEvent};

/// Run a single worker until it goes idle or is interrupted.
pub async fn cmd_work(settings: &Settings) -> anyhow::Result<()> {
    settings.validate().map_err(|e| anyhow::anyhow!(e))?;

    let config = WorkerConfig::from_settings(settings);
    eprintln!(
        "{} Worker {} on {} backend, run {}",
        style("→").cyan(),
        style(&config.worker_id).bold(),
        settings.backend,
        style(&settings.run_id).bold()
    );

    let queue = queue::connect(settings).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let (event_tx, event_rx) = mpsc::channel(256);
    let printer = tokio::spawn(print_events(event_rx));

    let worker = Worker::new(queue, Arc::new(RangeProcessor::default()), config)
        .with_events(event_tx)
        .with_shutdown(shutdown_rx);
    let result = worker.run().await;
    let _ = printer.await;

    let report = result?;
    let reason = match report.exit {
        ExitReason::IdleTimeout => "queue drained",
        ExitReason::Cancelled => "interrupted",
    };
    eprintln!(
        "{} Worker stopped ({}): {} processed, {} recovered, {} failed, {} discarded",
        style("✓").green(),
        reason,
        style(report.processed).bold(),
        report.recovered,
        report.failed,
        report.discarded
    );
    Ok(())
}

async fn print_events(mut rx: mpsc::Receiver<WorkerEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            WorkerEvent::Initialized {
                outcome: SeedOutcome::Seeded(count),
            } => eprintln!("  {} Seeded {} tasks", style("+").green(), count),
            WorkerEvent::TaskRecovered { task_id, attempt } => eprintln!(
                "  {} Recovered task {} (attempt {})",
                style("↺").yellow(),
                task_id,
                attempt
            ),
            WorkerEvent::TaskFailed {
                task_id,
                error,
                outcome: FailureOutcome::DeadLettered { attempt },
            } => eprintln!(
                "  {} Task {} dead-lettered after {} attempts: {}",
                style("✗").red(),
                task_id,
                attempt,
                error
            ),
            WorkerEvent::TaskDiscarded { entry, reason } => eprintln!(
                "  {} Discarded malformed entry {}: {}",
                style("!").yellow(),
                entry,
                reason
            ),
            _ => {}
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received, finishing current task");
}
