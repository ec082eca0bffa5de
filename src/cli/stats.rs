//! Queue stats command.

use console::style;

use taskfleet::config::{Backend, Settings};
use taskfleet::queue;

pub async fn cmd_stats(settings: &Settings, json: bool) -> anyhow::Result<()> {
    if settings.backend == Backend::Memory {
        anyhow::bail!("The memory backend lives inside a worker process and has no stats to read");
    }
    settings.validate().map_err(|e| anyhow::anyhow!(e))?;

    let queue = queue::connect(settings).await?;
    let stats = queue.stats().await;
    queue.close().await?;
    let stats = stats?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!(
        "{} {} backend, run {}",
        style("Queue").bold(),
        settings.backend,
        style(&settings.run_id).cyan()
    );
    println!("  {:<18} {}", "Outstanding:", stats.total);
    println!("  {:<18} {}", "Unacknowledged:", stats.pending_unacked);
    println!("  {:<18} {}", "Results:", style(stats.delivered).green());
    let dead = if stats.dead_lettered > 0 {
        style(stats.dead_lettered).red()
    } else {
        style(stats.dead_lettered).dim()
    };
    println!("  {:<18} {}", "Dead-lettered:", dead);

    Ok(())
}
