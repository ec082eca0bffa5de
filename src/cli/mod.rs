//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific modules.

mod config_cmd;
mod stats;
mod work;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use taskfleet::config::{load_settings_with_options, Backend, LoadOptions, Settings};

#[derive(Parser)]
#[command(name = "taskfleet")]
#[command(about = "Fault-tolerant distribution of chunked tasks over Redis Streams or RabbitMQ")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Run one worker until the queue stays empty or a shutdown signal arrives
    Work(WorkArgs),

    /// Print a snapshot of queue depth for the run
    Stats {
        #[command(flatten)]
        target: TargetArgs,
        /// Print as JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print the resolved settings as TOML
    Config {
        #[command(flatten)]
        target: TargetArgs,
    },
}

/// Which backend and run to talk to.
#[derive(Args, Debug, Default)]
struct TargetArgs {
    /// Queue backend: stream, broker or memory
    #[arg(short, long)]
    backend: Option<Backend>,

    /// Run namespace shared by all workers of one job
    #[arg(short, long)]
    run_id: Option<String>,

    /// Redis URL (stream backend)
    #[arg(long)]
    redis_url: Option<String>,

    /// AMQP URL (broker backend)
    #[arg(long)]
    broker_url: Option<String>,
}

impl TargetArgs {
    fn apply(self, settings: &mut Settings) {
        if let Some(backend) = self.backend {
            settings.backend = backend;
        }
        if let Some(run_id) = self.run_id {
            settings.run_id = run_id;
        }
        if self.redis_url.is_some() {
            settings.redis_url = self.redis_url;
        }
        if self.broker_url.is_some() {
            settings.broker_url = self.broker_url;
        }
    }
}

#[derive(Args, Debug, Default)]
struct WorkArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Worker ID (defaults to hostname-pid-random)
    #[arg(short, long)]
    worker_id: Option<String>,

    /// Total number of items to partition when seeding
    #[arg(long)]
    total_items: Option<u64>,

    /// Items per task
    #[arg(long)]
    chunk_size: Option<u64>,

    /// Exit after this many seconds without work
    #[arg(long)]
    idle_timeout: Option<f64>,

    /// Seconds between stale delivery checks
    #[arg(long)]
    stale_check_interval: Option<f64>,

    /// Minimum idle seconds before another worker's delivery is reclaimed
    #[arg(long)]
    stale_min_idle: Option<f64>,

    /// Failed attempts before a task is dead-lettered (broker backend)
    #[arg(long)]
    max_retry_attempts: Option<u32>,

    /// Seconds a failed task waits in the retry queue (broker backend)
    #[arg(long)]
    retry_delay: Option<f64>,

    /// Only consume; never seed the queue
    #[arg(long)]
    no_seed: bool,
}

impl WorkArgs {
    fn apply(self, settings: &mut Settings) {
        self.target.apply(settings);
        if self.worker_id.is_some() {
            settings.worker_id = self.worker_id;
        }
        if let Some(v) = self.total_items {
            settings.total_items = v;
        }
        if let Some(v) = self.chunk_size {
            settings.chunk_size = v;
        }
        if let Some(v) = self.idle_timeout {
            settings.idle_timeout_secs = v;
        }
        if let Some(v) = self.stale_check_interval {
            settings.stale_check_interval_secs = v;
        }
        if let Some(v) = self.stale_min_idle {
            settings.stale_min_idle_secs = v;
        }
        if let Some(v) = self.max_retry_attempts {
            settings.max_retry_attempts = v;
        }
        if let Some(v) = self.retry_delay {
            settings.retry_delay_secs = v;
        }
        if self.no_seed {
            settings.seed = false;
        }
    }
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = LoadOptions {
        config_path: cli.config,
    };
    let (mut settings, config) = load_settings_with_options(options).await;
    if let Some(path) = &config.source_path {
        tracing::debug!("Loaded config from {}", path.display());
    }

    match cli.command {
        Commands::Work(args) => {
            args.apply(&mut settings);
            work::cmd_work(&settings).await
        }
        Commands::Stats { target, json } => {
            target.apply(&mut settings);
            stats::cmd_stats(&settings, json).await
        }
        Commands::Config { target } => {
            target.apply(&mut settings);
            config_cmd::cmd_config_show(&settings, config.source_path.as_deref())
        }
    }
}
