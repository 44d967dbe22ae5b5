//! Kiln service: build workers, cron scheduler, webhook delivery and
//! artifact curation in one process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kiln_core::{
    Creator, Curator, EventBus, FsStore, HookDispatcher, KilnConfig, KilnError, MemoryQueue,
    MultiDispatcher, QueueRegistry, Scheduler, Store, Submitter,
};
use kiln_runner::os::{self, OsDriver};
use kiln_runner::{DriverRegistry, Worker};
use kiln_state::fakes::MemoryState;
use kiln_state::{KilnStore, SurrealHandle};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

#[derive(Parser)]
#[command(name = "kilnd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Kiln CI service", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Builds run concurrently by the os worker
    #[arg(long, default_value = "4", env = "KILN_WORKERS")]
    workers: usize,

    /// Seconds between artifact curation passes
    #[arg(long, default_value = "3600", env = "KILN_CURATE_INTERVAL")]
    curate_interval: u64,

    /// Keep all state in memory (nothing survives a restart)
    #[arg(long)]
    memory: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = KilnConfig::from_env()
        .map_err(anyhow::Error::msg)
        .context("Invalid configuration")?;

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    kiln_core::telemetry::init_tracing(config.log_json, level);

    if cli.memory {
        info!("using in-memory state");
        return serve(Arc::new(MemoryState::new()), config, &cli).await;
    }
    let db_dir = config.data_dir.join("db");
    let handle = SurrealHandle::setup_from_env(&db_dir.to_string_lossy())
        .await
        .context("Failed to connect to Kiln database")?;
    serve(Arc::new(handle), config, &cli).await
}

async fn serve<S: KilnStore + 'static>(state: Arc<S>, config: KilnConfig, cli: &Cli) -> Result<()> {
    let store = Arc::new(FsStore::new(&config.store_dir, config.store_limit));
    store
        .init()
        .with_context(|| format!("Failed to prepare artifact store {:?}", config.store_dir))?;

    let hooks = HookDispatcher::new(state.clone(), state.clone(), state.clone())
        .with_product(config.product.clone())
        .with_timeout(config.hook_timeout)
        .with_body_limit(config.hook_body_limit);
    let events = EventBus::new(Arc::new(MultiDispatcher::new().with(Arc::new(hooks))));

    let queues = Arc::new(QueueRegistry::new());
    let (queue, tasks) = MemoryQueue::new(config.queue_capacity);
    queues.register(os::KIND, Arc::new(queue)).await;

    let drivers = Arc::new(DriverRegistry::new());
    drivers
        .register(os::KIND, OsDriver::factory(Some(config.data_dir.join("builds"))))
        .await;

    let cancel = CancellationToken::new();
    let worker = Worker::new(state.clone(), drivers, store.clone(), events.clone())
        .with_cancel(cancel.child_token());
    let scheduler = Scheduler::new(
        state.clone(),
        state.clone(),
        Creator::new(state.clone(), state.clone(), events),
        Submitter::new(queues),
    )
    .with_interval(config.cron_interval)
    .with_batch_size(config.cron_batch)
    .with_error_handler(Arc::new(|e: &KilnError| warn!(error = %e, "cron invocation failed")));
    let curator = Curator::new(state.clone(), state, store, config.artifact_quota);

    let mut services = JoinSet::new();
    services.spawn(Arc::new(worker).run(tasks, cli.workers));
    services.spawn(scheduler.run(cancel.child_token()));
    services.spawn(curate(
        curator,
        Duration::from_secs(cli.curate_interval.max(1)),
        cancel.child_token(),
    ));
    info!(
        store = %config.store_dir.display(),
        workers = cli.workers,
        "kilnd started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutting down");
    cancel.cancel();
    while let Some(joined) = services.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "service task failed");
        }
    }
    Ok(())
}

async fn curate(curator: Curator, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => match curator.curate().await {
                Ok(report) => info!(
                    users = report.users,
                    artifacts = report.artifacts.len(),
                    bytes = report.bytes,
                    "curation pass finished"
                ),
                Err(e) => warn!(error = %e, "curation pass failed"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults() {
        let cli = Cli::try_parse_from(["kilnd"]).unwrap();
        assert_eq!(cli.workers, 4);
        assert_eq!(cli.curate_interval, 3600);
        assert!(!cli.memory);

        let cli = Cli::try_parse_from(["kilnd", "--memory", "--workers", "1"]).unwrap();
        assert!(cli.memory);
        assert_eq!(cli.workers, 1);
    }

    #[tokio::test]
    async fn curation_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(MemoryState::new());
        let curator = Curator::new(
            state.clone(),
            state,
            Arc::new(FsStore::new(dir.path(), 0)),
            1024,
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(
            Duration::from_secs(5),
            curate(curator, Duration::from_secs(3600), cancel),
        )
        .await
        .unwrap();
    }
}
