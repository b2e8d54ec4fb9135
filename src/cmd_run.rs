//! Foreground run mode: hosts the dispatch queue, timer scheduler and
//! continuation manager on one runtime until Ctrl+C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use conveyor_config::Config;
use conveyor_continuation::{ContinuationManager, FileCheckpointSink, SqliteTokenStore};
use conveyor_dispatch::{DispatchQueue, FileDeadLetterStore};
use conveyor_protocols::{
    BroadcastPublisher, Clock, CoreEvent, StepRecorder, SystemClock, TracingStepRecorder,
    to_chrono,
};
use conveyor_timer::{SqliteTimerStore, TimerAction, TimerScheduler};

const EVENT_BUFFER: usize = 1024;
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

/// Run every component until Ctrl+C, then shut down gracefully.
pub(crate) async fn run(config: Config, replay_dead_letters: bool) -> anyhow::Result<()> {
    info!("Starting Conveyor v{}", env!("CARGO_PKG_VERSION"));

    let store = &config.store;
    if let Some(parent) = store.database_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    info!("Database: {}", store.database_path.display());

    let publisher = Arc::new(BroadcastPublisher::new(EVENT_BUFFER));
    let recorder: Arc<dyn StepRecorder> = Arc::new(TracingStepRecorder);

    let dead_letters = Arc::new(FileDeadLetterStore::new(&store.dead_letter_dir).await?);
    let queue = Arc::new(
        DispatchQueue::new(config.dispatch.clone())
            .with_publisher(publisher.clone())
            .with_dead_letter_store(dead_letters)
            .with_recorder(recorder.clone()),
    );

    let timer_store = Arc::new(SqliteTimerStore::open(&store.database_path).await?);
    let scheduler = Arc::new(
        TimerScheduler::new(config.scheduler.clone(), timer_store)
            .with_publisher(publisher.clone())
            .with_work_sink(queue.clone()),
    );

    let token_store = Arc::new(SqliteTokenStore::open(&store.database_path).await?);
    let checkpoints = Arc::new(FileCheckpointSink::new(&store.checkpoint_dir).await?);
    let continuation = Arc::new(
        ContinuationManager::new(config.continuation.clone(), token_store)
            .with_publisher(publisher.clone())
            .with_checkpoint_sink(checkpoints)
            .with_recorder(recorder),
    );

    let shutdown = CancellationToken::new();
    let event_log = spawn_event_log(publisher.subscribe(), shutdown.clone());
    let maintenance = spawn_maintenance(
        Arc::clone(&scheduler),
        Arc::clone(&continuation),
        shutdown.clone(),
    );
    let dispatch_loop = tokio::spawn(Arc::clone(&queue).run());
    let timer_loop = Arc::clone(&scheduler).start(shutdown.clone());

    if replay_dead_letters {
        replay_all(&queue).await?;
    }

    info!("Conveyor running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl+C")?;
    info!("Shutdown requested");

    shutdown.cancel();
    let report = queue.shutdown().await;
    for (name, handle) in [
        ("timer scheduler", timer_loop),
        ("dispatch loop", dispatch_loop),
        ("maintenance", maintenance),
        ("event log", event_log),
    ] {
        if let Err(e) = handle.await {
            error!("{} task failed: {}", name, e);
        }
    }

    let stats = queue.stats();
    info!(
        "Conveyor stopped: {} completed, {} dead-lettered, {} still queued, {} stragglers",
        stats.completed, stats.dead_lettered, report.queued, report.stragglers
    );
    Ok(())
}

/// Re-submit every dead-lettered item.
async fn replay_all(queue: &DispatchQueue) -> anyhow::Result<()> {
    let entries = queue.dead_letters().await?;
    info!("Replaying {} dead-lettered item(s)", entries.len());
    for entry in entries {
        let id = entry.id();
        if let Err(e) = queue.replay_dead_letter(id).await {
            warn!("Could not replay dead letter {}: {}", id, e);
        }
    }
    Ok(())
}

/// Mirror published events into the log.
fn spawn_event_log(
    mut rx: broadcast::Receiver<CoreEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) => debug!(event = ?event, "core event"),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Event log lagged; {} event(s) skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

/// Hourly: purge expired tokens and keep one cleanup timer pending.
fn spawn_maintenance(
    scheduler: Arc<TimerScheduler>,
    continuation: Arc<ContinuationManager>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = continuation.purge_expired().await {
                        warn!("Token purge failed: {}", e);
                    }
                    if let Err(e) = ensure_cleanup_timer(&scheduler).await {
                        warn!("Could not schedule timer cleanup: {}", e);
                    }
                }
            }
        }
    })
}

async fn ensure_cleanup_timer(scheduler: &TimerScheduler) -> anyhow::Result<()> {
    let pending = scheduler.pending_timers().await?;
    if pending.iter().any(|t| t.action == TimerAction::Cleanup) {
        return Ok(());
    }
    let fire_at = SystemClock.now() + to_chrono(MAINTENANCE_INTERVAL);
    let timer = scheduler
        .schedule_cleanup(fire_at, serde_json::Value::Null)
        .await?;
    debug!("Scheduled timer cleanup {} at {}", timer.id, timer.fire_at);
    Ok(())
}
