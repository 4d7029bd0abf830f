//! Long-running mode: cron and queue triggers until a shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::IngestConfig;
use crate::coordinator::{PipelineRunner, RunCoordinator, TriggerSource};
use crate::queue::{QueueStats, WorkQueue, RECURRING_JOB_NAME};
use crate::scheduler::{cron_trigger_job, recurring_enqueue_job, IngestScheduler};

const QUEUE_NAME: &str = "ingest";
const QUEUE_CAPACITY: usize = 16;

pub async fn run_daemon(
    config: &IngestConfig,
    runner: Arc<dyn PipelineRunner>,
    run_now: bool,
) -> Result<()> {
    if !config.scheduler_enabled && !config.queue_enabled && !run_now {
        bail!("scheduler and queue are both disabled; nothing would ever run");
    }

    let coordinator = Arc::new(RunCoordinator::new(runner));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut scheduler = IngestScheduler::new().await?;

    if config.scheduler_enabled {
        scheduler
            .add(cron_trigger_job(
                &config.cron_schedule,
                config.timezone,
                coordinator.clone(),
            )?)
            .await?;
    }

    let mut queue = None;
    let mut consumer_handle = None;
    if config.queue_enabled {
        let (work_queue, consumer) = WorkQueue::new(QUEUE_NAME, QUEUE_CAPACITY);
        scheduler
            .add(recurring_enqueue_job(
                &config.cron_schedule,
                config.timezone,
                work_queue.clone(),
                RECURRING_JOB_NAME,
            )?)
            .await?;
        consumer_handle = Some(tokio::spawn(consumer.run(coordinator.clone(), shutdown_rx)));
        queue = Some(work_queue);
    }

    if scheduler.job_count() > 0 {
        scheduler.start().await?;
        coordinator.set_scheduled(true);
    }

    if run_now {
        match &queue {
            Some(queue) => {
                queue.enqueue("manual")?;
            }
            None => {
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    coordinator.trigger(TriggerSource::Manual).await;
                });
            }
        }
    }

    info!(
        schedule = %config.cron_schedule,
        timezone = %config.timezone,
        status = ?coordinator.status(),
        "daemon ready"
    );

    shutdown_signal().await;
    info!("shutdown signal received");

    scheduler.shutdown().await?;
    coordinator.set_scheduled(false);
    let _ = shutdown_tx.send(true);
    drop(queue);

    drain(&coordinator, consumer_handle, config.shutdown_grace()).await;

    info!(status = ?coordinator.status(), "daemon stopped");
    Ok(())
}

/// Wait for the queue consumer and any in-flight run under a single grace deadline.
async fn drain(
    coordinator: &RunCoordinator,
    consumer_handle: Option<JoinHandle<QueueStats>>,
    grace: Duration,
) -> bool {
    let deadline = Instant::now() + grace;
    if let Some(handle) = consumer_handle {
        match tokio::time::timeout_at(deadline, handle).await {
            Ok(Ok(stats)) => info!(?stats, "queue drained"),
            Ok(Err(err)) => warn!(error = %err, "queue consumer task failed"),
            Err(_) => warn!("queue consumer did not stop within the grace period"),
        }
    }
    let idle = coordinator
        .wait_idle(deadline.saturating_duration_since(Instant::now()))
        .await;
    if !idle {
        warn!(
            grace_secs = grace.as_secs(),
            "abandoning in-flight run; committed writes are kept"
        );
    }
    idle
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
