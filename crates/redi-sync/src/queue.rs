//! In-process named work queue feeding the run coordinator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::coordinator::{RunCoordinator, TriggerOutcome, TriggerSource};

/// Name of the recurring job registered by the daemon.
pub const RECURRING_JOB_NAME: &str = "monthly-etl";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueJob {
    pub id: u64,
    pub name: String,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("queue {0} is full")]
    Full(String),
    #[error("queue {0} is closed")]
    Closed(String),
}

/// Producer handle; clone freely.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    name: Arc<str>,
    tx: mpsc::Sender<QueueJob>,
    next_id: Arc<AtomicU64>,
}

pub struct QueueConsumer {
    name: Arc<str>,
    rx: mpsc::Receiver<QueueJob>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub completed: usize,
    pub failed: usize,
    pub dropped: usize,
    pub discarded_on_shutdown: usize,
}

impl WorkQueue {
    pub fn new(name: &str, capacity: usize) -> (Self, QueueConsumer) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let name: Arc<str> = Arc::from(name);
        (
            Self {
                name: name.clone(),
                tx,
                next_id: Arc::new(AtomicU64::new(1)),
            },
            QueueConsumer { name, rx },
        )
    }

    /// Add a job without waiting; a full queue rejects rather than blocks.
    pub fn enqueue(&self, job_name: &str) -> Result<u64, EnqueueError> {
        let job = QueueJob {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            name: job_name.to_string(),
            enqueued_at: Utc::now(),
        };
        let id = job.id;
        self.tx.try_send(job).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full(self.name.to_string()),
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed(self.name.to_string()),
        })?;
        info!(queue = %self.name, job_id = id, job = job_name, "job enqueued");
        Ok(id)
    }
}

impl QueueConsumer {
    /// Process jobs until every producer is gone or `shutdown` flips to true.
    ///
    /// On shutdown the queue is closed to new jobs and anything still buffered
    /// is discarded; the in-flight job, if any, runs to completion first.
    pub async fn run(
        mut self,
        coordinator: Arc<RunCoordinator>,
        mut shutdown: watch::Receiver<bool>,
    ) -> QueueStats {
        let mut stats = QueueStats::default();
        info!(queue = %self.name, "queue consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let job = tokio::select! {
                job = self.rx.recv() => job,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };
            let Some(job) = job else {
                break;
            };

            info!(queue = %self.name, job_id = job.id, job = %job.name, "processing job");
            match coordinator.trigger(TriggerSource::Queue).await {
                TriggerOutcome::Completed(report) => {
                    stats.completed += 1;
                    info!(
                        job_id = job.id,
                        run_id = %report.run_id,
                        changed = report.summary.total_changed,
                        "job completed"
                    );
                }
                TriggerOutcome::Failed(reason) => {
                    stats.failed += 1;
                    error!(job_id = job.id, %reason, "job failed");
                }
                TriggerOutcome::Dropped => {
                    stats.dropped += 1;
                    info!(job_id = job.id, "job dropped; a run was already in progress");
                }
            }
        }

        self.rx.close();
        while let Ok(job) = self.rx.try_recv() {
            stats.discarded_on_shutdown += 1;
            warn!(queue = %self.name, job_id = job.id, "discarding queued job on shutdown");
        }
        info!(queue = %self.name, ?stats, "queue consumer stopped");
        stats
    }
}
