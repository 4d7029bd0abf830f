//! Cron wiring: direct coordinator triggers and the recurring queue job.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono_tz::Tz;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::coordinator::{RunCoordinator, TriggerSource};
use crate::queue::WorkQueue;

/// Five-field crontab expressions get a leading seconds field; the scheduler
/// only parses the six- and seven-field forms.
pub fn cron_expression(schedule: &str) -> String {
    let schedule = schedule.trim();
    if schedule.split_whitespace().count() == 5 {
        format!("0 {schedule}")
    } else {
        schedule.to_string()
    }
}

/// Cron job that runs the pipeline through the coordinator.
pub fn cron_trigger_job(schedule: &str, timezone: Tz, coordinator: Arc<RunCoordinator>) -> Result<Job> {
    Job::new_async_tz(cron_expression(schedule).as_str(), timezone, move |_uuid, _l| {
        let coordinator = coordinator.clone();
        Box::pin(async move {
            coordinator.trigger(TriggerSource::Cron).await;
        })
    })
    .with_context(|| format!("creating cron trigger for {schedule} ({timezone})"))
}

/// Cron job that only enqueues `job_name`; the queue consumer does the work.
pub fn recurring_enqueue_job(
    schedule: &str,
    timezone: Tz,
    queue: WorkQueue,
    job_name: &str,
) -> Result<Job> {
    let job_name = job_name.to_string();
    Job::new_async_tz(cron_expression(schedule).as_str(), timezone, move |_uuid, _l| {
        let queue = queue.clone();
        let job_name = job_name.clone();
        Box::pin(async move {
            if let Err(err) = queue.enqueue(&job_name) {
                warn!(error = %err, job = %job_name, "recurring job not enqueued");
            }
        })
    })
    .with_context(|| format!("creating recurring job for {schedule} ({timezone})"))
}

pub struct IngestScheduler {
    sched: JobScheduler,
    jobs: usize,
}

impl IngestScheduler {
    pub async fn new() -> Result<Self> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        Ok(Self { sched, jobs: 0 })
    }

    pub async fn add(&mut self, job: Job) -> Result<()> {
        self.sched.add(job).await.context("adding scheduler job")?;
        self.jobs += 1;
        Ok(())
    }

    pub fn job_count(&self) -> usize {
        self.jobs
    }

    pub async fn start(&self) -> Result<()> {
        self.sched.start().await.context("starting scheduler")?;
        info!(jobs = self.jobs, "scheduler started");
        Ok(())
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.sched.shutdown().await.context("shutting down scheduler")?;
        info!("scheduler stopped");
        Ok(())
    }
}
