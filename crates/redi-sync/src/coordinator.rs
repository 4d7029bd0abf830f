//! Single-flight guard shared by every run trigger.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::pipeline::{IngestError, RunReport};

/// Anything that can perform one full ingest run.
#[async_trait]
pub trait PipelineRunner: Send + Sync {
    async fn run_pipeline(&self) -> Result<RunReport, IngestError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Cron,
    Queue,
    Manual,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunState {
    pub is_running: bool,
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub enum TriggerOutcome {
    Completed(Box<RunReport>),
    Failed(String),
    /// Another run was in flight; nothing was done.
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinatorStatus {
    pub is_running: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub is_scheduled: bool,
}

/// Clears `is_running` when dropped, including on error or unwinding.
#[derive(Debug)]
pub struct RunGuard<'a> {
    state: &'a Mutex<RunState>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        lock(self.state).is_running = false;
    }
}

fn lock(state: &Mutex<RunState>) -> MutexGuard<'_, RunState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct RunCoordinator {
    state: Mutex<RunState>,
    scheduled: AtomicBool,
    runner: Arc<dyn PipelineRunner>,
}

impl RunCoordinator {
    pub fn new(runner: Arc<dyn PipelineRunner>) -> Self {
        Self {
            state: Mutex::new(RunState::default()),
            scheduled: AtomicBool::new(false),
            runner,
        }
    }

    /// Claim the single run slot. `None` while another run holds it.
    pub fn try_begin(&self) -> Option<RunGuard<'_>> {
        let mut state = lock(&self.state);
        if state.is_running {
            return None;
        }
        state.is_running = true;
        state.last_run_at = Some(Utc::now());
        Some(RunGuard { state: &self.state })
    }

    pub async fn trigger(&self, source: TriggerSource) -> TriggerOutcome {
        let Some(_guard) = self.try_begin() else {
            info!(?source, "ingest run already in progress; dropping trigger");
            return TriggerOutcome::Dropped;
        };

        info!(?source, "ingest run triggered");
        match self.runner.run_pipeline().await {
            Ok(report) => TriggerOutcome::Completed(Box::new(report)),
            Err(err) => {
                error!(?source, error = %err, "ingest run failed");
                TriggerOutcome::Failed(err.to_string())
            }
        }
    }

    pub fn set_scheduled(&self, scheduled: bool) {
        self.scheduled.store(scheduled, Ordering::SeqCst);
    }

    pub fn status(&self) -> CoordinatorStatus {
        let state = lock(&self.state);
        CoordinatorStatus {
            is_running: state.is_running,
            last_run_at: state.last_run_at,
            is_scheduled: self.scheduled.load(Ordering::SeqCst),
        }
    }

    /// Wait for an in-flight run to finish, up to `timeout`. True when idle.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.status().is_running {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invalidate::InvalidationReport;
    use crate::snapshot::SnapshotOutcome;
    use redi_core::RunSummary;
    use redi_storage::FetchError;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;
    use uuid::Uuid;

    fn report() -> RunReport {
        RunReport {
            run_id: Uuid::new_v4(),
            run_date: "2024-04-01".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            total_records: 0,
            summary: RunSummary::default(),
            snapshot: SnapshotOutcome::Failed {
                reason: "not written".to_string(),
            },
            invalidation: InvalidationReport::default(),
        }
    }

    /// Blocks inside the run until released.
    #[derive(Default)]
    struct GatedRunner {
        entered: Notify,
        release: Notify,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl PipelineRunner for GatedRunner {
        async fn run_pipeline(&self) -> Result<RunReport, IngestError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
            Ok(report())
        }
    }

    struct FailingRunner;

    #[async_trait]
    impl PipelineRunner for FailingRunner {
        async fn run_pipeline(&self) -> Result<RunReport, IngestError> {
            Err(IngestError::Fetch(FetchError::HttpStatus {
                status: 503,
                url: "https://upstream.test/resource".to_string(),
            }))
        }
    }

    #[tokio::test]
    async fn trigger_during_a_run_is_dropped() {
        let runner = Arc::new(GatedRunner::default());
        let coordinator = Arc::new(RunCoordinator::new(runner.clone()));

        let first = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.trigger(TriggerSource::Cron).await }
        });
        runner.entered.notified().await;
        assert!(coordinator.status().is_running);

        let second = coordinator.trigger(TriggerSource::Queue).await;
        assert!(matches!(second, TriggerOutcome::Dropped));

        runner.release.notify_one();
        assert!(matches!(first.await.unwrap(), TriggerOutcome::Completed(_)));
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
        assert!(!coordinator.status().is_running);
    }

    #[tokio::test]
    async fn failed_run_releases_the_guard() {
        let coordinator = RunCoordinator::new(Arc::new(FailingRunner));

        let outcome = coordinator.trigger(TriggerSource::Manual).await;
        let TriggerOutcome::Failed(reason) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(reason.contains("503"));

        let status = coordinator.status();
        assert!(!status.is_running);
        assert!(status.last_run_at.is_some());
        assert!(coordinator.try_begin().is_some());
    }

    #[test]
    fn guard_drop_clears_running_flag() {
        let coordinator = RunCoordinator::new(Arc::new(FailingRunner));
        let guard = coordinator.try_begin().unwrap();
        assert!(coordinator.try_begin().is_none());
        drop(guard);
        assert!(coordinator.try_begin().is_some());
    }

    #[tokio::test]
    async fn wait_idle_times_out_while_running() {
        let coordinator = RunCoordinator::new(Arc::new(FailingRunner));
        let _guard = coordinator.try_begin().unwrap();
        assert!(!coordinator.wait_idle(Duration::from_millis(150)).await);
    }

    #[test]
    fn scheduled_flag_is_reported() {
        let coordinator = RunCoordinator::new(Arc::new(FailingRunner));
        assert!(!coordinator.status().is_scheduled);
        coordinator.set_scheduled(true);
        assert!(coordinator.status().is_scheduled);
    }
}
