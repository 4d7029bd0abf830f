//! One ingest run end to end: fetch, extract, process, snapshot, invalidate.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use redi_adapters::{extract_records, PayloadError};
use redi_core::RunSummary;
use redi_storage::{redact_query, FetchError, HttpFetcher};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::batch::{BatchAbort, BatchOptions, BatchProcessor};
use crate::coordinator::PipelineRunner;
use crate::invalidate::{CacheInvalidator, InvalidationReport};
use crate::snapshot::{SnapshotOutcome, SnapshotWriter};

/// Where a run's raw batch comes from.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch(&self, run_id: Uuid) -> Result<Vec<u8>, FetchError>;

    /// Log-safe description of the source.
    fn describe(&self) -> String;
}

#[derive(Debug)]
pub struct HttpRecordSource {
    fetcher: HttpFetcher,
    url: String,
}

impl HttpRecordSource {
    pub fn new(fetcher: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            fetcher,
            url: url.into(),
        }
    }
}

#[async_trait]
impl RecordSource for HttpRecordSource {
    async fn fetch(&self, run_id: Uuid) -> Result<Vec<u8>, FetchError> {
        let response = self.fetcher.fetch_json_bytes(run_id, &self.url).await?;
        if let Some(content_type) = &response.content_type {
            if !content_type.contains("json") {
                warn!(%content_type, "upstream did not declare a JSON content type");
            }
        }
        Ok(response.body)
    }

    fn describe(&self) -> String {
        redact_query(&self.url)
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("unusable upstream payload: {0}")]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Batch(#[from] BatchAbort),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub run_date: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Records extracted from the upstream payload, before normalization.
    pub total_records: usize,
    pub summary: RunSummary,
    pub snapshot: SnapshotOutcome,
    pub invalidation: InvalidationReport,
}

pub struct IngestPipeline {
    source: Arc<dyn RecordSource>,
    processor: BatchProcessor,
    snapshots: SnapshotWriter,
    invalidator: CacheInvalidator,
    options: BatchOptions,
    timezone: Tz,
}

impl IngestPipeline {
    pub fn new(
        source: Arc<dyn RecordSource>,
        processor: BatchProcessor,
        snapshots: SnapshotWriter,
        invalidator: CacheInvalidator,
        options: BatchOptions,
    ) -> Self {
        Self {
            source,
            processor,
            snapshots,
            invalidator,
            options,
            timezone: chrono_tz::UTC,
        }
    }

    /// Timezone the snapshot run date is computed in.
    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub async fn run_once(&self) -> Result<RunReport, IngestError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<RunReport, IngestError> {
        let started_at = Utc::now();
        let run_date = started_at
            .with_timezone(&self.timezone)
            .format("%Y-%m-%d")
            .to_string();
        info!(source = %self.source.describe(), %run_date, "ingest run started");

        let body = self.source.fetch(run_id).await?;
        let batch = extract_records(&body)?;
        if batch.dropped_non_objects > 0 {
            warn!(
                dropped = batch.dropped_non_objects,
                "dropped non-object elements from upstream payload"
            );
        }
        let total_records = batch.records.len();
        info!(records = total_records, shape = ?batch.shape, "upstream batch extracted");

        let outcome = match self.processor.run(&batch.records, &self.options).await {
            Ok(outcome) => outcome,
            Err(abort) => {
                // Entities written before the abort still need fresh caches.
                if let Some(partial) = abort.partial_summary() {
                    self.invalidator.invalidate(&partial.changed_entities).await;
                }
                error!(error = %abort, "batch aborted");
                return Err(abort.into());
            }
        };

        let snapshot = self
            .snapshots
            .write(&run_date, run_id, total_records, &outcome.summary, &outcome.sample)
            .await;
        let invalidation = self
            .invalidator
            .invalidate(&outcome.summary.changed_entities)
            .await;

        let report = RunReport {
            run_id,
            run_date,
            started_at,
            finished_at: Utc::now(),
            total_records,
            summary: outcome.summary,
            snapshot,
            invalidation,
        };
        info!(
            processed = report.summary.total_processed,
            changed = report.summary.total_changed,
            entities_changed = report.summary.distinct_entities_changed(),
            skipped = report.summary.skipped,
            failed = report.summary.failed,
            stopped_early = report.summary.stopped_early,
            "ingest run finished"
        );
        Ok(report)
    }
}

#[async_trait]
impl PipelineRunner for IngestPipeline {
    async fn run_pipeline(&self) -> Result<RunReport, IngestError> {
        self.run_once().await
    }
}
