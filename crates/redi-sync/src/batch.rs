//! Chunked, paced processing of a raw batch: normalize, upsert, count.

use std::sync::Arc;
use std::time::Duration;

use redi_adapters::{CanonicalField, Normalizer};
use redi_core::{CanonicalRecord, RawRecord, RunSummary, SOURCE_TAG_API};
use redi_storage::{RecordStore, StoreError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::upsert::{upsert, UpsertOutcome};

/// Only the first few skipped records get a full diagnostic line.
const SKIP_DETAIL_LOG_LIMIT: usize = 20;
const PROGRESS_EVERY: usize = 100;

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub chunk_size: usize,
    pub chunk_pause: Duration,
    pub max_processed: Option<usize>,
    pub source_tag: String,
    /// Cap on normalized records retained for the snapshot sample.
    pub sample_limit: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_pause: Duration::from_millis(100),
            max_processed: None,
            source_tag: SOURCE_TAG_API.to_string(),
            sample_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub summary: RunSummary,
    pub sample: Vec<CanonicalRecord>,
}

#[derive(Debug, Error)]
pub enum BatchAbort {
    #[error("chunk size must be at least 1")]
    InvalidChunkSize,
    #[error("record store unavailable after {} processed records: {source}", .summary.total_processed)]
    StoreUnavailable {
        summary: RunSummary,
        #[source]
        source: StoreError,
    },
}

impl BatchAbort {
    /// Work committed before the abort.
    pub fn partial_summary(&self) -> Option<&RunSummary> {
        match self {
            BatchAbort::InvalidChunkSize => None,
            BatchAbort::StoreUnavailable { summary, .. } => Some(summary),
        }
    }
}

#[derive(Clone)]
pub struct BatchProcessor {
    normalizer: Arc<Normalizer>,
    store: Arc<dyn RecordStore>,
}

impl BatchProcessor {
    pub fn new(normalizer: Arc<Normalizer>, store: Arc<dyn RecordStore>) -> Self {
        Self { normalizer, store }
    }

    pub async fn run(
        &self,
        raw_records: &[RawRecord],
        options: &BatchOptions,
    ) -> Result<BatchOutcome, BatchAbort> {
        if options.chunk_size == 0 {
            return Err(BatchAbort::InvalidChunkSize);
        }

        let mut outcome = BatchOutcome::default();
        let chunk_count = raw_records.len().div_ceil(options.chunk_size);

        for (chunk_index, chunk) in raw_records.chunks(options.chunk_size).enumerate() {
            let chunk_number = chunk_index + 1;
            info!(
                chunk = chunk_number,
                chunks = chunk_count,
                records = chunk.len(),
                "processing chunk"
            );

            for raw in chunk {
                self.process_record(raw, options, &mut outcome).await?;
            }

            let summary = &outcome.summary;
            info!(
                chunk = chunk_number,
                processed = summary.total_processed,
                changed = summary.total_changed,
                skipped = summary.skipped,
                failed = summary.failed,
                "chunk complete"
            );

            let is_last = chunk_number == chunk_count;
            if is_last {
                break;
            }
            if let Some(limit) = options.max_processed {
                if summary.total_processed >= limit {
                    info!(limit, "processing limit reached; stopping early");
                    outcome.summary.stopped_early = true;
                    break;
                }
            }
            if !options.chunk_pause.is_zero() {
                tokio::time::sleep(options.chunk_pause).await;
            }
        }

        Ok(outcome)
    }

    async fn process_record(
        &self,
        raw: &RawRecord,
        options: &BatchOptions,
        outcome: &mut BatchOutcome,
    ) -> Result<(), BatchAbort> {
        let summary = &mut outcome.summary;
        let record = match self.normalizer.normalize(raw, &options.source_tag) {
            Ok(record) => record,
            Err(missing) => {
                summary.skipped += 1;
                if summary.skipped <= SKIP_DETAIL_LOG_LIMIT {
                    let hints = missing
                        .missing
                        .iter()
                        .map(|field| (*field, self.normalizer.suggest_columns(raw, *field)))
                        .filter(|(_, near)| !near.is_empty())
                        .collect::<Vec<(CanonicalField, Vec<String>)>>();
                    warn!(error = %missing, ?hints, "skipping record");
                }
                return Ok(());
            }
        };

        // A dropped connection is retried once before the run gives up on the store.
        let result = match upsert(self.store.as_ref(), &record).await {
            Err(StoreError::Unavailable(reason)) => {
                warn!(key = %record.key, %reason, "store unavailable; retrying record once");
                upsert(self.store.as_ref(), &record).await
            }
            other => other,
        };

        match result {
            Ok(result) => {
                summary.total_processed += 1;
                match result {
                    UpsertOutcome::Inserted => summary.inserted += 1,
                    UpsertOutcome::Updated => summary.updated += 1,
                    UpsertOutcome::Unchanged => summary.unchanged += 1,
                }
                if result.is_change() {
                    summary.total_changed += 1;
                    summary.changed_entities.insert(record.entity());
                }
                if summary.total_processed % PROGRESS_EVERY == 0 {
                    debug!(
                        processed = summary.total_processed,
                        changed = summary.total_changed,
                        "progress"
                    );
                }
                if outcome.sample.len() < options.sample_limit {
                    outcome.sample.push(record);
                }
                Ok(())
            }
            Err(StoreError::Unavailable(reason)) => Err(BatchAbort::StoreUnavailable {
                summary: summary.clone(),
                source: StoreError::Unavailable(reason),
            }),
            Err(err) => {
                summary.failed += 1;
                warn!(
                    key = %record.key,
                    error = %err,
                    "failed to upsert record; continuing"
                );
                Ok(())
            }
        }
    }
}
