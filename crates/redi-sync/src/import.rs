//! Offline bulk load from a delimited file through the regular upsert path.

use std::path::Path;

use anyhow::Context;
use redi_adapters::read_delimited;
use redi_core::{RunSummary, SOURCE_TAG_FILE};
use serde::Serialize;
use tracing::{info, info_span, Instrument};

use crate::batch::{BatchOptions, BatchProcessor};
use crate::invalidate::{CacheInvalidator, InvalidationReport};

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub path: String,
    pub total_records: usize,
    pub summary: RunSummary,
    pub invalidation: InvalidationReport,
}

/// Load `path` and upsert every row as a `file-import` record.
///
/// Bypasses the fetch step and the run coordinator; no snapshot is written.
pub async fn import_delimited(
    path: impl AsRef<Path>,
    delimiter: u8,
    processor: &BatchProcessor,
    invalidator: &CacheInvalidator,
    options: &BatchOptions,
) -> anyhow::Result<ImportReport> {
    let path = path.as_ref();
    let span = info_span!("bulk_import", path = %path.display());
    import_inner(path, delimiter, processor, invalidator, options)
        .instrument(span)
        .await
}

async fn import_inner(
    path: &Path,
    delimiter: u8,
    processor: &BatchProcessor,
    invalidator: &CacheInvalidator,
    options: &BatchOptions,
) -> anyhow::Result<ImportReport> {
    let rows = read_delimited(path, delimiter)?;
    info!(rows = rows.len(), "delimited file loaded");

    let options = BatchOptions {
        source_tag: SOURCE_TAG_FILE.to_string(),
        ..options.clone()
    };
    let outcome = match processor.run(&rows, &options).await {
        Ok(outcome) => outcome,
        Err(abort) => {
            if let Some(partial) = abort.partial_summary() {
                invalidator.invalidate(&partial.changed_entities).await;
            }
            return Err(abort).with_context(|| format!("importing {}", path.display()));
        }
    };
    let invalidation = invalidator
        .invalidate(&outcome.summary.changed_entities)
        .await;

    info!(
        processed = outcome.summary.total_processed,
        changed = outcome.summary.total_changed,
        skipped = outcome.summary.skipped,
        failed = outcome.summary.failed,
        "import finished"
    );
    Ok(ImportReport {
        path: path.display().to_string(),
        total_records: rows.len(),
        summary: outcome.summary,
        invalidation,
    })
}
