//! Per-run JSON audit snapshot.

use redi_core::{CanonicalRecord, RunSummary};
use redi_storage::SnapshotStore;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct SnapshotDocument<'a> {
    pub run_date: &'a str,
    pub run_id: Uuid,
    pub total_records: usize,
    pub sample_records: &'a [CanonicalRecord],
    pub total_processed: usize,
    pub total_changed: usize,
    pub distinct_entities_changed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub stopped_early: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SnapshotOutcome {
    Written {
        path: String,
        content_hash: String,
        deduplicated: bool,
    },
    Failed {
        reason: String,
    },
}

impl SnapshotOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, SnapshotOutcome::Written { .. })
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    store: SnapshotStore,
    sample_limit: usize,
}

impl SnapshotWriter {
    pub fn new(store: SnapshotStore) -> Self {
        Self {
            store,
            sample_limit: 100,
        }
    }

    pub fn with_sample_limit(mut self, sample_limit: usize) -> Self {
        self.sample_limit = sample_limit;
        self
    }

    /// Serialize and persist the run snapshot. Never fails the run.
    pub async fn write(
        &self,
        run_date: &str,
        run_id: Uuid,
        total_records: usize,
        summary: &RunSummary,
        sample: &[CanonicalRecord],
    ) -> SnapshotOutcome {
        let document = SnapshotDocument {
            run_date,
            run_id,
            total_records,
            sample_records: &sample[..sample.len().min(self.sample_limit)],
            total_processed: summary.total_processed,
            total_changed: summary.total_changed,
            distinct_entities_changed: summary.distinct_entities_changed(),
            skipped: summary.skipped,
            failed: summary.failed,
            stopped_early: summary.stopped_early,
        };

        let bytes = match serde_json::to_vec_pretty(&document) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "failed to serialize snapshot");
                return SnapshotOutcome::Failed {
                    reason: err.to_string(),
                };
            }
        };

        match self.store.store_snapshot(run_date, &bytes).await {
            Ok(stored) => {
                info!(
                    path = %stored.absolute_path.display(),
                    bytes = stored.byte_size,
                    deduplicated = stored.deduplicated,
                    "snapshot written"
                );
                SnapshotOutcome::Written {
                    path: stored.relative_path.display().to_string(),
                    content_hash: stored.content_hash,
                    deduplicated: stored.deduplicated,
                }
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed to write snapshot");
                SnapshotOutcome::Failed {
                    reason: format!("{err:#}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use redi_core::{EntityKey, ExtendedFields, Metrics, NaturalKey, VolumeSource, SOURCE_TAG_API};

    fn record(n: usize) -> CanonicalRecord {
        CanonicalRecord {
            key: NaturalKey::new("Bihar", format!("District {n}"), "2023-24", "May"),
            metrics: Metrics::default(),
            extended_fields: ExtendedFields::new(),
            volume_source: VolumeSource::Direct,
            source_tag: SOURCE_TAG_API.to_string(),
            last_updated: Utc::now(),
        }
    }

    fn summary() -> RunSummary {
        let mut summary = RunSummary {
            total_processed: 150,
            total_changed: 2,
            skipped: 1,
            ..RunSummary::default()
        };
        summary.changed_entities.insert(EntityKey::new("Bihar", "Patna"));
        summary.changed_entities.insert(EntityKey::new("Bihar", "Gaya"));
        summary
    }

    #[tokio::test]
    async fn document_carries_counts_and_capped_sample() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(SnapshotStore::new(dir.path()));
        let sample = (0..150).map(record).collect::<Vec<_>>();

        let outcome = writer
            .write("2024-03-01", Uuid::new_v4(), 151, &summary(), &sample)
            .await;
        let SnapshotOutcome::Written { path, .. } = outcome else {
            panic!("expected a written snapshot, got {outcome:?}");
        };
        assert_eq!(path, "snapshot-2024-03-01.json");

        let text = std::fs::read_to_string(dir.path().join(&path)).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(doc["run_date"], "2024-03-01");
        assert_eq!(doc["total_records"], 151);
        assert_eq!(doc["total_processed"], 150);
        assert_eq!(doc["distinct_entities_changed"], 2);
        assert_eq!(doc["skipped"], 1);
        assert_eq!(doc["sample_records"].as_array().unwrap().len(), 100);
    }

    #[tokio::test]
    async fn second_run_same_day_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(SnapshotStore::new(dir.path()));

        let first = writer
            .write("2024-03-01", Uuid::new_v4(), 1, &summary(), &[record(1)])
            .await;
        let second = writer
            .write("2024-03-01", Uuid::new_v4(), 1, &summary(), &[record(1)])
            .await;
        assert!(first.is_written() && second.is_written());
        assert_ne!(first, second);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn unwritable_root_is_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let writer = SnapshotWriter::new(SnapshotStore::new(blocker.join("snapshots")));

        let outcome = writer
            .write("2024-03-01", Uuid::new_v4(), 0, &RunSummary::default(), &[])
            .await;
        assert!(matches!(outcome, SnapshotOutcome::Failed { .. }));
    }
}
