//! Canonical record store seam: Postgres for production, in-memory for tests and dry runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redi_core::{CanonicalRecord, ExtendedFields, Metrics, NaturalKey, VolumeSource};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The unique natural-key constraint rejected an insert.
    #[error("record already present for {0}")]
    Conflict(NaturalKey),
    /// The store cannot be reached at all; callers treat this as run-fatal.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store operation failed: {0}")]
    Backend(String),
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find_one(&self, key: &NaturalKey) -> Result<Option<CanonicalRecord>, StoreError>;

    /// Insert a record whose key is not yet present. Returns `Conflict` when it is.
    async fn insert(&self, record: &CanonicalRecord) -> Result<(), StoreError>;

    /// Overwrite every field of the record stored under `key`.
    async fn update_by_key(
        &self,
        key: &NaturalKey,
        record: &CanonicalRecord,
    ) -> Result<(), StoreError>;
}

/// Process-local store keyed by natural key. Counts writes so callers can
/// assert on redundant-write avoidance.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<BTreeMap<NaturalKey, CanonicalRecord>>,
    writes: AtomicUsize,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    pub async fn get(&self, key: &NaturalKey) -> Option<CanonicalRecord> {
        self.records.lock().await.get(key).cloned()
    }

    pub async fn all(&self) -> Vec<CanonicalRecord> {
        self.records.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn find_one(&self, key: &NaturalKey) -> Result<Option<CanonicalRecord>, StoreError> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn insert(&self, record: &CanonicalRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&record.key) {
            return Err(StoreError::Conflict(record.key.clone()));
        }
        records.insert(record.key.clone(), record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_by_key(
        &self,
        key: &NaturalKey,
        record: &CanonicalRecord,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let Some(slot) = records.get_mut(key) else {
            return Err(StoreError::Backend(format!("no record to update for {key}")));
        };
        *slot = CanonicalRecord {
            key: key.clone(),
            ..record.clone()
        };
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running canonical_records migrations")
    }
}

fn volume_source_str(source: VolumeSource) -> &'static str {
    match source {
        VolumeSource::Direct => "direct",
        VolumeSource::ComponentSum => "component_sum",
    }
}

fn parse_volume_source(value: &str) -> VolumeSource {
    match value {
        "component_sum" => VolumeSource::ComponentSum,
        _ => VolumeSource::Direct,
    }
}

fn map_sqlx_error(err: sqlx::Error, key: &NaturalKey) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(key.clone()),
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => StoreError::Unavailable(err.to_string()),
        _ => StoreError::Backend(err.to_string()),
    }
}

fn row_to_record(row: &PgRow) -> Result<CanonicalRecord, sqlx::Error> {
    let extended: Json<ExtendedFields> = row.try_get("extended_fields")?;
    let volume_source: String = row.try_get("volume_source")?;
    let last_updated: DateTime<Utc> = row.try_get("last_updated")?;
    Ok(CanonicalRecord {
        key: NaturalKey {
            region: row.try_get("region")?,
            sub_region: row.try_get("sub_region")?,
            fiscal_year: row.try_get("fiscal_year")?,
            period: row.try_get("period")?,
        },
        metrics: Metrics {
            primary_volume: row.try_get("primary_volume")?,
            works_completed: row.try_get("works_completed")?,
            works_in_progress: row.try_get("works_in_progress")?,
            payments_made: row.try_get("payments_made")?,
            amount_spent: row.try_get("amount_spent")?,
        },
        extended_fields: extended.0,
        volume_source: parse_volume_source(&volume_source),
        source_tag: row.try_get("source_tag")?,
        last_updated,
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn find_one(&self, key: &NaturalKey) -> Result<Option<CanonicalRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT region, sub_region, fiscal_year, period,
                   primary_volume, works_completed, works_in_progress,
                   payments_made, amount_spent,
                   extended_fields, volume_source, source_tag, last_updated
              FROM canonical_records
             WHERE region = $1 AND sub_region = $2 AND fiscal_year = $3 AND period = $4
            "#,
        )
        .bind(&key.region)
        .bind(&key.sub_region)
        .bind(&key.fiscal_year)
        .bind(&key.period)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| map_sqlx_error(err, key))?;

        row.as_ref()
            .map(row_to_record)
            .transpose()
            .map_err(|err| map_sqlx_error(err, key))
    }

    async fn insert(&self, record: &CanonicalRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO canonical_records (
                region, sub_region, fiscal_year, period,
                primary_volume, works_completed, works_in_progress,
                payments_made, amount_spent,
                extended_fields, volume_source, source_tag, last_updated
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(&record.key.region)
        .bind(&record.key.sub_region)
        .bind(&record.key.fiscal_year)
        .bind(&record.key.period)
        .bind(record.metrics.primary_volume)
        .bind(record.metrics.works_completed)
        .bind(record.metrics.works_in_progress)
        .bind(record.metrics.payments_made)
        .bind(record.metrics.amount_spent)
        .bind(Json(&record.extended_fields))
        .bind(volume_source_str(record.volume_source))
        .bind(&record.source_tag)
        .bind(record.last_updated)
        .execute(&self.pool)
        .await
        .map_err(|err| map_sqlx_error(err, &record.key))?;
        Ok(())
    }

    async fn update_by_key(
        &self,
        key: &NaturalKey,
        record: &CanonicalRecord,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE canonical_records
               SET primary_volume = $5,
                   works_completed = $6,
                   works_in_progress = $7,
                   payments_made = $8,
                   amount_spent = $9,
                   extended_fields = $10,
                   volume_source = $11,
                   source_tag = $12,
                   last_updated = $13
             WHERE region = $1 AND sub_region = $2 AND fiscal_year = $3 AND period = $4
            "#,
        )
        .bind(&key.region)
        .bind(&key.sub_region)
        .bind(&key.fiscal_year)
        .bind(&key.period)
        .bind(record.metrics.primary_volume)
        .bind(record.metrics.works_completed)
        .bind(record.metrics.works_in_progress)
        .bind(record.metrics.payments_made)
        .bind(record.metrics.amount_spent)
        .bind(Json(&record.extended_fields))
        .bind(volume_source_str(record.volume_source))
        .bind(&record.source_tag)
        .bind(record.last_updated)
        .execute(&self.pool)
        .await
        .map_err(|err| map_sqlx_error(err, key))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Backend(format!("no record to update for {key}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redi_core::SOURCE_TAG_API;

    fn record(key: NaturalKey, volume: f64) -> CanonicalRecord {
        CanonicalRecord {
            key,
            metrics: Metrics {
                primary_volume: volume,
                ..Metrics::default()
            },
            extended_fields: ExtendedFields::new(),
            volume_source: VolumeSource::Direct,
            source_tag: SOURCE_TAG_API.to_string(),
            last_updated: Utc::now(),
        }
    }

    #[tokio::test]
    async fn memory_store_rejects_duplicate_natural_keys() {
        let store = MemoryRecordStore::new();
        let key = NaturalKey::new("Bihar", "Patna", "2023-24", "May");
        store.insert(&record(key.clone(), 1.0)).await.unwrap();

        let err = store.insert(&record(key.clone(), 2.0)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(k) if k == key));
        assert_eq!(store.len().await, 1);
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn memory_store_update_overwrites_in_place() {
        let store = MemoryRecordStore::new();
        let key = NaturalKey::new("Bihar", "Patna", "2023-24", "May");
        store.insert(&record(key.clone(), 1.0)).await.unwrap();
        store
            .update_by_key(&key, &record(key.clone(), 9.0))
            .await
            .unwrap();

        let stored = store.find_one(&key).await.unwrap().unwrap();
        assert_eq!(stored.metrics.primary_volume, 9.0);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.writes(), 2);
    }

    #[tokio::test]
    async fn memory_store_update_of_missing_key_fails() {
        let store = MemoryRecordStore::new();
        let key = NaturalKey::new("Bihar", "Gaya", "2023-24", "May");
        let err = store
            .update_by_key(&key, &record(key.clone(), 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[test]
    fn volume_source_round_trips_through_column_text() {
        for source in [VolumeSource::Direct, VolumeSource::ComponentSum] {
            assert_eq!(parse_volume_source(volume_source_str(source)), source);
        }
    }
}
