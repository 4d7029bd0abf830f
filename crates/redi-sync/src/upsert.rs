//! Change-gated upsert against the canonical record store.

use chrono::Utc;
use redi_core::CanonicalRecord;
use redi_storage::{RecordStore, StoreError};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

impl UpsertOutcome {
    pub fn is_change(self) -> bool {
        !matches!(self, UpsertOutcome::Unchanged)
    }
}

/// Write `record` only when it is new or its content differs from what is stored.
///
/// An insert that loses a race to a concurrent writer is retried once as an
/// update against the freshly read row.
pub async fn upsert(
    store: &dyn RecordStore,
    record: &CanonicalRecord,
) -> Result<UpsertOutcome, StoreError> {
    let Some(existing) = store.find_one(&record.key).await? else {
        let mut fresh = record.clone();
        fresh.last_updated = Utc::now();
        return match store.insert(&fresh).await {
            Ok(()) => Ok(UpsertOutcome::Inserted),
            Err(StoreError::Conflict(key)) => {
                debug!(%key, "insert conflicted with a concurrent writer; retrying as update");
                match store.find_one(&record.key).await? {
                    Some(existing) => update_if_changed(store, &existing, record).await,
                    None => Err(StoreError::Backend(format!(
                        "insert for {key} conflicted but no stored record was found"
                    ))),
                }
            }
            Err(err) => Err(err),
        };
    };

    update_if_changed(store, &existing, record).await
}

async fn update_if_changed(
    store: &dyn RecordStore,
    existing: &CanonicalRecord,
    incoming: &CanonicalRecord,
) -> Result<UpsertOutcome, StoreError> {
    if !incoming.content_differs(existing) {
        return Ok(UpsertOutcome::Unchanged);
    }
    let mut updated = incoming.clone();
    updated.last_updated = Utc::now();
    store.update_by_key(&existing.key, &updated).await?;
    Ok(UpsertOutcome::Updated)
}
