//! Core domain model for REDI: natural keys, canonical records and run summaries.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "redi-core";

/// Provenance tag for records fetched from the upstream API.
pub const SOURCE_TAG_API: &str = "external-api";
/// Provenance tag for records loaded through the offline delimited-file path.
pub const SOURCE_TAG_FILE: &str = "file-import";

/// One upstream record exactly as received: an open key/value object.
pub type RawRecord = serde_json::Map<String, JsonValue>;

/// Auxiliary fields kept alongside the fixed metrics.
pub type ExtendedFields = BTreeMap<String, JsonValue>;

/// Identity of a canonical record. The store enforces uniqueness on this 4-tuple.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    pub region: String,
    pub sub_region: String,
    pub fiscal_year: String,
    pub period: String,
}

impl NaturalKey {
    pub fn new(
        region: impl Into<String>,
        sub_region: impl Into<String>,
        fiscal_year: impl Into<String>,
        period: impl Into<String>,
    ) -> Self {
        Self {
            region: region.into(),
            sub_region: sub_region.into(),
            fiscal_year: fiscal_year.into(),
            period: period.into(),
        }
    }

    pub fn entity(&self) -> EntityKey {
        EntityKey {
            region: self.region.clone(),
            sub_region: self.sub_region.clone(),
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.region, self.sub_region, self.fiscal_year, self.period
        )
    }
}

/// The `{region, sub_region}` pair that downstream cache views are keyed by.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub region: String,
    pub sub_region: String,
}

impl EntityKey {
    pub fn new(region: impl Into<String>, sub_region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            sub_region: sub_region.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.region, self.sub_region)
    }
}

/// Fixed numeric fields of a canonical record. Absent source values default to zero.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Metrics {
    /// Labor-days generated.
    pub primary_volume: f64,
    pub works_completed: f64,
    pub works_in_progress: f64,
    pub payments_made: f64,
    pub amount_spent: f64,
}

/// Which path produced `Metrics::primary_volume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeSource {
    /// A direct source column carried the value.
    #[default]
    Direct,
    /// Reconstructed as the sum of the sub-population components.
    ComponentSum,
}

/// Canonical persisted shape of one ingested observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub key: NaturalKey,
    pub metrics: Metrics,
    #[serde(default)]
    pub extended_fields: ExtendedFields,
    #[serde(default)]
    pub volume_source: VolumeSource,
    pub source_tag: String,
    pub last_updated: DateTime<Utc>,
}

impl CanonicalRecord {
    pub fn entity(&self) -> EntityKey {
        self.key.entity()
    }

    /// True when metrics or extended fields differ. Key, provenance and
    /// timestamps do not count as new information.
    pub fn content_differs(&self, other: &CanonicalRecord) -> bool {
        self.metrics != other.metrics || self.extended_fields != other.extended_fields
    }
}

/// Counters produced by one pass over a raw batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_processed: usize,
    pub total_changed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
    pub stopped_early: bool,
    pub changed_entities: BTreeSet<EntityKey>,
}

impl RunSummary {
    pub fn distinct_entities_changed(&self) -> usize {
        self.changed_entities.len()
    }
}
