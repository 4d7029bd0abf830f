//! Change-gated cache invalidation for entities touched by a run.

use std::collections::BTreeSet;
use std::sync::Arc;

use redi_core::EntityKey;
use redi_storage::CacheStore;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Every cache key a read path may have derived for an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeyRegistry {
    history_windows: Vec<u32>,
}

impl Default for CacheKeyRegistry {
    fn default() -> Self {
        Self::new([3, 6, 12])
    }
}

impl CacheKeyRegistry {
    pub fn new(history_windows: impl IntoIterator<Item = u32>) -> Self {
        let mut windows = Vec::new();
        for months in history_windows {
            if !windows.contains(&months) {
                windows.push(months);
            }
        }
        Self {
            history_windows: windows,
        }
    }

    pub fn current_key(entity: &EntityKey) -> String {
        format!("district:{}:{}:current", entity.region, entity.sub_region)
    }

    pub fn compare_key(entity: &EntityKey) -> String {
        format!("state:{}:compare:{}", entity.region, entity.sub_region)
    }

    pub fn history_key(entity: &EntityKey, months: u32) -> String {
        format!(
            "district:{}:{}:history:{months}",
            entity.region, entity.sub_region
        )
    }

    pub fn keys_for(&self, entity: &EntityKey) -> Vec<String> {
        let mut keys = vec![Self::current_key(entity), Self::compare_key(entity)];
        keys.extend(
            self.history_windows
                .iter()
                .map(|months| Self::history_key(entity, *months)),
        );
        keys
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub entities: usize,
    pub attempted: usize,
    pub deleted: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct CacheInvalidator {
    cache: Arc<dyn CacheStore>,
    registry: CacheKeyRegistry,
}

impl CacheInvalidator {
    pub fn new(cache: Arc<dyn CacheStore>, registry: CacheKeyRegistry) -> Self {
        Self { cache, registry }
    }

    /// Best-effort delete of every derived key; a failed delete never stops the rest.
    pub async fn invalidate(&self, entities: &BTreeSet<EntityKey>) -> InvalidationReport {
        let mut report = InvalidationReport {
            entities: entities.len(),
            ..InvalidationReport::default()
        };
        if entities.is_empty() {
            debug!("no changed entities; cache left untouched");
            return report;
        }

        for entity in entities {
            for key in self.registry.keys_for(entity) {
                report.attempted += 1;
                match self.cache.delete(&key).await {
                    Ok(true) => report.deleted += 1,
                    Ok(false) => {}
                    Err(err) => {
                        report.failed += 1;
                        warn!(
                            region = %entity.region,
                            sub_region = %entity.sub_region,
                            %key,
                            error = %err,
                            "cache invalidation failed"
                        );
                    }
                }
            }
        }

        info!(
            entities = report.entities,
            attempted = report.attempted,
            deleted = report.deleted,
            failed = report.failed,
            "cache invalidated"
        );
        report
    }
}
