//! Ingest orchestration: upsert, batch processing, snapshots, cache
//! invalidation, the run coordinator and its cron/queue triggers.

use std::sync::Arc;

use anyhow::{Context, Result};
use redi_adapters::{FieldCatalog, Normalizer};
use redi_storage::{
    CacheStore, HttpClientConfig, HttpFetcher, NoopCache, PgRecordStore, RecordStore, RedisCache,
    SnapshotStore,
};
use tracing::{info, warn};

pub mod batch;
pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod import;
pub mod invalidate;
pub mod pipeline;
pub mod queue;
pub mod scheduler;
pub mod snapshot;
pub mod upsert;

pub use batch::{BatchAbort, BatchOptions, BatchOutcome, BatchProcessor};
pub use config::{ConfigError, IngestConfig};
pub use coordinator::{
    CoordinatorStatus, PipelineRunner, RunCoordinator, RunGuard, RunState, TriggerOutcome,
    TriggerSource,
};
pub use daemon::run_daemon;
pub use import::{import_delimited, ImportReport};
pub use invalidate::{CacheInvalidator, CacheKeyRegistry, InvalidationReport};
pub use pipeline::{HttpRecordSource, IngestError, IngestPipeline, RecordSource, RunReport};
pub use queue::{QueueConsumer, QueueJob, WorkQueue, RECURRING_JOB_NAME};
pub use snapshot::{SnapshotOutcome, SnapshotWriter};
pub use upsert::{upsert, UpsertOutcome};

pub const CRATE_NAME: &str = "redi-sync";

pub fn build_normalizer(config: &IngestConfig) -> Result<Normalizer> {
    let catalog = match &config.field_aliases {
        Some(path) => FieldCatalog::with_overrides(path)?,
        None => FieldCatalog::default(),
    };
    Ok(Normalizer::new(catalog))
}

pub fn build_http_source(config: &IngestConfig) -> Result<HttpRecordSource> {
    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout(),
        user_agent: Some(config.user_agent.clone()),
        ..HttpClientConfig::default()
    })?;
    Ok(HttpRecordSource::new(fetcher, config.source_request_url()))
}

pub async fn connect_store(config: &IngestConfig) -> Result<PgRecordStore> {
    PgRecordStore::connect(&config.database_url, config.database_max_connections)
        .await
        .context("connecting to record store")
}

/// Redis when configured and reachable; otherwise a no-op cache.
pub async fn connect_cache(config: &IngestConfig) -> Arc<dyn CacheStore> {
    let Some(url) = &config.redis_url else {
        info!("REDIS_URL not set; cache invalidation disabled");
        return Arc::new(NoopCache);
    };
    match RedisCache::connect(url).await {
        Ok(cache) => Arc::new(cache),
        Err(err) => {
            warn!(error = %err, "cache unreachable; continuing without invalidation");
            Arc::new(NoopCache)
        }
    }
}

/// Wire a pipeline from config around an already-connected store and cache.
pub fn assemble_pipeline(
    config: &IngestConfig,
    source: Arc<dyn RecordSource>,
    store: Arc<dyn RecordStore>,
    cache: Arc<dyn CacheStore>,
) -> Result<IngestPipeline> {
    let normalizer = Arc::new(build_normalizer(config)?);
    let options = config.batch_options();
    Ok(IngestPipeline::new(
        source,
        BatchProcessor::new(normalizer, store),
        SnapshotWriter::new(SnapshotStore::new(&config.snapshot_dir))
            .with_sample_limit(options.sample_limit),
        CacheInvalidator::new(cache, CacheKeyRegistry::new(config.history_windows.clone())),
        options,
    )
    .with_timezone(config.timezone))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_file_extends_normalizer_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("field_aliases.yaml");
        std::fs::write(&path, "aliases:\n  sub_region: [\"Name of District\"]\n").unwrap();

        let mut config = IngestConfig::from_lookup(|_| None).unwrap();
        config.field_aliases = Some(path);
        let normalizer = build_normalizer(&config).unwrap();
        assert!(normalizer
            .catalog()
            .candidates(redi_adapters::CanonicalField::SubRegion)
            .iter()
            .any(|c| c == "Name of District"));
    }

    #[tokio::test]
    async fn missing_redis_url_means_noop_cache() {
        let config = IngestConfig::from_lookup(|_| None).unwrap();
        let cache = connect_cache(&config).await;
        assert!(!cache.delete("district:a:b:current").await.unwrap());
    }
}
