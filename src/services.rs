//! Explicitly constructed handles shared by the coordinator, the stage
//! workers, the query engine, and the HTTP server.
//!
//! Nothing here is global: a [`Services`] value is built once at startup
//! (or per test) and cloned into whoever needs it.

use std::sync::Arc;

use anyhow::Result;
use sqlx::SqlitePool;

use crate::blob::{open_blob_store, BlobStore};
use crate::bus::{EventBus, SqliteEventBus};
use crate::config::Config;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::extract::Extractor;
use crate::generation::{create_model, GenerationModel};
use crate::index::{DualIndexer, SqliteFullTextIndex, SqliteVectorIndex};
use crate::metadata::MetadataStore;
use crate::status::StatusAggregator;

#[derive(Clone)]
pub struct Services {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub metadata: MetadataStore,
    pub status: StatusAggregator,
    pub blobs: Arc<dyn BlobStore>,
    pub bus: Arc<dyn EventBus>,
    pub indexer: DualIndexer,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub generator: Arc<dyn GenerationModel>,
    pub extractor: Extractor,
}

impl Services {
    /// Connect to the database, run migrations, and build every adapter the
    /// configuration names.
    pub async fn from_config(config: Config) -> Result<Self> {
        let pool = crate::db::connect(&config).await?;
        crate::migrate::run_migrations(&pool).await?;
        let blobs = open_blob_store(&config)?;
        let embedder = create_provider(&config.embedding)?;
        let generator = create_model(&config.generation)?;
        Ok(Self::from_parts(config, pool, blobs, embedder, generator))
    }

    /// Assemble services around caller-supplied providers. SQLite backs the
    /// metadata store, the bus, and both indexes.
    pub fn from_parts(
        config: Config,
        pool: SqlitePool,
        blobs: Arc<dyn BlobStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn GenerationModel>,
    ) -> Self {
        let indexer = DualIndexer::new(
            Arc::new(SqliteFullTextIndex::new(pool.clone())),
            Arc::new(SqliteVectorIndex::new(pool.clone())),
        );
        Self {
            extractor: Extractor::new(&config.extraction),
            metadata: MetadataStore::new(pool.clone()),
            status: StatusAggregator::new(pool.clone()),
            bus: Arc::new(SqliteEventBus::new(pool.clone())),
            config: Arc::new(config),
            pool,
            blobs,
            indexer,
            embedder,
            generator,
        }
    }
}
