//! Shared server state: the pool, the loaded config and the ingestion
//! pipeline wired to its store and sink.

use std::sync::Arc;

use qalog_core::{IdentityResolver, QaLogConfig, QaLogError};
use qalog_ingest::{
    IngestPipeline, IterationEngine, IterationPolicy, LogSink, PgLogSink, PgSessionStore,
    SessionStateStore,
};
use sqlx::PgPool;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: QaLogConfig,
    pub store: Arc<dyn SessionStateStore>,
    pub pipeline: Arc<IngestPipeline>,
}

impl AppState {
    /// Wire the pipeline over an explicit store and sink. Tests use this with
    /// the in-memory implementations.
    pub fn new(
        pool: PgPool,
        config: QaLogConfig,
        store: Arc<dyn SessionStateStore>,
        sink: Arc<dyn LogSink>,
    ) -> Result<Self, QaLogError> {
        let policy = IterationPolicy::from_config(&config.iteration)?;
        let resolver = IdentityResolver::from_config(&config.identity);
        let engine = IterationEngine::new(Arc::clone(&store), policy);
        let pipeline = Arc::new(IngestPipeline::new(resolver, engine, sink));

        Ok(Self {
            pool,
            config,
            store,
            pipeline,
        })
    }

    /// Production wiring: session state and logs both live in PostgreSQL.
    pub fn postgres(pool: PgPool, config: QaLogConfig) -> Result<Self, QaLogError> {
        let store: Arc<dyn SessionStateStore> = Arc::new(PgSessionStore::new(pool.clone()));
        let sink: Arc<dyn LogSink> = Arc::new(PgLogSink::new(pool.clone()));
        Self::new(pool, config, store, sink)
    }
}
