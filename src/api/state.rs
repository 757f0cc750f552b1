//! Application State
//!
//! Shared state accessible by all API handlers.
//! Wrapped in Arc for thread-safe sharing across async tasks.

use std::sync::Arc;
use std::time::Instant;

use crate::api::error::ApiResult;
use crate::backend::{
    Backends, HttpFunctionService, HttpSearchClient, HttpTimeSeriesConnector, SearchClient,
    StaticDirectory,
};
use crate::config::Config;
use crate::engine::{Executor, ExecutorFactory, WorkerPool};
use crate::query::Compiler;
use crate::warmup::IndexCache;

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// Worker pool every query goes through
    pub pool: Arc<WorkerPool>,
    /// Rollover index cache, when warm-up is enabled
    pub index_cache: Option<Arc<IndexCache>>,
    /// Server start time for uptime tracking
    pub start_time: Instant,
}

impl AppState {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            pool,
            index_cache: None,
            start_time: Instant::now(),
        }
    }

    pub fn with_index_cache(mut self, cache: Arc<IndexCache>) -> Self {
        self.index_cache = Some(cache);
        self
    }

    /// Build the HTTP backends and start the worker pool.
    ///
    /// Must run inside a tokio runtime. The index cache is created but not
    /// started; call [`IndexCache::start`] on it.
    pub fn from_config(config: &Config) -> ApiResult<Self> {
        let limits = config.engine.query_limits()?;
        let compiler = Compiler::new(limits, config.search.limits());

        let search: Arc<dyn SearchClient> = Arc::new(HttpSearchClient::new(
            config.search.url.clone(),
            config.search.credentials(),
            config.search.timeout_ms,
        )?);
        let backends = Backends {
            directory: Arc::new(StaticDirectory::new(
                config.workspace_infos(),
                config.timeseries.fallback_instance(),
                config.timeseries.retention_policy.clone(),
            )),
            timeseries: Arc::new(HttpTimeSeriesConnector::new(
                config.timeseries.instances.clone(),
                config.timeseries.credentials(),
                config.timeseries.timeout_ms,
            )),
            search: search.clone(),
            functions: Arc::new(HttpFunctionService::new(
                config.function.url.clone(),
                config.function.timeout_ms,
            )?),
        };

        let index_cache = config
            .warmup
            .enabled
            .then(|| Arc::new(IndexCache::new(search, config.warmup.to_warmup())));

        let precision = config.timeseries.precision.clone();
        let cache = index_cache.clone();
        let factory: ExecutorFactory = Arc::new(move || {
            Executor::new(backends.clone(), compiler.clone(), cache.clone(), precision.clone())
        });
        let pool = Arc::new(WorkerPool::start(config.engine.pool_config(), factory));

        let state = Self::new(pool);
        Ok(match index_cache {
            Some(cache) => state.with_index_cache(cache),
            None => state,
        })
    }

    /// Get server uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
