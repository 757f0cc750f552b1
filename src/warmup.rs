//! Warm-up index cache
//!
//! Keeps a periodically refreshed list of rollover search indices so
//! document queries can target only the indices covering their time range.
//! Readers get an immutable snapshot and must tolerate stale data.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::backend::{BackendError, IndexInfo, SearchClient};

/// Configuration for the refresh schedule
#[derive(Debug, Clone)]
pub struct WarmupConfig {
    /// Delay before the first refresh
    pub initial_delay_secs: u64,
    /// Time between refreshes
    pub interval_secs: u64,
    pub enabled: bool,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: 5,
            interval_secs: 300,
            enabled: true,
        }
    }
}

/// Rollover indices grouped by base name, oldest first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexSnapshot {
    pub refreshed_at_ms: i64,
    pub indices: BTreeMap<String, Vec<IndexInfo>>,
}

impl IndexSnapshot {
    /// Group rollover names like `ws_logging-000003` under `ws_logging`
    pub fn from_indices(indices: Vec<IndexInfo>, refreshed_at_ms: i64) -> Self {
        let mut grouped: BTreeMap<String, Vec<IndexInfo>> = BTreeMap::new();
        if let Ok(rollover) = Regex::new(r"^(.+)-(\d{6})$") {
            for info in indices {
                let base = rollover
                    .captures(&info.name)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string());
                if let Some(base) = base {
                    grouped.entry(base).or_default().push(info);
                }
            }
        }
        for list in grouped.values_mut() {
            list.sort_by(|a, b| a.created_ms.cmp(&b.created_ms).then(a.name.cmp(&b.name)));
        }
        Self {
            refreshed_at_ms,
            indices: grouped,
        }
    }

    /// Indices of `base` whose lifetime overlaps `[start, end]`.
    ///
    /// Each index covers from its creation until the next one was created.
    pub fn time_range_indices(&self, base: &str, start: Option<i64>, end: Option<i64>) -> Vec<String> {
        let Some(list) = self.indices.get(base) else {
            return Vec::new();
        };
        let start = start.unwrap_or(i64::MIN);
        let end = end.unwrap_or(i64::MAX);
        list.iter()
            .enumerate()
            .filter(|(i, info)| {
                let until = list.get(i + 1).map(|n| n.created_ms).unwrap_or(i64::MAX);
                info.created_ms <= end && until >= start
            })
            .map(|(_, info)| info.name.clone())
            .collect()
    }
}

/// Process-wide cache of search index metadata
pub struct IndexCache {
    search: Arc<dyn SearchClient>,
    config: WarmupConfig,
    snapshot: RwLock<Arc<IndexSnapshot>>,
}

impl IndexCache {
    pub fn new(search: Arc<dyn SearchClient>, config: WarmupConfig) -> Self {
        Self {
            search,
            config,
            snapshot: RwLock::new(Arc::new(IndexSnapshot::default())),
        }
    }

    /// Spawn the refresh loop: initial delay, then a fixed interval
    pub fn start(self: Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.config.enabled {
            tracing::info!("index warm-up disabled");
            return None;
        }

        tracing::info!(
            initial_delay_secs = self.config.initial_delay_secs,
            interval_secs = self.config.interval_secs,
            "starting index warm-up"
        );

        Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(self.config.initial_delay_secs)).await;
            let mut ticker =
                tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
            loop {
                ticker.tick().await;
                match self.refresh().await {
                    Ok(count) => tracing::debug!(indices = count, "index cache refreshed"),
                    Err(e) => tracing::warn!(error = %e, "index cache refresh failed, keeping previous snapshot"),
                }
            }
        }))
    }

    /// List indices and swap in a new snapshot; returns the rollover count
    pub async fn refresh(&self) -> Result<usize, BackendError> {
        let indices = self.search.list_indices().await?;
        let snapshot = IndexSnapshot::from_indices(indices, Utc::now().timestamp_millis());
        let count = snapshot.indices.values().map(Vec::len).sum();
        *self.snapshot.write().await = Arc::new(snapshot);
        Ok(count)
    }

    pub async fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.snapshot.read().await.clone()
    }

    pub async fn time_range_indices(
        &self,
        base: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Vec<String> {
        self.snapshot().await.time_range_indices(base, start, end)
    }
}
