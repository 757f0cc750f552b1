//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and `DQL_*` environment variable overrides.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::backend::{Credentials, WorkspaceInfo};
use crate::engine::PoolConfig;
use crate::query::{parse_duration, QueryLimits, SearchLimits};
use crate::warmup::WarmupConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub timeseries: TimeSeriesConfig,

    #[serde(default)]
    pub workspaces: Vec<WorkspaceConfig>,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub function: FunctionConfig,

    #[serde(default)]
    pub warmup: WarmupSection,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// API server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest accepted request body in bytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8390
}

fn default_max_body_size() -> usize {
    4 * 1024 * 1024 // 4 MB
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_size: default_max_body_size(),
        }
    }
}

impl ApiConfig {
    /// Socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Worker pool and query limits
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub workers: usize,
    pub debug_workers: usize,
    pub backup_workers: usize,
    pub query_timeout_secs: u64,
    pub restart_backoff_ms: u64,
    pub max_restart_backoff_ms: u64,
    pub default_limit: i64,
    pub max_limit: i64,
    pub default_slimit: i64,
    pub max_slimit: i64,
    /// Longest range a query may cover, e.g. `30d`; empty means unbounded
    pub max_duration: String,
    pub default_auto_points: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        let limits = QueryLimits::default();
        Self {
            workers: pool.workers,
            debug_workers: pool.debug_workers,
            backup_workers: pool.backup_workers,
            query_timeout_secs: pool.query_timeout_secs,
            restart_backoff_ms: pool.restart_backoff_ms,
            max_restart_backoff_ms: pool.max_restart_backoff_ms,
            default_limit: limits.default_limit,
            max_limit: limits.max_limit,
            default_slimit: limits.default_slimit,
            max_slimit: limits.max_slimit,
            max_duration: String::new(),
            default_auto_points: limits.default_auto_points,
        }
    }
}

impl EngineConfig {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.workers,
            debug_workers: self.debug_workers,
            backup_workers: self.backup_workers,
            query_timeout_secs: self.query_timeout_secs,
            restart_backoff_ms: self.restart_backoff_ms,
            max_restart_backoff_ms: self.max_restart_backoff_ms,
        }
    }

    pub fn query_limits(&self) -> Result<QueryLimits, ConfigError> {
        let max_duration_ms = if self.max_duration.is_empty() {
            None
        } else {
            let ms = parse_duration(&self.max_duration).map_err(|e| ConfigError::Invalid {
                field: "engine.max_duration".into(),
                error: e.to_string(),
            })?;
            Some(ms)
        };
        Ok(QueryLimits {
            default_limit: self.default_limit,
            max_limit: self.max_limit,
            default_slimit: self.default_slimit,
            max_slimit: self.max_slimit,
            max_duration_ms,
            default_auto_points: self.default_auto_points,
        })
    }
}

/// Time-series store instances
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeSeriesConfig {
    /// Instance name to base URL
    pub instances: HashMap<String, String>,
    /// Instance for workspaces missing from `[[workspaces]]`; empty rejects them
    pub default_instance: String,
    pub retention_policy: String,
    /// Timestamp precision requested from the store
    pub precision: String,
    pub timeout_ms: u64,
    pub username: String,
    pub password: String,
}

impl Default for TimeSeriesConfig {
    fn default() -> Self {
        let mut instances = HashMap::new();
        instances.insert("default".to_string(), "http://localhost:8086".to_string());
        Self {
            instances,
            default_instance: "default".to_string(),
            retention_policy: "autogen".to_string(),
            precision: "ms".to_string(),
            timeout_ms: 30_000,
            username: String::new(),
            password: String::new(),
        }
    }
}

impl TimeSeriesConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    pub fn fallback_instance(&self) -> Option<String> {
        if self.default_instance.is_empty() {
            None
        } else {
            Some(self.default_instance.clone())
        }
    }
}

/// One `[[workspaces]]` entry
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkspaceConfig {
    pub workspace: String,
    pub database: String,
    pub instance: String,
    #[serde(default)]
    pub retention_policy: Option<String>,
}

impl WorkspaceConfig {
    pub fn to_info(&self, default_retention_policy: &str) -> WorkspaceInfo {
        WorkspaceInfo {
            workspace: self.workspace.clone(),
            database: self.database.clone(),
            instance: self.instance.clone(),
            retention_policy: self
                .retention_policy
                .clone()
                .unwrap_or_else(|| default_retention_policy.to_string()),
        }
    }
}

/// Search cluster
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SearchConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub timeout_ms: u64,
    pub max_limit: i64,
    pub max_offset: i64,
    pub max_group_size: i64,
    pub max_bucket_depth: usize,
    pub max_buckets: i64,
    pub default_group_size: i64,
    pub default_limit: i64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        let limits = SearchLimits::default();
        Self {
            url: "http://localhost:9200".to_string(),
            username: String::new(),
            password: String::new(),
            timeout_ms: 30_000,
            max_limit: limits.max_limit,
            max_offset: limits.max_offset,
            max_group_size: limits.max_group_size,
            max_bucket_depth: limits.max_bucket_depth,
            max_buckets: limits.max_buckets,
            default_group_size: limits.default_group_size,
            default_limit: limits.default_limit,
        }
    }
}

impl SearchConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    pub fn limits(&self) -> SearchLimits {
        SearchLimits {
            max_limit: self.max_limit,
            max_offset: self.max_offset,
            max_group_size: self.max_group_size,
            max_bucket_depth: self.max_bucket_depth,
            max_buckets: self.max_buckets,
            default_group_size: self.default_group_size,
            default_limit: self.default_limit,
        }
    }
}

/// Function-execution service
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FunctionConfig {
    pub url: String,
    pub timeout_ms: u64,
}

impl Default for FunctionConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8088".to_string(),
            timeout_ms: 60_000,
        }
    }
}

/// Index warm-up schedule
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WarmupSection {
    pub enabled: bool,
    pub initial_delay_secs: u64,
    pub interval_secs: u64,
}

impl Default for WarmupSection {
    fn default() -> Self {
        let defaults = WarmupConfig::default();
        Self {
            enabled: defaults.enabled,
            initial_delay_secs: defaults.initial_delay_secs,
            interval_secs: defaults.interval_secs,
        }
    }
}

impl WarmupSection {
    pub fn to_warmup(&self) -> WarmupConfig {
        WarmupConfig {
            initial_delay_secs: self.initial_delay_secs,
            interval_secs: self.interval_secs,
            enabled: self.enabled,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("dql-engine").join("config.toml")),
            Some(PathBuf::from("/etc/dql-engine/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Workspace table for the directory
    pub fn workspace_infos(&self) -> Vec<WorkspaceInfo> {
        self.workspaces
            .iter()
            .map(|w| w.to_info(&self.timeseries.retention_policy))
            .collect()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        // API overrides
        if let Some(host) = var("DQL_API_HOST") {
            self.api.host = host;
        }
        if let Some(p) = var("DQL_API_PORT").and_then(|v| v.parse().ok()) {
            self.api.port = p;
        }

        // Engine overrides
        if let Some(n) = var("DQL_WORKERS").and_then(|v| v.parse().ok()) {
            self.engine.workers = n;
        }
        if let Some(secs) = var("DQL_QUERY_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.engine.query_timeout_secs = secs;
        }

        // Backend overrides
        if let Some(url) = var("DQL_TIMESERIES_URL") {
            let instance = if self.timeseries.default_instance.is_empty() {
                "default".to_string()
            } else {
                self.timeseries.default_instance.clone()
            };
            self.timeseries.instances.insert(instance.clone(), url);
            self.timeseries.default_instance = instance;
        }
        if let Some(url) = var("DQL_SEARCH_URL") {
            self.search.url = url;
        }
        if let Some(url) = var("DQL_FUNCTION_URL") {
            self.function.url = url;
        }

        // Logging overrides
        if let Some(level) = var("DQL_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("DQL_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid value for {field}: {error}")]
    Invalid { field: String, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# DQL Engine Configuration
#
# Environment variables override these settings:
# - DQL_API_HOST
# - DQL_API_PORT
# - DQL_WORKERS
# - DQL_QUERY_TIMEOUT_SECS
# - DQL_TIMESERIES_URL
# - DQL_SEARCH_URL
# - DQL_FUNCTION_URL
# - DQL_LOG_LEVEL
# - DQL_LOG_FORMAT

[api]
host = "0.0.0.0"
port = 8390

# Largest accepted request body (bytes)
max_body_size = 4194304

[engine]
# Workers per queue family
workers = 4
debug_workers = 1
backup_workers = 1

# Upper bound on one submission, queue wait included
query_timeout_secs = 30

# Crashed workers restart after an exponentially growing delay (0 = immediately)
restart_backoff_ms = 100
max_restart_backoff_ms = 10000

default_limit = 1000
max_limit = 10000
default_slimit = 20
max_slimit = 100

# Longest range a query may cover, e.g. "30d"; empty means unbounded
max_duration = ""

# Points per series when a query asks for an auto resolution
default_auto_points = 360

[timeseries]
# Workspaces not listed below use this instance with database = workspace
default_instance = "default"
retention_policy = "autogen"
precision = "ms"
timeout_ms = 30000
username = ""
password = ""

[timeseries.instances]
default = "http://localhost:8086"

# [[workspaces]]
# workspace = "wksp_1"
# database = "db_wksp_1"
# instance = "default"
# retention_policy = "rp30d"

[search]
url = "http://localhost:9200"
username = ""
password = ""
timeout_ms = 30000
max_limit = 10000
max_offset = 10000
max_group_size = 10000
max_bucket_depth = 3
max_buckets = 10000
default_group_size = 10
default_limit = 1000

[function]
url = "http://localhost:8088"
timeout_ms = 60000

[warmup]
# Periodically list rollover indices so document queries hit only the ones they need
enabled = true
initial_delay_secs = 5
interval_secs = 300

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_parses() {
        let config: Config = toml::from_str(&generate_default_config()).unwrap();
        assert_eq!(config.api.port, 8390);
        assert_eq!(config.engine.workers, 4);
        assert_eq!(config.timeseries.instances["default"], "http://localhost:8086");
        assert_eq!(config.search.limits(), SearchLimits::default());
        assert_eq!(config.engine.query_limits().unwrap(), QueryLimits::default());
        assert!(config.workspaces.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[engine]
workers = 8
max_duration = "7d"

[[workspaces]]
workspace = "ws1"
database = "db1"
instance = "east"

[[workspaces]]
workspace = "ws2"
database = "db2"
instance = "west"
retention_policy = "rp30d"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.engine.workers, 8);
        assert_eq!(config.engine.debug_workers, 1);
        assert_eq!(
            config.engine.query_limits().unwrap().max_duration_ms,
            Some(7 * 24 * 3600 * 1000)
        );

        let infos = config.workspace_infos();
        assert_eq!(infos[0].retention_policy, "autogen");
        assert_eq!(infos[1].retention_policy, "rp30d");
        assert_eq!(infos[1].instance, "west");
    }

    #[test]
    fn test_load_errors() {
        let missing = Config::load(Path::new("/nonexistent/dql.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));

        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[engine\nworkers = ").unwrap();
        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_bad_duration_rejected() {
        let engine = EngineConfig {
            max_duration: "forever".into(),
            ..Default::default()
        };
        assert!(matches!(engine.query_limits(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("DQL_API_PORT", "9000"),
            ("DQL_WORKERS", "2"),
            ("DQL_TIMESERIES_URL", "http://ts:8086"),
            ("DQL_LOG_FORMAT", "json"),
            ("DQL_QUERY_TIMEOUT_SECS", "not a number"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.api.port, 9000);
        assert_eq!(config.engine.workers, 2);
        assert_eq!(config.engine.query_timeout_secs, 30);
        assert_eq!(config.timeseries.instances["default"], "http://ts:8086");
        assert_eq!(config.logging.format, "json");
    }
}
