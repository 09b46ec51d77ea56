//! # Configuration
//!
//! Layered runtime configuration: built-in defaults, then an optional TOML
//! file, then `STRATA_*` environment variables.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use strata_core::StrataError;

/// Environment variables that override file settings.
pub const ENV_DATABASE: &str = "STRATA_DATABASE";
pub const ENV_SCHEMA: &str = "STRATA_SCHEMA";
pub const ENV_SOURCE: &str = "STRATA_SOURCE";
pub const ENV_WORKER_URL: &str = "STRATA_WORKER_URL";
pub const ENV_API_KEY: &str = "STRATA_API_KEY";
pub const ENV_RATE_LIMIT: &str = "STRATA_RATE_LIMIT";
pub const ENV_MAX_INFLIGHT: &str = "STRATA_MAX_INFLIGHT";

/// Template written by `strata init`.
pub const CONFIG_TEMPLATE: &str = r#"# strata configuration

[storage]
# Directory holding state.redb and graph.redb
database = "strata-data"

[schema]
path = "schema.toml"

[monitor]
# JSON fixture served by the source adapter
source = "source.json"
max_claims_per_tick = 1000

[fanout]
branching_cap = 20
concurrency = 100
retry_ceiling = 3
worker_ref = "local"
# worker_url = "http://127.0.0.1:8080"

[queue]
batch_size = 10

[worker]
host = "127.0.0.1"
port = 8080
rate_limit = 100
max_inflight = 64
# api_key = "change-me"
"#;

// =============================================================================
// SECTIONS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("strata-data"),
        }
    }
}

impl StorageConfig {
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.database.join("state.redb")
    }

    #[must_use]
    pub fn graph_path(&self) -> PathBuf {
        self.database.join("graph.redb")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    pub path: PathBuf,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("schema.toml"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub source: PathBuf,
    /// Upper bound on ids claimed by one monitor tick.
    pub max_claims_per_tick: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            source: PathBuf::from("source.json"),
            max_claims_per_tick: 1000,
        }
    }
}

/// Fan-out tree shape and retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FanOutConfig {
    /// Maximum children per branch node.
    pub branching_cap: usize,
    /// Desired number of leaves working at once.
    pub concurrency: usize,
    /// Resubmission rounds for transient failures.
    pub retry_ceiling: usize,
    pub worker_ref: String,
    /// Remote worker entry point. In-process execution when unset.
    pub worker_url: Option<String>,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            branching_cap: 20,
            concurrency: 100,
            retry_ceiling: 3,
            worker_ref: "local".to_string(),
            worker_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { batch_size: 10 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub host: String,
    pub port: u16,
    /// Requests per second across all clients.
    pub rate_limit: u32,
    /// Invocations executing at once.
    pub max_inflight: usize,
    pub api_key: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            rate_limit: 100,
            max_inflight: 64,
            api_key: None,
        }
    }
}

// =============================================================================
// ROOT
// =============================================================================

/// Complete runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    pub storage: StorageConfig,
    pub schema: SchemaConfig,
    pub monitor: MonitorConfig,
    pub fanout: FanOutConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
}

impl StrataConfig {
    /// Parse a TOML document. Missing sections and keys take defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, StrataError> {
        toml::from_str(text).map_err(|e| StrataError::DeserializationError(e.to_string()))
    }

    /// Load configuration from `path` (defaults when `None`) and apply the
    /// process environment on top.
    pub fn load(path: Option<&Path>) -> Result<Self, StrataError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| StrataError::IoError(format!("{}: {e}", path.display())))?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        tracing::debug!(?config, "configuration loaded");
        Ok(config)
    }

    /// Apply overrides from `lookup`. Empty values are ignored.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), StrataError> {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(value) = get(ENV_DATABASE) {
            self.storage.database = PathBuf::from(value);
        }
        if let Some(value) = get(ENV_SCHEMA) {
            self.schema.path = PathBuf::from(value);
        }
        if let Some(value) = get(ENV_SOURCE) {
            self.monitor.source = PathBuf::from(value);
        }
        if let Some(value) = get(ENV_WORKER_URL) {
            self.fanout.worker_url = Some(value);
        }
        if let Some(value) = get(ENV_API_KEY) {
            self.worker.api_key = Some(value);
        }
        if let Some(value) = get(ENV_RATE_LIMIT) {
            self.worker.rate_limit = parse_number(ENV_RATE_LIMIT, &value)?;
        }
        if let Some(value) = get(ENV_MAX_INFLIGHT) {
            self.worker.max_inflight = parse_number(ENV_MAX_INFLIGHT, &value)?;
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, StrataError> {
    value
        .trim()
        .parse()
        .map_err(|_| StrataError::DeserializationError(format!("{name} is not a number: {value}")))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn template_parses_to_defaults() {
        let config = StrataConfig::from_toml_str(CONFIG_TEMPLATE).expect("template");
        assert_eq!(config, StrataConfig::default());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config = StrataConfig::from_toml_str("[fanout]\nconcurrency = 8\n").expect("parse");
        assert_eq!(config.fanout.concurrency, 8);
        assert_eq!(config.fanout.branching_cap, 20);
        assert_eq!(config.queue.batch_size, 10);
    }

    #[test]
    fn environment_overrides_file() {
        let env: BTreeMap<&str, &str> = [
            (ENV_DATABASE, "/var/lib/strata"),
            (ENV_WORKER_URL, "http://worker:8080"),
            (ENV_RATE_LIMIT, "250"),
            (ENV_API_KEY, "   "),
        ]
        .into_iter()
        .collect();
        let mut config = StrataConfig::default();
        config
            .apply_env(|name| env.get(name).map(|v| (*v).to_string()))
            .expect("overrides");

        assert_eq!(config.storage.state_path(), PathBuf::from("/var/lib/strata/state.redb"));
        assert_eq!(config.fanout.worker_url.as_deref(), Some("http://worker:8080"));
        assert_eq!(config.worker.rate_limit, 250);
        assert_eq!(config.worker.api_key, None);
    }

    #[test]
    fn malformed_number_is_rejected() {
        let mut config = StrataConfig::default();
        let result = config.apply_env(|name| (name == ENV_MAX_INFLIGHT).then(|| "many".to_string()));
        assert!(matches!(result, Err(StrataError::DeserializationError(_))));
    }
}
