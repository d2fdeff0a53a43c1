//! Pipeline configuration record.
//!
//! Loading this from environment variables / config files is the
//! CLI's job (an external collaborator per spec.md §1); this crate
//! only owns the shape, so both the CLI and tests can construct one.

use serde::{Deserialize, Serialize};

fn default_cache_enabled() -> bool {
    true
}

fn default_channel_capacity() -> usize {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_base_url() -> String {
    "https://ec.europa.eu/eurostat/api/dissemination".to_string()
}

fn default_metadata_schema() -> String {
    "eurostat_meta".to_string()
}

fn default_data_schema() -> String {
    "eurostat_data".to_string()
}

/// Database coordinates for the target database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbConfig {
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
}

fn default_db_port() -> u16 {
    5432
}

/// The full environment surface of the pipeline: database coordinates,
/// cache settings, the dissemination base URL, and the unlogged
/// staging flag (spec.md §6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub db: DbConfig,

    #[serde(default = "default_metadata_schema")]
    pub metadata_schema: String,

    #[serde(default = "default_data_schema")]
    pub data_schema: String,

    pub cache_root: String,

    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub use_unlogged_staging: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl PipelineConfig {
    /// A config suitable for tests: local cache dir, no real database
    /// coordinates expected to be dialed.
    #[cfg(any(test, feature = "test-util"))]
    pub fn for_tests(cache_root: impl Into<String>) -> Self {
        PipelineConfig {
            db: DbConfig {
                host: "localhost".to_string(),
                port: 5432,
                user: "eurostat".to_string(),
                password: String::new(),
                dbname: "eurostat".to_string(),
            },
            metadata_schema: default_metadata_schema(),
            data_schema: default_data_schema(),
            cache_root: cache_root.into(),
            cache_enabled: true,
            base_url: default_base_url(),
            use_unlogged_staging: false,
            log_level: default_log_level(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_defaults() {
        let json = serde_json::json!({
            "db": {
                "host": "db.internal",
                "user": "eurostat",
                "password": "secret",
                "dbname": "eurostat"
            },
            "cache_root": "/var/cache/eurostat"
        });
        let cfg: PipelineConfig = serde_json::from_value(json).unwrap();
        assert_eq!(cfg.db.port, 5432);
        assert_eq!(cfg.metadata_schema, "eurostat_meta");
        assert!(cfg.cache_enabled);
        assert!(!cfg.use_unlogged_staging);
    }
}
