//! Ingestion configuration
//!
//! Defaults, overlaid by environment variables (a `.env` file is honoured),
//! overlaid by command-line flags in `main`.

use serde::{Deserialize, Serialize};

use geotweets_common::types::{SchemaCapabilities, SchemaVersion};
use geotweets_common::{CommonError, Result};

/// Default store URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/geotweets";

/// Default number of successfully applied records per commit.
pub const DEFAULT_COMMIT_INTERVAL: usize = 5000;

/// Default number of shards processed at the same time.
pub const DEFAULT_WORKERS: usize = 4;

/// Default store connection timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Store connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub url: String,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub store: StoreConfig,
    pub commit_interval: usize,
    pub workers: usize,
    pub schema: SchemaVersion,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl IngestConfig {
    /// Load configuration from environment and defaults
    ///
    /// - `DATABASE_URL`
    /// - `GEOTWEETS_CONNECT_TIMEOUT`
    /// - `GEOTWEETS_COMMIT_INTERVAL`
    /// - `GEOTWEETS_WORKERS`
    /// - `GEOTWEETS_SCHEMA` (`legacy` or `current`)
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let schema = match std::env::var("GEOTWEETS_SCHEMA") {
            Ok(s) => s.parse()?,
            Err(_) => SchemaVersion::default(),
        };

        let config = IngestConfig {
            store: StoreConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                connect_timeout_secs: env_parse("GEOTWEETS_CONNECT_TIMEOUT")
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            },
            commit_interval: env_parse("GEOTWEETS_COMMIT_INTERVAL")
                .unwrap_or(DEFAULT_COMMIT_INTERVAL),
            workers: env_parse("GEOTWEETS_WORKERS").unwrap_or(DEFAULT_WORKERS),
            schema,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.url.is_empty() {
            return Err(CommonError::Config("Database URL cannot be empty".to_string()));
        }

        if self.commit_interval == 0 {
            return Err(CommonError::Config(
                "Commit interval must be greater than 0".to_string(),
            ));
        }

        if self.workers == 0 {
            return Err(CommonError::Config("Workers must be greater than 0".to_string()));
        }

        Ok(())
    }

    pub fn capabilities(&self) -> SchemaCapabilities {
        SchemaCapabilities::for_version(self.schema)
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            },
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            workers: DEFAULT_WORKERS,
            schema: SchemaVersion::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = IngestConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.commit_interval, 5000);
        assert!(config.capabilities().media);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = IngestConfig {
            commit_interval: 0,
            ..IngestConfig::default()
        };
        assert!(matches!(config.validate(), Err(CommonError::Config(_))));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = IngestConfig {
            workers: 0,
            ..IngestConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
