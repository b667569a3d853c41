//! Configuration for the reporter

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Reporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// First height to scan; overrides the persisted resume height
    pub start_height: Option<u64>,

    /// Explorer configuration
    pub explorer: ExplorerConfig,

    /// Scanner configuration
    pub scanner: ScannerConfig,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Statistics configuration
    pub stats: StatsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/run/reporter"),
            service_name: "rivine-reporter".to_string(),
            start_height: None,
            explorer: ExplorerConfig::default(),
            scanner: ScannerConfig::default(),
            rocksdb: RocksDBConfig::default(),
            stats: StatsConfig::default(),
        }
    }
}

/// Explorer client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplorerConfig {
    /// Explorer base URL
    pub url: String,

    /// User agent sent with every request
    pub user_agent: String,

    /// Request timeout (seconds)
    pub request_timeout_secs: u64,
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:23110".to_string(),
            user_agent: "Rivine-Agent".to_string(),
            request_timeout_secs: 30,
        }
    }
}

/// Scanner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Wait before retrying a height that is not produced yet (seconds)
    pub backoff_secs: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self { backoff_secs: 60 }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 2,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

/// Statistics exporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Flush once this many points are buffered
    pub batch_size: usize,

    /// Periodic flush interval (seconds)
    pub flush_interval_secs: u64,

    /// JSON lines output file; statistics stay in memory when unset
    pub output_path: Option<PathBuf>,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            flush_interval_secs: 10,
            output_path: None,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        Config::default().with_env_overrides()
    }

    /// Apply `REPORTER_*` environment variables on top of this configuration
    pub fn with_env_overrides(mut self) -> crate::Result<Self> {
        if let Ok(data_dir) = std::env::var("REPORTER_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(url) = std::env::var("REPORTER_EXPLORER_URL") {
            self.explorer.url = url;
        }

        if let Ok(height) = std::env::var("REPORTER_START_HEIGHT") {
            let height = height.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid REPORTER_START_HEIGHT '{}': {}", height, e))
            })?;
            self.start_height = Some(height);
        }

        if let Ok(secs) = std::env::var("REPORTER_BACKOFF_SECS") {
            self.scanner.backoff_secs = secs.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid REPORTER_BACKOFF_SECS '{}': {}", secs, e))
            })?;
        }

        if let Ok(path) = std::env::var("REPORTER_STATS_PATH") {
            self.stats.output_path = Some(PathBuf::from(path));
        }

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "rivine-reporter");
        assert_eq!(config.explorer.user_agent, "Rivine-Agent");
        assert_eq!(config.scanner.backoff_secs, 60);
        assert_eq!(config.stats.batch_size, 200);
        assert!(config.start_height.is_none());
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            data_dir = "/tmp/reporter"

            [explorer]
            url = "https://explorer.example.org"

            [scanner]
            backoff_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/reporter"));
        assert_eq!(config.explorer.url, "https://explorer.example.org");
        assert_eq!(config.explorer.request_timeout_secs, 30);
        assert_eq!(config.scanner.backoff_secs, 5);
        assert_eq!(config.stats.flush_interval_secs, 10);
    }
}
