//! Configuration for the card ledger

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Integrity audit configuration
    pub audit: AuditConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/card-ledger"),
            service_name: "card-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            rocksdb: RocksDBConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
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

/// Integrity audit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Monetary tolerance for balance reconciliation
    pub balance_epsilon: Decimal,

    /// Upper bound on card audits running at once
    pub max_parallel_cards: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            balance_epsilon: Decimal::new(1, 2), // 0.01
            max_parallel_cards: 64,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.check()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(epsilon) = std::env::var("LEDGER_BALANCE_EPSILON") {
            config.audit.balance_epsilon = epsilon.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid LEDGER_BALANCE_EPSILON {:?}: {}", epsilon, e))
            })?;
        }

        if let Ok(parallel) = std::env::var("LEDGER_MAX_PARALLEL_CARDS") {
            config.audit.max_parallel_cards = parallel.parse().map_err(|e| {
                crate::Error::Config(format!(
                    "Invalid LEDGER_MAX_PARALLEL_CARDS {:?}: {}",
                    parallel, e
                ))
            })?;
        }

        config.check()?;
        Ok(config)
    }

    fn check(&self) -> crate::Result<()> {
        if self.audit.balance_epsilon < Decimal::ZERO {
            return Err(crate::Error::Config(
                "balance_epsilon must not be negative".to_string(),
            ));
        }
        if self.audit.max_parallel_cards == 0 {
            return Err(crate::Error::Config(
                "max_parallel_cards must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
