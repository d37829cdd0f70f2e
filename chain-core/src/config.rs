//! Configuration for the chain core

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Lock configuration
    pub lock: LockConfig,

    /// Traversal configuration
    pub traversal: TraversalConfig,

    /// Recovery configuration
    pub recovery: RecoveryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "chain-core".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            lock: LockConfig::default(),
            traversal: TraversalConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

/// Lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Deadline for write-lock acquisition (milliseconds); None blocks forever
    ///
    /// Expiry surfaces as a distinct timeout error, never silent success.
    pub write_deadline_ms: Option<u64>,

    /// Emit per-acquisition trace events
    pub trace_lifecycle: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            write_deadline_ms: Some(30_000), // 30s: stuck writers should fail loudly
            trace_lifecycle: false,
        }
    }
}

/// Traversal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraversalConfig {
    /// Default batch size (blocks)
    pub default_batch_size: usize,

    /// Maximum accepted batch size
    pub max_batch_size: usize,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 100,
            max_batch_size: 10_000,
        }
    }
}

/// Recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Permit destructive tail truncation during recovery
    pub allow_rollback: bool,

    /// Maximum corrupted references kept in a diagnostic
    pub corrupted_sample_limit: usize,

    /// Directory for partial-chain export files
    pub export_dir: PathBuf,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            allow_rollback: true,
            corrupted_sample_limit: 25,
            export_dir: PathBuf::from("./data/exports"),
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
        let mut config = Config::default();

        if let Ok(ms) = std::env::var("CHAIN_WRITE_DEADLINE_MS") {
            let ms: u64 = ms
                .parse()
                .map_err(|_| crate::Error::Config("CHAIN_WRITE_DEADLINE_MS must be an integer".to_string()))?;
            config.lock.write_deadline_ms = if ms == 0 { None } else { Some(ms) };
        }

        if let Ok(size) = std::env::var("CHAIN_BATCH_SIZE") {
            config.traversal.default_batch_size = size
                .parse()
                .map_err(|_| crate::Error::Config("CHAIN_BATCH_SIZE must be an integer".to_string()))?;
        }

        if let Ok(dir) = std::env::var("CHAIN_EXPORT_DIR") {
            config.recovery.export_dir = PathBuf::from(dir);
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "chain-core");
        assert_eq!(config.traversal.default_batch_size, 100);
        assert!(config.recovery.allow_rollback);
    }

    #[test]
    fn test_from_toml() {
        let toml = r#"
            service_name = "chain-core-test"
            service_version = "0.0.0"

            [lock]
            write_deadline_ms = 5000
            trace_lifecycle = true

            [traversal]
            default_batch_size = 50
            max_batch_size = 500

            [recovery]
            allow_rollback = false
            corrupted_sample_limit = 10
            export_dir = "/tmp/exports"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.lock.write_deadline_ms, Some(5000));
        assert!(!config.recovery.allow_rollback);
        assert_eq!(config.traversal.default_batch_size, 50);
    }
}
