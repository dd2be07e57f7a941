//! Engine configuration
//!
//! Loaded from a TOML file; every field has a default so a partial file is
//! enough.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use tessera_core::{CompressionAlgorithm, CryptoAlgorithm, DEFAULT_BLOCK_SIZE};
use tessera_store::StoreConfig;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// Block store configuration
    #[serde(default)]
    pub store: StoreSettings,

    /// Upload/download pipeline configuration
    #[serde(default)]
    pub pipeline: PipelineSettings,
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load config, using defaults");
                Self::default()
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.block_length == 0 {
            return Err(ConfigError::ValidationError(
                "block_length cannot be 0".to_string(),
            ));
        }
        if self.store.capacity_mb == 0 {
            return Err(ConfigError::ValidationError(
                "store capacity cannot be 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Block store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Directory for the backing file, bitmap and index state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Cache capacity in MB
    #[serde(default = "default_capacity_mb")]
    pub capacity_mb: u64,

    /// Capacity rounding granularity in MB
    #[serde(default = "default_allocation_unit_mb")]
    pub allocation_unit_mb: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            capacity_mb: default_capacity_mb(),
            allocation_unit_mb: default_allocation_unit_mb(),
        }
    }
}

impl StoreSettings {
    /// Convert to tessera_store::StoreConfig
    pub fn to_store_config(&self) -> StoreConfig {
        StoreConfig::new(&self.data_dir)
            .with_capacity(self.capacity_mb * 1024 * 1024)
            .with_allocation_unit(self.allocation_unit_mb * 1024 * 1024)
    }
}

/// Pipeline settings shared by upload and download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Block size content is split into
    #[serde(default = "default_block_length")]
    pub block_length: usize,

    /// Compress content when it helps
    #[serde(default = "default_true")]
    pub compression: bool,

    /// Encrypt content with a key derived from its hash
    #[serde(default = "default_true")]
    pub encryption: bool,

    /// Worker poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            block_length: default_block_length(),
            compression: true,
            encryption: true,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl PipelineSettings {
    pub fn compression_algorithm(&self) -> CompressionAlgorithm {
        if self.compression {
            CompressionAlgorithm::Zstd
        } else {
            CompressionAlgorithm::None
        }
    }

    pub fn crypto_algorithm(&self) -> CryptoAlgorithm {
        if self.encryption {
            CryptoAlgorithm::Aes256Gcm
        } else {
            CryptoAlgorithm::None
        }
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./tessera_data")
}

fn default_capacity_mb() -> u64 {
    8 * 1024
}

fn default_allocation_unit_mb() -> u64 {
    256
}

fn default_block_length() -> usize {
    DEFAULT_BLOCK_SIZE
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.pipeline.block_length, DEFAULT_BLOCK_SIZE);
        assert_eq!(config.store.capacity_mb, 8 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            [store]
            data_dir = "/tmp/tessera"
            capacity_mb = 512

            [pipeline]
            block_length = 65536
            encryption = false
        "#;

        let config: EngineConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.store.data_dir, PathBuf::from("/tmp/tessera"));
        assert_eq!(config.store.capacity_mb, 512);
        assert_eq!(config.pipeline.block_length, 65536);
        assert_eq!(
            config.pipeline.crypto_algorithm(),
            CryptoAlgorithm::None
        );
        assert_eq!(
            config.pipeline.compression_algorithm(),
            CompressionAlgorithm::Zstd
        );
    }

    #[test]
    fn test_zero_block_length_rejected() {
        let config = EngineConfig {
            pipeline: PipelineSettings {
                block_length: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
