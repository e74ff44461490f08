//! Configuration types for lobstore
//!
//! A [`StoreConfig`] describes the geometry used when formatting a store and
//! the cache settings used whenever a store is opened.

use crate::error::{Error, Result};
use crate::types::Geometry;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Write policy for dirty blocks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WritePolicy {
    /// Keep written blocks dirty in the cache; write them back on eviction
    /// or sync (default)
    #[default]
    WriteBack,
    /// Write every modified block back before the write call returns
    WriteThrough,
}

/// Store configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Block size in bytes (power of two)
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    /// Fragments per block (power of two)
    #[serde(default = "default_fragments_per_block")]
    pub fragments_per_block: u32,
    /// Number of blocks on a freshly formatted medium, metadata included
    #[serde(default = "default_capacity_blocks")]
    pub capacity_blocks: u64,
    /// Number of blocks held by the block cache
    #[serde(default = "default_cache_blocks")]
    pub cache_blocks: usize,
    /// Write policy for dirty blocks
    #[serde(default)]
    pub write_policy: WritePolicy,
}

fn default_block_size() -> u32 {
    64 * 1024
}

fn default_fragments_per_block() -> u32 {
    8
}

fn default_capacity_blocks() -> u64 {
    16 * 1024 // 1 GiB at the default block size
}

fn default_cache_blocks() -> usize {
    256
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            fragments_per_block: default_fragments_per_block(),
            capacity_blocks: default_capacity_blocks(),
            cache_blocks: default_cache_blocks(),
            write_policy: WritePolicy::default(),
        }
    }
}

impl StoreConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| Error::configuration(format!("invalid store config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Check the configuration and return the geometry it describes
    pub fn validate(&self) -> Result<Geometry> {
        let geometry = Geometry::new(self.block_size, self.fragments_per_block)
            .map_err(|e| Error::configuration(e.to_string()))?;
        if self.cache_blocks < 2 {
            return Err(Error::configuration(format!(
                "cache must hold at least 2 blocks, got {}",
                self.cache_blocks
            )));
        }
        if self.capacity_blocks < 2 {
            return Err(Error::configuration(format!(
                "store must have at least 2 blocks, got {}",
                self.capacity_blocks
            )));
        }
        Ok(geometry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.block_size, 65536);
        assert_eq!(config.write_policy, WritePolicy::WriteBack);

        let geometry = config.validate().unwrap();
        assert_eq!(geometry.fragment_size(), 8192);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = StoreConfig::from_toml_str(
            r#"
            block_size = 8192
            write_policy = "write-through"
            "#,
        )
        .unwrap();
        assert_eq!(config.block_size, 8192);
        assert_eq!(config.fragments_per_block, 8);
        assert_eq!(config.cache_blocks, 256);
        assert_eq!(config.write_policy, WritePolicy::WriteThrough);
    }

    #[test]
    fn test_invalid_geometry_rejected() {
        let err = StoreConfig::from_toml_str("block_size = 5000").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_tiny_cache_rejected() {
        let config = StoreConfig {
            cache_blocks: 1,
            ..StoreConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cache_blocks = 16").unwrap();

        let config = StoreConfig::load(file.path()).unwrap();
        assert_eq!(config.cache_blocks, 16);
    }
}
