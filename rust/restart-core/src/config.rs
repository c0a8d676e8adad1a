// rust/restart-core/src/config.rs

//! Configuration for checkpoint/restart I/O.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{RestartError, Result};

/// Legacy cap on dataset names, in bytes.
pub const DEFAULT_MAX_NAME_LEN: usize = 512;

// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub engine: EngineConfig,
    pub group: GroupConfig,
    pub layout: LayoutConfig,
}

/// Container format a checkpoint is written in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineBackend {
    /// A directory with one file per dataset.
    #[default]
    Local,
    /// One HDF5 file; needs the `hdf5` feature.
    Hdf5,
}

// Options of the container engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // Container format.
    pub backend: EngineBackend,
    // Directory against which relative container paths are resolved.
    pub base_path: PathBuf,
    // Buffer size in bytes for header I/O.
    pub buffer_size: usize,
    // Whether reads may memory-map dataset files.
    pub use_mmap: bool,
    // Dataset size (bytes) at or above which reads use mmap.
    pub mmap_threshold: u64,
    // Whether written datasets are synced (local) or flushed (HDF5) when
    // closed.
    pub sync_on_close: bool,
}

/// Process-group options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Rank that writes GLOBAL-mode datasets.
    pub canonical_rank: usize,
}

/// How registration treats parts that overlap an earlier part of the same
/// descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Overlap is accepted; later parts win in registration order.
    #[default]
    Allow,
    /// Overlapping registration fails.
    Reject,
}

/// Dataset layout options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Maximum dataset name length in bytes.
    pub max_name_len: usize,
    /// Policy for overlapping SHARD parts on one process.
    pub overlap: OverlapPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: EngineBackend::Local,
            base_path: PathBuf::from("."),
            buffer_size: 64 * 1024, // 64 KB
            use_mmap: true,
            mmap_threshold: 1024 * 1024, // 1 MB
            sync_on_close: true,
        }
    }
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self { canonical_rank: 0 }
    }
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            max_name_len: DEFAULT_MAX_NAME_LEN,
            overlap: OverlapPolicy::Allow,
        }
    }
}

impl FromStr for RestartConfig {
    type Err = RestartError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| RestartError::config_with_source("failed to parse TOML config", e))
    }
}

impl RestartConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed, or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RestartError::resource_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `RST_` and use underscores
    // to separate nested fields. For example:
    // - `RST_ENGINE_BACKEND` overrides `engine.backend` ("local" or "hdf5")
    // - `RST_ENGINE_BASE_PATH` overrides `engine.base_path`
    // - `RST_GROUP_CANONICAL_RANK` overrides `group.canonical_rank`
    // - `RST_LAYOUT_OVERLAP` overrides `layout.overlap` ("allow" or "reject")
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Engine overrides
        if let Ok(val) = std::env::var("RST_ENGINE_BACKEND") {
            match val.to_lowercase().as_str() {
                "local" => self.engine.backend = EngineBackend::Local,
                "hdf5" => self.engine.backend = EngineBackend::Hdf5,
                _ => {} // ignore invalid values
            }
        }
        if let Ok(val) = std::env::var("RST_ENGINE_BASE_PATH") {
            self.engine.base_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("RST_ENGINE_BUFFER_SIZE") {
            if let Ok(v) = val.parse() {
                self.engine.buffer_size = v;
            }
        }
        if let Ok(val) = std::env::var("RST_ENGINE_USE_MMAP") {
            if let Ok(v) = val.parse() {
                self.engine.use_mmap = v;
            }
        }
        if let Ok(val) = std::env::var("RST_ENGINE_MMAP_THRESHOLD") {
            if let Ok(v) = val.parse() {
                self.engine.mmap_threshold = v;
            }
        }
        if let Ok(val) = std::env::var("RST_ENGINE_SYNC_ON_CLOSE") {
            if let Ok(v) = val.parse() {
                self.engine.sync_on_close = v;
            }
        }

        // Group overrides
        if let Ok(val) = std::env::var("RST_GROUP_CANONICAL_RANK") {
            if let Ok(v) = val.parse() {
                self.group.canonical_rank = v;
            }
        }

        // Layout overrides
        if let Ok(val) = std::env::var("RST_LAYOUT_MAX_NAME_LEN") {
            if let Ok(v) = val.parse() {
                self.layout.max_name_len = v;
            }
        }
        if let Ok(val) = std::env::var("RST_LAYOUT_OVERLAP") {
            match val.to_lowercase().as_str() {
                "allow" => self.layout.overlap = OverlapPolicy::Allow,
                "reject" => self.layout.overlap = OverlapPolicy::Reject,
                _ => {} // ignore invalid values
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.engine.buffer_size == 0 {
            return Err(RestartError::config(
                "engine.buffer_size must be greater than 0",
            ));
        }

        if self.layout.max_name_len == 0 {
            return Err(RestartError::config(
                "layout.max_name_len must be greater than 0",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = RestartConfig::default();

        assert_eq!(config.engine.backend, EngineBackend::Local);
        assert_eq!(config.engine.base_path, PathBuf::from("."));
        assert_eq!(config.engine.buffer_size, 64 * 1024);
        assert!(config.engine.use_mmap);
        assert_eq!(config.engine.mmap_threshold, 1024 * 1024);
        assert!(config.engine.sync_on_close);

        assert_eq!(config.group.canonical_rank, 0);

        assert_eq!(config.layout.max_name_len, 512);
        assert_eq!(config.layout.overlap, OverlapPolicy::Allow);
    }

    #[test]
    fn test_default_validates() {
        assert!(RestartConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_str_empty() {
        let config: RestartConfig = "".parse().unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_full() {
        let toml = r#"
            [engine]
            backend = "hdf5"
            base_path = "/scratch/run-42"
            buffer_size = 131072
            use_mmap = false
            mmap_threshold = 2097152
            sync_on_close = false

            [group]
            canonical_rank = 3

            [layout]
            max_name_len = 64
            overlap = "reject"
        "#;

        let config: RestartConfig = toml.parse().unwrap();

        assert_eq!(config.engine.backend, EngineBackend::Hdf5);
        assert_eq!(config.engine.base_path, PathBuf::from("/scratch/run-42"));
        assert_eq!(config.engine.buffer_size, 131072);
        assert!(!config.engine.use_mmap);
        assert_eq!(config.engine.mmap_threshold, 2097152);
        assert!(!config.engine.sync_on_close);
        assert_eq!(config.group.canonical_rank, 3);
        assert_eq!(config.layout.max_name_len, 64);
        assert_eq!(config.layout.overlap, OverlapPolicy::Reject);
    }

    #[test]
    fn test_from_str_partial() {
        let toml = r#"
            [layout]
            overlap = "reject"
        "#;
        let config: RestartConfig = toml.parse().unwrap();

        assert_eq!(config.layout.overlap, OverlapPolicy::Reject);
        // Other fields should be defaults
        assert_eq!(config.layout.max_name_len, 512);
        assert_eq!(config.engine.buffer_size, 64 * 1024);
    }

    #[test]
    fn test_from_str_invalid_toml() {
        let result: std::result::Result<RestartConfig, _> = "engine = [".parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [engine]
            base_path = "/tmp/restart"
            "#
        )
        .unwrap();

        let config = RestartConfig::from_file(file.path()).unwrap();
        assert_eq!(config.engine.base_path, PathBuf::from("/tmp/restart"));
    }

    #[test]
    fn test_from_file_not_found() {
        assert!(RestartConfig::from_file("/nonexistent/restart.toml").is_err());
    }

    #[test]
    fn test_validate_invalid_values() {
        let mut config = RestartConfig::default();
        config.engine.buffer_size = 0;
        assert!(config.validate().is_err());

        let mut config = RestartConfig::default();
        config.layout.max_name_len = 0;
        assert!(config.validate().is_err());
    }

    // Helper to clear all RST_ environment variables for test isolation
    fn clear_rst_env_vars() {
        for (key, _) in std::env::vars() {
            if key.starts_with("RST_") {
                std::env::remove_var(&key);
            }
        }
    }

    // Environment variable tests are combined into a single test to avoid
    // race conditions when tests run in parallel, since env vars are global state.
    #[test]
    fn test_env_overrides() {
        clear_rst_env_vars();

        std::env::set_var("RST_ENGINE_BACKEND", "HDF5");
        std::env::set_var("RST_ENGINE_BASE_PATH", "/env/path");
        std::env::set_var("RST_ENGINE_USE_MMAP", "false");
        std::env::set_var("RST_GROUP_CANONICAL_RANK", "2");
        std::env::set_var("RST_LAYOUT_OVERLAP", "Reject");

        let config = RestartConfig::default().with_env_overrides();

        assert_eq!(config.engine.backend, EngineBackend::Hdf5);
        assert_eq!(config.engine.base_path, PathBuf::from("/env/path"));
        assert!(!config.engine.use_mmap);
        assert_eq!(config.group.canonical_rank, 2);
        assert_eq!(config.layout.overlap, OverlapPolicy::Reject);

        clear_rst_env_vars();

        // Invalid values should be ignored (keep defaults)
        std::env::set_var("RST_ENGINE_BACKEND", "netcdf");
        std::env::set_var("RST_ENGINE_BUFFER_SIZE", "not_a_number");
        std::env::set_var("RST_LAYOUT_OVERLAP", "sometimes");

        let config = RestartConfig::default().with_env_overrides();
        assert_eq!(config.engine.backend, EngineBackend::Local);
        assert_eq!(config.engine.buffer_size, 64 * 1024);
        assert_eq!(config.layout.overlap, OverlapPolicy::Allow);

        clear_rst_env_vars();
    }

    #[test]
    fn test_serialize_roundtrip() {
        let original = RestartConfig::default();
        let toml_str = toml::to_string(&original).unwrap();
        let parsed: RestartConfig = toml_str.parse().unwrap();

        assert_eq!(original.engine.base_path, parsed.engine.base_path);
        assert_eq!(original.layout.overlap, parsed.layout.overlap);
        assert_eq!(original.group.canonical_rank, parsed.group.canonical_rank);
    }
}
