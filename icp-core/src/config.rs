// icp-core/src/config.rs

//! Configuration management for the checkpoint engine.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::checkpoint::format::{MAX_BLOCK_INDEX, MAX_VAR_ID};
use crate::checkpoint::HashFunction;
use crate::error::{IcpError, Result};
use crate::recovery::ResilienceLevel;

// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IcpConfig {
    pub storage: StorageConfig,
    pub incremental: IncrementalConfig,
    pub levels: LevelDirs,
    pub recovery: RecoveryConfig,
}

/// Storage backend type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendType {
    /// Local filesystem storage.
    #[default]
    Local,
    /// In-process storage, mostly useful for tests and dry runs.
    Memory,
}

// Storage configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage backend type: "local" or "memory".
    pub backend: StorageBackendType,
    // Base path for all storage operations.
    pub base_path: PathBuf,
    // Buffer size in bytes for I/O operations.
    pub buffer_size: usize,
    // Whether to use memory-mapped reads (local storage only).
    pub use_mmap: bool,
    // File size threshold (bytes) above which to use mmap (local storage only).
    pub mmap_threshold: u64,
}

/// How checkpoint data is laid out on storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoMode {
    /// Layered files with block-level dedup.
    #[default]
    Incremental,
    /// One complete file per checkpoint.
    Full,
}

/// Incremental checkpointing options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IncrementalConfig {
    pub mode: IoMode,
    /// Size of a dedup block in bytes.
    pub block_size: u64,
    /// Number of layers per base file (layer 0 plus increments).
    pub stack_size: u32,
    /// Hash function used for block digests and layer hashes.
    pub hash_function: HashFunction,
    /// Resilience level the session writes to (1 = local, 4 = global/inline).
    pub level: u8,
    /// Largest variable id accepted by the block meta records.
    pub max_var_id: u32,
    /// Largest block index accepted by the block meta records.
    pub max_block_index: u64,
}

// Directories (relative to the storage base path) for each resilience level.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelDirs {
    pub local: PathBuf,
    pub partner: PathBuf,
    pub erasure: PathBuf,
    pub global: PathBuf,
}

// Recovery validation options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    // Missing files tolerated by the level 3 check; defaults to the group size.
    pub max_erasures: Option<u32>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendType::Local,
            base_path: PathBuf::from("./icp"),
            buffer_size: 64 * 1024, // 64 KB
            use_mmap: true,
            mmap_threshold: 1024 * 1024, // 1 MB
        }
    }
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            mode: IoMode::Incremental,
            block_size: 16 * 1024, // 16 KB
            stack_size: 5,
            hash_function: HashFunction::default(),
            level: 1,
            max_var_id: MAX_VAR_ID,
            max_block_index: MAX_BLOCK_INDEX,
        }
    }
}

impl IncrementalConfig {
    /// Returns the configured target level.
    ///
    /// # Errors
    ///
    /// Returns an error if `level` is not within 1..=4.
    pub fn target_level(&self) -> Result<ResilienceLevel> {
        ResilienceLevel::from_number(self.level).ok_or_else(|| {
            IcpError::config(format!(
                "incremental.level must be between 1 and 4, got {}",
                self.level
            ))
        })
    }
}

impl Default for LevelDirs {
    fn default() -> Self {
        Self {
            local: PathBuf::from("l1"),
            partner: PathBuf::from("l2"),
            erasure: PathBuf::from("l3"),
            global: PathBuf::from("l4"),
        }
    }
}

impl LevelDirs {
    /// Directory holding the files of the given level.
    pub fn dir(&self, level: ResilienceLevel) -> &Path {
        match level {
            ResilienceLevel::Local => &self.local,
            ResilienceLevel::Partner => &self.partner,
            ResilienceLevel::Erasure => &self.erasure,
            ResilienceLevel::Global => &self.global,
        }
    }
}

impl FromStr for IcpConfig {
    type Err = IcpError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| IcpError::config_with_source("failed to parse TOML config", e))
    }
}

fn env_parse<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(val) = std::env::var(key) {
        if let Ok(v) = val.parse() {
            *target = v;
        }
    }
}

impl IcpConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            IcpError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Variables are prefixed with `ICP_` and use underscores to separate
    // nested fields, e.g. `ICP_INCREMENTAL_BLOCK_SIZE` overrides
    // `incremental.block_size`. Unparsable values are ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Storage overrides
        if let Ok(val) = std::env::var("ICP_STORAGE_BACKEND") {
            match val.to_lowercase().as_str() {
                "local" => self.storage.backend = StorageBackendType::Local,
                "memory" => self.storage.backend = StorageBackendType::Memory,
                _ => {} // ignore invalid values
            }
        }
        if let Ok(val) = std::env::var("ICP_STORAGE_BASE_PATH") {
            self.storage.base_path = PathBuf::from(val);
        }
        env_parse("ICP_STORAGE_BUFFER_SIZE", &mut self.storage.buffer_size);
        env_parse("ICP_STORAGE_USE_MMAP", &mut self.storage.use_mmap);
        env_parse("ICP_STORAGE_MMAP_THRESHOLD", &mut self.storage.mmap_threshold);

        // Incremental overrides
        if let Ok(val) = std::env::var("ICP_INCREMENTAL_MODE") {
            match val.to_lowercase().as_str() {
                "incremental" => self.incremental.mode = IoMode::Incremental,
                "full" => self.incremental.mode = IoMode::Full,
                _ => {}
            }
        }
        if let Ok(val) = std::env::var("ICP_INCREMENTAL_HASH_FUNCTION") {
            if let Some(hash) = HashFunction::parse(&val) {
                self.incremental.hash_function = hash;
            }
        }
        env_parse("ICP_INCREMENTAL_BLOCK_SIZE", &mut self.incremental.block_size);
        env_parse("ICP_INCREMENTAL_STACK_SIZE", &mut self.incremental.stack_size);
        env_parse("ICP_INCREMENTAL_LEVEL", &mut self.incremental.level);

        // Level directories
        if let Ok(val) = std::env::var("ICP_LEVELS_LOCAL") {
            self.levels.local = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("ICP_LEVELS_PARTNER") {
            self.levels.partner = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("ICP_LEVELS_ERASURE") {
            self.levels.erasure = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("ICP_LEVELS_GLOBAL") {
            self.levels.global = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("ICP_RECOVERY_MAX_ERASURES") {
            if let Ok(v) = val.parse() {
                self.recovery.max_erasures = Some(v);
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
        if self.storage.buffer_size == 0 {
            return Err(IcpError::config(
                "storage.buffer_size must be greater than 0",
            ));
        }

        let inc = &self.incremental;
        if inc.block_size == 0 {
            return Err(IcpError::config(
                "incremental.block_size must be greater than 0",
            ));
        }
        if inc.block_size > u64::from(u32::MAX) {
            return Err(IcpError::config(
                "incremental.block_size must fit in 32 bits",
            ));
        }
        if inc.stack_size == 0 {
            return Err(IcpError::config(
                "incremental.stack_size must be greater than 0",
            ));
        }
        inc.target_level()?;
        if inc.max_var_id > MAX_VAR_ID {
            return Err(IcpError::config(format!(
                "incremental.max_var_id must be at most {MAX_VAR_ID}"
            )));
        }
        if inc.max_block_index > MAX_BLOCK_INDEX {
            return Err(IcpError::config(format!(
                "incremental.max_block_index must be at most {MAX_BLOCK_INDEX}"
            )));
        }

        for (name, dir) in [
            ("local", &self.levels.local),
            ("partner", &self.levels.partner),
            ("erasure", &self.levels.erasure),
            ("global", &self.levels.global),
        ] {
            if dir.as_os_str().is_empty() {
                return Err(IcpError::config(format!(
                    "levels.{name} must not be empty"
                )));
            }
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
        let config = IcpConfig::default();

        assert_eq!(config.storage.backend, StorageBackendType::Local);
        assert_eq!(config.storage.base_path, PathBuf::from("./icp"));
        assert_eq!(config.storage.buffer_size, 64 * 1024);
        assert!(config.storage.use_mmap);

        assert_eq!(config.incremental.mode, IoMode::Incremental);
        assert_eq!(config.incremental.block_size, 16 * 1024);
        assert_eq!(config.incremental.stack_size, 5);
        assert_eq!(config.incremental.hash_function, HashFunction::Xxhash64);
        assert_eq!(config.incremental.level, 1);
        assert_eq!(config.incremental.max_var_id, MAX_VAR_ID);

        assert_eq!(config.levels.dir(ResilienceLevel::Partner), Path::new("l2"));
        assert!(config.recovery.max_erasures.is_none());
    }

    #[test]
    fn test_default_validates() {
        assert!(IcpConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_str_empty() {
        let config: IcpConfig = "".parse().unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_full() {
        let toml = r#"
            [storage]
            backend = "memory"
            base_path = "/scratch/ckpt"
            buffer_size = 131072
            use_mmap = false

            [incremental]
            mode = "full"
            block_size = 4096
            stack_size = 3
            hash_function = "blake3"
            level = 4

            [levels]
            global = "/pfs/global"

            [recovery]
            max_erasures = 2
        "#;

        let config: IcpConfig = toml.parse().unwrap();

        assert_eq!(config.storage.backend, StorageBackendType::Memory);
        assert_eq!(config.storage.base_path, PathBuf::from("/scratch/ckpt"));
        assert!(!config.storage.use_mmap);
        assert_eq!(config.incremental.mode, IoMode::Full);
        assert_eq!(config.incremental.block_size, 4096);
        assert_eq!(config.incremental.stack_size, 3);
        assert_eq!(config.incremental.hash_function, HashFunction::Blake3);
        assert_eq!(
            config.incremental.target_level().unwrap(),
            ResilienceLevel::Global
        );
        assert_eq!(config.levels.global, PathBuf::from("/pfs/global"));
        assert_eq!(config.levels.local, PathBuf::from("l1"));
        assert_eq!(config.recovery.max_erasures, Some(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_invalid_toml() {
        let result: std::result::Result<IcpConfig, _> = "invalid = [".parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [incremental]
            block_size = 64
            "#
        )
        .unwrap();

        let config = IcpConfig::from_file(file.path()).unwrap();
        assert_eq!(config.incremental.block_size, 64);
    }

    #[test]
    fn test_from_file_not_found() {
        assert!(IcpConfig::from_file("/nonexistent/icp.toml").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = IcpConfig::default();
        config.incremental.block_size = 0;
        assert!(config.validate().is_err());

        let mut config = IcpConfig::default();
        config.incremental.stack_size = 0;
        assert!(config.validate().is_err());

        let mut config = IcpConfig::default();
        config.incremental.level = 5;
        assert!(config.validate().is_err());

        let mut config = IcpConfig::default();
        config.incremental.max_var_id = MAX_VAR_ID + 1;
        assert!(config.validate().is_err());

        let mut config = IcpConfig::default();
        config.storage.buffer_size = 0;
        assert!(config.validate().is_err());

        let mut config = IcpConfig::default();
        config.levels.erasure = PathBuf::new();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("levels.erasure"));
    }

    // Helper to clear all ICP_ environment variables for test isolation
    fn clear_icp_env_vars() {
        for (key, _) in std::env::vars() {
            if key.starts_with("ICP_") {
                std::env::remove_var(&key);
            }
        }
    }

    // Environment variables are process-global, so all override cases live
    // in a single test.
    #[test]
    fn test_env_overrides() {
        clear_icp_env_vars();

        std::env::set_var("ICP_STORAGE_BASE_PATH", "/env/path");
        std::env::set_var("ICP_STORAGE_BACKEND", "memory");
        std::env::set_var("ICP_INCREMENTAL_BLOCK_SIZE", "512");
        std::env::set_var("ICP_INCREMENTAL_HASH_FUNCTION", "crc32");
        std::env::set_var("ICP_INCREMENTAL_MODE", "full");
        std::env::set_var("ICP_RECOVERY_MAX_ERASURES", "3");

        let config = IcpConfig::default().with_env_overrides();

        assert_eq!(config.storage.base_path, PathBuf::from("/env/path"));
        assert_eq!(config.storage.backend, StorageBackendType::Memory);
        assert_eq!(config.incremental.block_size, 512);
        assert_eq!(config.incremental.hash_function, HashFunction::Crc32);
        assert_eq!(config.incremental.mode, IoMode::Full);
        assert_eq!(config.recovery.max_erasures, Some(3));

        clear_icp_env_vars();

        std::env::set_var("ICP_INCREMENTAL_STACK_SIZE", "not_a_number");
        let config = IcpConfig::default().with_env_overrides();
        assert_eq!(config.incremental.stack_size, 5);

        clear_icp_env_vars();
    }

    #[test]
    fn test_serialize_roundtrip() {
        let original = IcpConfig::default();
        let toml_str = toml::to_string(&original).unwrap();
        let parsed: IcpConfig = toml_str.parse().unwrap();

        assert_eq!(original.storage.base_path, parsed.storage.base_path);
        assert_eq!(original.incremental.block_size, parsed.incremental.block_size);
        assert_eq!(original.incremental.hash_function, parsed.incremental.hash_function);
    }
}
