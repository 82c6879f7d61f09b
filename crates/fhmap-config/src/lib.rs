//! # fhmap-config
//!
//! Configuration management for the fhmap handle mapper.
//!
//! Loads configuration from:
//! 1. `~/.fhmap/config.toml` (global)
//! 2. `./fhmap.toml` (local, overrides global key by key)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Upper bound on the number of persistence shards.
pub const MAX_SHARDS: u32 = 64;

/// Largest NFSv4 file handle (`NFS4_FHSIZE`).
pub const DEFAULT_MAX_HANDLE_SIZE: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub handle_map: HandleMapConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut table = toml::Table::new();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                merge_tables(&mut table, read_table(&global_path)?);
            }
        }

        let local_path = Path::new("fhmap.toml");
        if local_path.exists() {
            debug!("Loading local config from {:?}", local_path);
            merge_tables(&mut table, read_table(local_path)?);
        }

        let mut config: Config = toml::Value::Table(table).try_into()?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load a single config file, then apply environment overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Global config path: ~/.fhmap/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".fhmap/config.toml"))
    }

    /// Apply `FHMAP_*` overrides looked up through `var`.
    fn apply_overrides<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = var("FHMAP_DB_DIR") {
            self.handle_map.storage_directory = PathBuf::from(dir);
        }
        if let Some(dir) = var("FHMAP_TMP_DIR") {
            self.handle_map.temp_directory = PathBuf::from(dir);
        }
        if let Some(count) = var("FHMAP_DB_COUNT") {
            self.handle_map.shard_count = count.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("FHMAP_DB_COUNT is not a shard count: {:?}", count))
            })?;
        }
        if let Some(level) = var("FHMAP_LOG") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&contents)?)
}

/// Overlay `other` onto `base`; nested tables merge, everything else replaces.
fn merge_tables(base: &mut toml::Table, other: toml::Table) {
    for (key, value) in other {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Handle mapping configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandleMapConfig {
    /// Number of persistence shards. Part of the on-disk layout.
    pub shard_count: u32,
    /// Initial capacity of the in-memory index
    pub index_capacity: usize,
    /// Directory holding one store file per shard
    pub storage_directory: PathBuf,
    /// Scratch directory for the store engine
    pub temp_directory: PathBuf,
    /// Accepted but not implemented: inserts are always write-behind.
    pub synchronous_insert: bool,
    /// Longest real handle accepted by `set_fh`
    pub max_handle_size: usize,
    /// Index entry buffers retained for reuse
    pub entry_prealloc: usize,
    /// Work items preallocated per shard
    pub op_prealloc: usize,
    /// Hard bound on work items outstanding per shard
    pub max_pending_ops: usize,
    /// Map size of each shard store, in MiB
    pub map_size_mb: usize,
}

impl Default for HandleMapConfig {
    fn default() -> Self {
        Self {
            shard_count: 8,
            index_capacity: 1024,
            storage_directory: PathBuf::from("/var/lib/fhmap"),
            temp_directory: PathBuf::from("/var/tmp/fhmap"),
            synchronous_insert: false,
            max_handle_size: DEFAULT_MAX_HANDLE_SIZE,
            entry_prealloc: 1024,
            op_prealloc: 100,
            max_pending_ops: 65536,
            map_size_mb: 256,
        }
    }
}

impl HandleMapConfig {
    /// Reject values `HandleMap::init` cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shard_count == 0 || self.shard_count > MAX_SHARDS {
            return Err(ConfigError::Invalid(format!(
                "shard_count must be in 1..={}, got {}",
                MAX_SHARDS, self.shard_count
            )));
        }
        if self.storage_directory.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("storage_directory is empty".into()));
        }
        if self.temp_directory.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("temp_directory is empty".into()));
        }
        if self.max_handle_size == 0 {
            return Err(ConfigError::Invalid("max_handle_size must be positive".into()));
        }
        if self.max_pending_ops == 0 {
            return Err(ConfigError::Invalid("max_pending_ops must be positive".into()));
        }
        if self.op_prealloc > self.max_pending_ops {
            return Err(ConfigError::Invalid(format!(
                "op_prealloc ({}) exceeds max_pending_ops ({})",
                self.op_prealloc, self.max_pending_ops
            )));
        }
        if self.map_size_mb == 0 {
            return Err(ConfigError::Invalid("map_size_mb must be positive".into()));
        }
        Ok(())
    }

    /// Store map size in bytes
    pub fn map_size_bytes(&self) -> usize {
        self.map_size_mb.saturating_mul(1024 * 1024)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// error, warn, info, debug or trace
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.handle_map.shard_count, 8);
        assert_eq!(config.handle_map.max_handle_size, 128);
        assert!(!config.handle_map.synchronous_insert);
        assert!(config.handle_map.validate().is_ok());
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[handle_map]"));
        assert!(toml_str.contains("[logging]"));
        assert!(toml_str.contains("shard_count = 8"));
    }

    #[test]
    fn test_validate_rejects_bad_shard_count() {
        let mut cfg = HandleMapConfig::default();
        cfg.shard_count = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
        cfg.shard_count = MAX_SHARDS + 1;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
        cfg.shard_count = MAX_SHARDS;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_prealloc_above_bound() {
        let mut cfg = HandleMapConfig::default();
        cfg.op_prealloc = 10;
        cfg.max_pending_ops = 5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_env_overrides_apply() {
        let mut config = Config::default();
        config
            .apply_overrides(|key| match key {
                "FHMAP_DB_DIR" => Some("/srv/hm".to_string()),
                "FHMAP_DB_COUNT" => Some("4".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.handle_map.storage_directory, PathBuf::from("/srv/hm"));
        assert_eq!(config.handle_map.shard_count, 4);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_malformed_shard_count_override_is_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(|key| (key == "FHMAP_DB_COUNT").then(|| "four".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert_eq!(config.handle_map.shard_count, 8);
    }

    #[test]
    fn test_merge_tables_overlays_nested_keys() {
        let mut base: toml::Table = toml::from_str(
            r#"
[handle_map]
shard_count = 4
index_capacity = 64
"#,
        )
        .unwrap();
        let overlay: toml::Table = toml::from_str(
            r#"
[handle_map]
shard_count = 2
"#,
        )
        .unwrap();
        merge_tables(&mut base, overlay);
        let config: Config = toml::Value::Table(base).try_into().unwrap();
        assert_eq!(config.handle_map.shard_count, 2);
        assert_eq!(config.handle_map.index_capacity, 64);
    }
}
