//! Integration tests for fhmap-config
//!
//! These tests verify the full config loading pipeline with real file system operations.

use std::path::PathBuf;
use tempfile::tempdir;

/// Test config loading from a real config file
#[test]
fn test_load_config_from_file() {
    let temp = tempdir().unwrap();
    let config_content = r#"
[handle_map]
shard_count = 4
index_capacity = 64
storage_directory = "/tmp/hm"
temp_directory = "/tmp/hm-tmp"
synchronous_insert = true

[logging]
level = "debug"
"#;
    let path = temp.path().join("fhmap.toml");
    std::fs::write(&path, config_content).unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    let config: fhmap_config::Config = toml::from_str(&contents).unwrap();

    assert_eq!(config.handle_map.shard_count, 4);
    assert_eq!(config.handle_map.index_capacity, 64);
    assert_eq!(config.handle_map.storage_directory, PathBuf::from("/tmp/hm"));
    assert_eq!(config.handle_map.temp_directory, PathBuf::from("/tmp/hm-tmp"));
    assert!(config.handle_map.synchronous_insert);
    // Unspecified keys keep their defaults
    assert_eq!(config.handle_map.max_handle_size, 128);
    assert_eq!(config.logging.level, "debug");
}

/// Partial files only override what they name
#[test]
fn test_partial_config_keeps_defaults() {
    let config: fhmap_config::Config = toml::from_str(
        r#"
[handle_map]
shard_count = 2
"#,
    )
    .unwrap();
    let defaults = fhmap_config::HandleMapConfig::default();
    assert_eq!(config.handle_map.shard_count, 2);
    assert_eq!(config.handle_map.max_pending_ops, defaults.max_pending_ops);
    assert_eq!(config.logging.level, "info");
}

/// Malformed values surface as parse errors
#[test]
fn test_malformed_config_is_rejected() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("bad.toml");
    std::fs::write(&path, "[handle_map]\nshard_count = \"four\"\n").unwrap();

    let err = fhmap_config::Config::load_from(&path).unwrap_err();
    assert!(matches!(err, fhmap_config::ConfigError::Toml(_)));
}

/// Test complete config serialization/deserialization cycle
#[test]
fn test_default_toml_reloads() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("config.toml");
    std::fs::write(&path, fhmap_config::Config::default_toml()).unwrap();

    let loaded: fhmap_config::Config =
        toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let original = fhmap_config::Config::default();

    assert_eq!(original.handle_map.shard_count, loaded.handle_map.shard_count);
    assert_eq!(
        original.handle_map.storage_directory,
        loaded.handle_map.storage_directory
    );
    assert_eq!(original.logging.level, loaded.logging.level);
}
