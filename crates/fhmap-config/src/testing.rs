//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - Isolated storage directories
//! - Isolated scratch directories
//! - Ready-made `HandleMapConfig` values pointing at both
//!
//! # Usage
//!
//! ```ignore
//! use fhmap_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     let config = env.config(4);
//!     // config.storage_directory and config.temp_directory are isolated
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::HandleMapConfig;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Directory holding shard stores
    pub storage_dir: PathBuf,
    /// Scratch directory
    pub temp_dir: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let storage_dir = root.join(format!("handlemap-{}", test_id));
        let scratch = root.join("tmp");

        std::fs::create_dir_all(&storage_dir)?;
        std::fs::create_dir_all(&scratch)?;

        Ok(Self {
            _temp_dir: temp_dir,
            storage_dir,
            temp_dir: scratch,
            test_id,
        })
    }

    /// Small-footprint configuration rooted in this environment
    pub fn config(&self, shard_count: u32) -> HandleMapConfig {
        HandleMapConfig {
            shard_count,
            index_capacity: 64,
            storage_directory: self.storage_dir.clone(),
            temp_directory: self.temp_dir.clone(),
            op_prealloc: 16,
            max_pending_ops: 4096,
            entry_prealloc: 64,
            map_size_mb: 16,
            ..HandleMapConfig::default()
        }
    }

    /// Place an arbitrary file in the storage directory
    pub fn create_file(&self, name: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.storage_dir.join(name);
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}
