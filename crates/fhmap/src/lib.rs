//! # fhmap
//!
//! Persistent map between compact NFSv2/v3 handle digests and the full,
//! variable-length NFSv4 handles issued by a backend server.
//!
//! ## Architecture
//!
//! ```text
//!   set_fh / del_fh ──► HandleIndex (authoritative, in memory)
//!          │
//!          └─► ShardRouter ──► Shard[i] queue ──► worker thread ──► store file i
//!   get_fh ──────────► HandleIndex only
//! ```
//!
//! Writes reach the index synchronously and the store asynchronously
//! (write-behind). `HandleMap::flush` is the barrier that waits for every
//! shard to drain; `HandleMap::init` reloads every shard before returning.
//!
//! ## On-disk layout
//!
//! ```text
//! <storage_directory>/
//! ├── handlemap.0        # shard 0 store
//! ├── handlemap.0-lock
//! ├── handlemap.1
//! └── ...
//! ```

pub mod codec;
pub mod digest;
pub mod index;
mod map;
pub mod pool;
pub mod router;
pub mod shard;
pub mod store;

pub use digest::{fh4_hash, Digest, DIGEST_WIRE_LEN, HANDLE_MAPPED};
pub use fhmap_config::{HandleMapConfig, MAX_SHARDS};
pub use index::HandleIndex;
pub use map::{HandleMap, MapStats, ShardStats};
pub use router::{select_shard, ShardRouter};
pub use shard::WorkerStatus;
pub use store::{count_shard_files, shard_file_name, ShardStore};

use std::fmt::Display;

use thiserror::Error;

/// Errors returned by the handle map
#[derive(Error, Debug)]
pub enum MapError {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("system error: {0}")]
    System(String),

    #[error("database error ({context}): {message}")]
    Db { context: String, message: String },

    #[error("stale digest")]
    Stale,

    #[error("mapping already exists")]
    Exists,

    #[error("internal error: {0}")]
    Internal(String),
}

impl MapError {
    pub(crate) fn db(context: impl Into<String>, err: impl Display) -> Self {
        MapError::Db {
            context: context.into(),
            message: err.to_string(),
        }
    }

    pub(crate) fn system(context: impl Display, err: impl Display) -> Self {
        MapError::System(format!("{}: {}", context, err))
    }
}

impl From<fhmap_config::ConfigError> for MapError {
    fn from(err: fhmap_config::ConfigError) -> Self {
        MapError::InvalidParam(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MapError>;
