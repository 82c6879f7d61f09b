//! Per-shard persistent store.
//!
//! Each shard owns one LMDB environment in a single file named
//! `handlemap.<index>` inside the storage directory (plus the
//! `handlemap.<index>-lock` companion LMDB creates). Two databases live in it:
//!
//! - `handles`: 12-byte digest key → hex-encoded handle
//! - `meta`: codec identifier and the shard index the file was created for
//!
//! A store is only ever touched by its shard's worker thread.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use fhmap_config::log_shard_warn;
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvFlags, EnvOpenOptions};

use crate::codec::{self, CodecError, HANDLE_CODEC};
use crate::digest::{Digest, DIGEST_KEY_LEN};
use crate::{MapError, Result};

/// File name prefix shared by all shard stores.
pub const SHARD_FILE_PREFIX: &str = "handlemap";

const META_CODEC: &str = "codec";
const META_SHARD: &str = "shard_index";

/// Store file name for shard `index`.
pub fn shard_file_name(index: usize) -> String {
    format!("{}.{}", SHARD_FILE_PREFIX, index)
}

/// Count shard store files in `dir`.
///
/// Only names of the exact form `handlemap.<decimal>` are counted, so lock
/// companions and unrelated files are ignored. A missing directory counts
/// as zero.
pub fn count_shard_files(dir: &Path) -> io::Result<usize> {
    Ok(shard_file_indices(dir)?.len())
}

/// Sorted shard indices of the store files present in `dir`.
pub fn shard_file_indices(dir: &Path) -> io::Result<Vec<usize>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut indices = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(index) = parse_shard_file_name(name) {
            if entry.file_type()?.is_file() {
                indices.push(index);
            }
        }
    }
    indices.sort_unstable();
    Ok(indices)
}

fn parse_shard_file_name(name: &str) -> Option<usize> {
    let digits = name
        .strip_prefix(SHARD_FILE_PREFIX)?
        .strip_prefix('.')
        .filter(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))?;
    digits.parse().ok()
}

/// Outcome of a full scan of a store.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    /// Rows handed to the visitor
    pub rows: u64,
    /// Malformed rows left out
    pub skipped: u64,
}

/// One raw row, as returned by [`ShardStore::dump`].
#[derive(Debug, Clone)]
pub struct DumpRow {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Decoded digest and handle, or why the row cannot be used
    pub decoded: std::result::Result<(Digest, Vec<u8>), RowFault>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFault {
    BadKey(usize),
    BadValue(CodecError),
}

impl std::fmt::Display for RowFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RowFault::BadKey(len) => write!(f, "key is {} bytes, expected {}", len, DIGEST_KEY_LEN),
            RowFault::BadValue(e) => write!(f, "{}", e),
        }
    }
}

pub struct ShardStore {
    env: Env,
    handles: Database<Bytes, Bytes>,
    meta: Database<Str, Str>,
    index: usize,
    path: PathBuf,
}

impl ShardStore {
    /// Open (creating if needed) the store for shard `index` under `dir`.
    pub fn open(dir: &Path, index: usize, map_size: usize) -> Result<Self> {
        let path = dir.join(shard_file_name(index));
        let ctx = || format!("open {}", path.display());

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(2)
                .flags(EnvFlags::NO_SUB_DIR)
                .open(&path)
        }
        .map_err(|e| MapError::db(ctx(), e))?;

        let mut wtxn = env.write_txn().map_err(|e| MapError::db(ctx(), e))?;
        let handles: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some("handles"))
            .map_err(|e| MapError::db(ctx(), e))?;
        let meta: Database<Str, Str> = env
            .create_database(&mut wtxn, Some("meta"))
            .map_err(|e| MapError::db(ctx(), e))?;

        match meta.get(&wtxn, META_CODEC).map_err(|e| MapError::db(ctx(), e))? {
            None => {
                meta.put(&mut wtxn, META_CODEC, HANDLE_CODEC)
                    .map_err(|e| MapError::db(ctx(), e))?;
                meta.put(&mut wtxn, META_SHARD, &index.to_string())
                    .map_err(|e| MapError::db(ctx(), e))?;
            }
            Some(HANDLE_CODEC) => {
                let recorded = meta
                    .get(&wtxn, META_SHARD)
                    .map_err(|e| MapError::db(ctx(), e))?
                    .and_then(|s| s.parse::<usize>().ok());
                if recorded.is_some_and(|r| r != index) {
                    log_shard_warn!(
                        "Store was created for a different shard",
                        shard = index,
                        recorded = recorded.unwrap_or_default()
                    );
                }
            }
            Some(other) => {
                return Err(MapError::db(
                    ctx(),
                    format!("unsupported handle codec {:?}", other),
                ));
            }
        }
        wtxn.commit().map_err(|e| MapError::db(ctx(), e))?;

        Ok(Self {
            env,
            handles,
            meta,
            index,
            path,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write or overwrite the row for `digest`. `encoded` is the row value.
    pub fn insert(&self, digest: &Digest, encoded: &[u8]) -> Result<()> {
        let ctx = || format!("insert {} into shard {}", digest, self.index);
        let mut wtxn = self.env.write_txn().map_err(|e| MapError::db(ctx(), e))?;
        self.handles
            .put(&mut wtxn, &digest.to_key(), encoded)
            .map_err(|e| MapError::db(ctx(), e))?;
        wtxn.commit().map_err(|e| MapError::db(ctx(), e))
    }

    /// Encode and store a handle.
    pub fn insert_handle(&self, digest: &Digest, handle: &[u8]) -> Result<()> {
        self.insert(digest, codec::encode(handle).as_bytes())
    }

    /// Delete the row for `digest`. Returns whether a row was present.
    pub fn delete(&self, digest: &Digest) -> Result<bool> {
        let ctx = || format!("delete {} from shard {}", digest, self.index);
        let mut wtxn = self.env.write_txn().map_err(|e| MapError::db(ctx(), e))?;
        let existed = self
            .handles
            .delete(&mut wtxn, &digest.to_key())
            .map_err(|e| MapError::db(ctx(), e))?;
        wtxn.commit().map_err(|e| MapError::db(ctx(), e))?;
        Ok(existed)
    }

    /// Decoded handle for `digest`, if a well-formed row exists.
    pub fn get(&self, digest: &Digest, max_handle_size: usize) -> Result<Option<Vec<u8>>> {
        let ctx = || format!("read {} from shard {}", digest, self.index);
        let rtxn = self.env.read_txn().map_err(|e| MapError::db(ctx(), e))?;
        let Some(value) = self
            .handles
            .get(&rtxn, &digest.to_key())
            .map_err(|e| MapError::db(ctx(), e))?
        else {
            return Ok(None);
        };
        codec::decode(value, max_handle_size)
            .map(Some)
            .map_err(|e| MapError::db(ctx(), e))
    }

    pub fn len(&self) -> Result<u64> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| MapError::db("count rows", e))?;
        self.handles
            .len(&rtxn)
            .map_err(|e| MapError::db("count rows", e))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Stream every well-formed row to `visit`.
    ///
    /// Rows whose key or value cannot be decoded are logged and skipped;
    /// they never abort the scan.
    pub fn load_all<F>(&self, max_handle_size: usize, mut visit: F) -> Result<ScanStats>
    where
        F: FnMut(Digest, &[u8]),
    {
        let ctx = || format!("load shard {}", self.index);
        let rtxn = self.env.read_txn().map_err(|e| MapError::db(ctx(), e))?;
        let iter = self
            .handles
            .iter(&rtxn)
            .map_err(|e| MapError::db(ctx(), e))?;

        let mut stats = ScanStats::default();
        let mut handle = Vec::with_capacity(max_handle_size);
        for row in iter {
            let (key, value) = row.map_err(|e| MapError::db(ctx(), e))?;
            match decode_row(key, value, max_handle_size, &mut handle) {
                Ok(digest) => {
                    stats.rows += 1;
                    visit(digest, &handle);
                }
                Err(fault) => {
                    stats.skipped += 1;
                    log_shard_warn!(
                        "Skipping malformed row",
                        shard = self.index,
                        key = tracing::field::display(hex::encode(key)),
                        reason = tracing::field::display(&fault)
                    );
                }
            }
        }
        Ok(stats)
    }

    /// Every row with its decoding outcome, malformed ones included.
    pub fn dump(&self, max_handle_size: usize) -> Result<Vec<DumpRow>> {
        let ctx = || format!("dump shard {}", self.index);
        let rtxn = self.env.read_txn().map_err(|e| MapError::db(ctx(), e))?;
        let iter = self
            .handles
            .iter(&rtxn)
            .map_err(|e| MapError::db(ctx(), e))?;

        let mut rows = Vec::new();
        for row in iter {
            let (key, value) = row.map_err(|e| MapError::db(ctx(), e))?;
            let mut handle = Vec::new();
            let decoded =
                decode_row(key, value, max_handle_size, &mut handle).map(|d| (d, handle));
            rows.push(DumpRow {
                key: key.to_vec(),
                value: value.to_vec(),
                decoded,
            });
        }
        Ok(rows)
    }

    #[cfg(test)]
    fn put_raw(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let ctx = || format!("raw write to shard {}", self.index);
        let mut wtxn = self.env.write_txn().map_err(|e| MapError::db(ctx(), e))?;
        self.handles
            .put(&mut wtxn, key, value)
            .map_err(|e| MapError::db(ctx(), e))?;
        wtxn.commit().map_err(|e| MapError::db(ctx(), e))
    }
}

fn decode_row(
    key: &[u8],
    value: &[u8],
    max_handle_size: usize,
    handle: &mut Vec<u8>,
) -> std::result::Result<Digest, RowFault> {
    let digest = Digest::from_key(key).ok_or(RowFault::BadKey(key.len()))?;
    codec::decode_into(value, max_handle_size, handle).map_err(RowFault::BadValue)?;
    Ok(digest)
}

/// Open every shard store found in `dir` and return their rows, by shard.
///
/// Used by offline tooling; must not run while a `HandleMap` has the same
/// directory open in this process.
pub fn dump_directory(
    dir: &Path,
    map_size: usize,
    max_handle_size: usize,
) -> Result<Vec<(usize, Vec<DumpRow>)>> {
    let indices = shard_file_indices(dir)
        .map_err(|e| MapError::system(format!("scan {}", dir.display()), e))?;
    let mut out = Vec::with_capacity(indices.len());
    for index in indices {
        let store = ShardStore::open(dir, index, map_size)?;
        out.push((index, store.dump(max_handle_size)?));
    }
    Ok(out)
}
