use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use fhmap_config::{log_map_debug, log_map_error, log_map_info, log_map_warn, HandleMapConfig};

use crate::index::HandleIndex;
use crate::router::ShardRouter;
use crate::shard::{Shard, ShardOptions, WorkerStatus};
use crate::store::shard_file_indices;
use crate::{Digest, MapError, Result};

/// Snapshot of one shard's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardStats {
    pub index: usize,
    pub pending: usize,
    pub ops_outstanding: usize,
    pub status: WorkerStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapStats {
    pub entries: usize,
    pub shards: Vec<ShardStats>,
}

impl MapStats {
    pub fn pending(&self) -> usize {
        self.shards.iter().map(|s| s.pending).sum()
    }
}

/// Digest ↔ handle map with write-behind sharded persistence.
///
/// Lookups are served from memory. `set_fh` and `del_fh` update memory
/// before returning and queue the matching store write on the digest's
/// shard. Dropping the map (or calling [`HandleMap::shutdown`]) drains every
/// queue and stops the workers.
pub struct HandleMap {
    index: Arc<HandleIndex>,
    router: ShardRouter,
    shards: Vec<Shard>,
    max_handle_size: usize,
    storage_directory: PathBuf,
}

impl HandleMap {
    /// Open the map described by `config` and reload every shard.
    ///
    /// Returns once each stored row is back in memory. Fails with
    /// `InvalidParam` for a bad configuration or when the storage directory
    /// holds shard stores other than `handlemap.0` .. `handlemap.<shard_count - 1>`.
    pub fn init(config: &HandleMapConfig) -> Result<Self> {
        config.validate()?;
        let router = ShardRouter::new(config.shard_count)
            .ok_or_else(|| MapError::InvalidParam("shard_count must be positive".into()))?;

        if config.synchronous_insert {
            log_map_warn!("synchronous_insert is not supported, inserts stay write-behind");
        }

        create_dir(&config.storage_directory)?;
        create_dir(&config.temp_directory)?;

        let existing = shard_file_indices(&config.storage_directory).map_err(|e| {
            MapError::system(
                format!("scan {}", config.storage_directory.display()),
                e,
            )
        })?;
        let expected = config.shard_count as usize;
        if !existing.is_empty() && !existing.iter().copied().eq(0..expected) {
            log_map_error!(
                "Shard stores do not match shard_count",
                configured = config.shard_count,
                found = existing.len(),
                dir = tracing::field::display(config.storage_directory.display())
            );
            return Err(MapError::InvalidParam(format!(
                "{} holds shard stores {:?} but shard_count is {}",
                config.storage_directory.display(),
                existing,
                config.shard_count
            )));
        }

        let index = Arc::new(HandleIndex::new(
            config.index_capacity,
            config.entry_prealloc,
        ));
        let options = ShardOptions {
            storage_directory: config.storage_directory.clone(),
            map_size: config.map_size_bytes(),
            max_handle_size: config.max_handle_size,
            op_prealloc: config.op_prealloc,
            max_pending_ops: config.max_pending_ops,
        };

        let mut map = HandleMap {
            index: Arc::clone(&index),
            router,
            shards: Vec::with_capacity(config.shard_count as usize),
            max_handle_size: config.max_handle_size,
            storage_directory: config.storage_directory.clone(),
        };

        // On any early return `map` drops and stops the shards started so far.
        let mut readiness = Vec::with_capacity(config.shard_count as usize);
        for i in 0..config.shard_count as usize {
            let (shard, ready) = Shard::spawn(i, &options, Arc::clone(&index))?;
            map.shards.push(shard);
            readiness.push(ready);
        }
        for (i, ready) in readiness.into_iter().enumerate() {
            match ready.recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(MapError::System(format!(
                        "worker for shard {} exited before reporting",
                        i
                    )))
                }
            }
        }

        let start = Instant::now();
        for shard in &map.shards {
            shard.submit_load()?;
        }
        for shard in &map.shards {
            shard.wait_idle();
        }

        log_map_info!(
            "Handle map ready",
            shards = config.shard_count,
            entries = map.index.len(),
            elapsed_ms = start.elapsed().as_millis() as u64
        );
        Ok(map)
    }

    /// Handle mapped to `digest`, or `Stale`.
    pub fn get_fh(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.index.get(digest).ok_or(MapError::Stale)
    }

    /// Copy the handle for `digest` into `out`, returning its length.
    pub fn get_fh_into(&self, digest: &Digest, out: &mut Vec<u8>) -> Result<usize> {
        if self.index.lookup_into(digest, out) {
            Ok(out.len())
        } else {
            Err(MapError::Stale)
        }
    }

    /// Record `digest → handle`.
    ///
    /// Visible to lookups on return; persisted later. An existing mapping
    /// is never replaced: the call fails with `Exists` and changes nothing.
    pub fn set_fh(&self, digest: &Digest, handle: &[u8]) -> Result<()> {
        if handle.len() > self.max_handle_size {
            return Err(MapError::InvalidParam(format!(
                "handle is {} bytes, limit is {}",
                handle.len(),
                self.max_handle_size
            )));
        }

        let shard = &self.shards[self.router.select(digest)];
        // reserve first so a full queue leaves the index untouched
        let mut op = match shard.reserve() {
            Ok(op) => op,
            Err(_) if self.index.contains(digest) => return Err(MapError::Exists),
            Err(e) => return Err(e),
        };
        if !self.index.insert_if_absent(*digest, handle) {
            log_map_debug!("Mapping already exists", digest = tracing::field::display(digest));
            return Err(MapError::Exists);
        }
        op.set_insert(*digest, handle);
        shard.enqueue(op);
        Ok(())
    }

    /// Forget `digest`. `Stale` if it was not mapped.
    pub fn del_fh(&self, digest: &Digest) -> Result<()> {
        let shard = &self.shards[self.router.select(digest)];
        let mut op = match shard.reserve() {
            Ok(op) => op,
            Err(_) if !self.index.contains(digest) => return Err(MapError::Stale),
            Err(e) => return Err(e),
        };
        if !self.index.remove(digest) {
            return Err(MapError::Stale);
        }
        op.set_delete(*digest);
        shard.enqueue(op);
        Ok(())
    }

    /// Block until every operation queued before this call is in the store.
    pub fn flush(&self) {
        let pending: usize = self.shards.iter().map(Shard::pending).sum();
        log_map_info!("Waiting for store synchronization", pending_ops = pending);

        let start = Instant::now();
        for shard in &self.shards {
            shard.wait_idle();
        }
        log_map_info!(
            "Stores synchronized",
            elapsed_ms = start.elapsed().as_millis() as u64
        );
    }

    /// Drain every queue, stop the workers and release the stores.
    pub fn shutdown(mut self) {
        self.stop_workers();
    }

    fn stop_workers(&mut self) {
        if self.shards.is_empty() {
            return;
        }
        for shard in &self.shards {
            shard.wait_idle();
        }
        for shard in &mut self.shards {
            shard.stop();
        }
        log_map_debug!("Shard workers stopped", shards = self.shards.len());
        self.shards.clear();
    }

    /// Shard that persists `digest`.
    pub fn shard_of(&self, digest: &Digest) -> usize {
        self.router.select(digest)
    }

    pub fn shard_count(&self) -> u32 {
        self.router.shard_count()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn max_handle_size(&self) -> usize {
        self.max_handle_size
    }

    pub fn storage_directory(&self) -> &Path {
        &self.storage_directory
    }

    pub fn stats(&self) -> MapStats {
        MapStats {
            entries: self.index.len(),
            shards: self
                .shards
                .iter()
                .map(|s| ShardStats {
                    index: s.index(),
                    pending: s.pending(),
                    ops_outstanding: s.ops_outstanding(),
                    status: s.status(),
                })
                .collect(),
        }
    }
}

impl Drop for HandleMap {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

fn create_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| MapError::system(format!("create {}", dir.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhmap_config::testing::TestEnvironment;

    #[test]
    fn test_set_get_del() {
        let env = TestEnvironment::new().unwrap();
        let map = HandleMap::init(&env.config(2)).unwrap();
        let d = Digest::new(100, 7);

        assert!(matches!(map.get_fh(&d), Err(MapError::Stale)));
        map.set_fh(&d, &[0xAA, 0xBB]).unwrap();
        assert_eq!(map.get_fh(&d).unwrap(), vec![0xAA, 0xBB]);

        let mut out = Vec::new();
        assert_eq!(map.get_fh_into(&d, &mut out).unwrap(), 2);
        assert_eq!(out, vec![0xAA, 0xBB]);

        map.del_fh(&d).unwrap();
        assert!(matches!(map.get_fh(&d), Err(MapError::Stale)));
        assert!(matches!(map.del_fh(&d), Err(MapError::Stale)));
    }

    #[test]
    fn test_oversized_handle_rejected() {
        let env = TestEnvironment::new().unwrap();
        let map = HandleMap::init(&env.config(1)).unwrap();
        let d = Digest::new(1, 1);
        let big = vec![0u8; map.max_handle_size() + 1];
        assert!(matches!(map.set_fh(&d, &big), Err(MapError::InvalidParam(_))));
        assert!(map.is_empty());

        let max = vec![1u8; map.max_handle_size()];
        map.set_fh(&d, &max).unwrap();
    }

    #[test]
    fn test_set_reports_exists() {
        let env = TestEnvironment::new().unwrap();
        let map = HandleMap::init(&env.config(1)).unwrap();
        let d = Digest::new(3, 3);
        map.set_fh(&d, b"one").unwrap();
        assert!(matches!(map.set_fh(&d, b"two"), Err(MapError::Exists)));
        assert_eq!(map.get_fh(&d).unwrap(), b"one");
        map.flush();
        assert_eq!(map.stats().shards[0].ops_outstanding, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let env = TestEnvironment::new().unwrap();
        let mut config = env.config(0);
        assert!(matches!(HandleMap::init(&config), Err(MapError::InvalidParam(_))));
        config.shard_count = fhmap_config::MAX_SHARDS + 1;
        assert!(matches!(HandleMap::init(&config), Err(MapError::InvalidParam(_))));
    }

    #[test]
    fn test_stats_after_flush() {
        let env = TestEnvironment::new().unwrap();
        let map = HandleMap::init(&env.config(3)).unwrap();
        for i in 0..30u64 {
            map.set_fh(&Digest::new(i, i as u32), &i.to_be_bytes()).unwrap();
        }
        map.flush();

        let stats = map.stats();
        assert_eq!(stats.entries, 30);
        assert_eq!(stats.shards.len(), 3);
        assert_eq!(stats.pending(), 0);
        assert!(stats.shards.iter().all(|s| s.status == WorkerStatus::Idle));
        assert_eq!(map.shard_count(), 3);
        assert_eq!(map.storage_directory(), env.storage_dir.as_path());
    }

    #[test]
    fn test_shutdown_allows_reopen() {
        let env = TestEnvironment::new().unwrap();
        let d = Digest::new(77, 1);
        let map = HandleMap::init(&env.config(2)).unwrap();
        map.set_fh(&d, b"persisted").unwrap();
        map.shutdown();

        let map = HandleMap::init(&env.config(2)).unwrap();
        assert_eq!(map.get_fh(&d).unwrap(), b"persisted");
    }
}
