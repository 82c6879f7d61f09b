//! Digest → shard placement.
//!
//! Placement is part of the on-disk layout: a digest's row lives in exactly
//! one shard store, chosen by this function. Changing the shard count moves
//! digests between shards, which is why `HandleMap::init` refuses to start
//! against a directory holding a different number of stores.

use crate::Digest;

const PLACEMENT_MULTIPLIER: u64 = 1049;
const PLACEMENT_MODULUS: u64 = 2477;

/// Pick the shard owning `digest` among `shard_count` shards.
///
/// `shard_count` must be non-zero.
#[inline]
pub fn select_shard(digest: &Digest, shard_count: u32) -> usize {
    let h = (digest.object_id.wrapping_mul(PLACEMENT_MULTIPLIER) ^ digest.handle_hash as u64)
        % PLACEMENT_MODULUS;
    (h % shard_count as u64) as usize
}

/// Router bound to a fixed shard count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    shard_count: u32,
}

impl ShardRouter {
    /// Returns `None` for a zero shard count.
    pub fn new(shard_count: u32) -> Option<Self> {
        (shard_count > 0).then_some(Self { shard_count })
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    #[inline]
    pub fn select(&self, digest: &Digest) -> usize {
        select_shard(digest, self.shard_count)
    }
}
