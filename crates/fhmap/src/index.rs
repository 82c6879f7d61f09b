//! In-memory digest → handle index.
//!
//! The index is the authoritative view for lookups; the shard stores only
//! exist to rebuild it after a restart. Entries are sharded internally by
//! `DashMap`, so concurrent callers contend only on the segment their digest
//! hashes to. Handle buffers are recycled through a [`Pool`].

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::pool::Pool;
use crate::Digest;

pub struct HandleIndex {
    entries: DashMap<Digest, Vec<u8>>,
    buffers: Pool<Vec<u8>>,
}

impl HandleIndex {
    /// `capacity` sizes the table up front; `buffer_prealloc` bounds how many
    /// released handle buffers are kept for reuse.
    pub fn new(capacity: usize, buffer_prealloc: usize) -> Self {
        Self {
            entries: DashMap::with_capacity(capacity),
            buffers: Pool::new(buffer_prealloc, buffer_prealloc, None),
        }
    }

    /// Insert `handle` under `digest` unless the digest is already present.
    ///
    /// Returns `false`, leaving the existing entry untouched, when it is.
    pub fn insert_if_absent(&self, digest: Digest, handle: &[u8]) -> bool {
        match self.entries.entry(digest) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let mut buf = self.buffers.try_take().unwrap_or_default();
                buf.extend_from_slice(handle);
                slot.insert(buf);
                true
            }
        }
    }

    /// Copy the handle for `digest` into `out`. Returns `false` if absent.
    pub fn lookup_into(&self, digest: &Digest, out: &mut Vec<u8>) -> bool {
        match self.entries.get(digest) {
            Some(entry) => {
                out.clear();
                out.extend_from_slice(entry.value());
                true
            }
            None => false,
        }
    }

    pub fn get(&self, digest: &Digest) -> Option<Vec<u8>> {
        self.entries.get(digest).map(|e| e.value().clone())
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.entries.contains_key(digest)
    }

    /// Remove `digest`. Returns `false` if it was not present.
    pub fn remove(&self, digest: &Digest) -> bool {
        match self.entries.remove(digest) {
            Some((_, buf)) => {
                self.buffers.give(buf);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
