//! Handle digests: the fixed-size stand-in a legacy client carries instead
//! of the backend's real handle.
//!
//! Layout of the 16-byte wire form:
//!
//! ```text
//! 0      1      2      4             8                      16
//! +------+------+------+-------------+----------------------+
//! | len  | type | pad  | handle_hash | object_id            |
//! | =16  | =1   | 0 0  | u32 LE      | u64 LE               |
//! +------+------+------+-------------+----------------------+
//! ```

use std::fmt;

use crate::{MapError, Result};

/// Size of the encoded digest on the wire.
pub const DIGEST_WIRE_LEN: usize = 16;

/// Type tag marking a wire digest as produced by this map.
pub const HANDLE_MAPPED: u8 = 1;

/// Size of the composite store key: object_id (BE) followed by handle_hash (BE).
pub const DIGEST_KEY_LEN: usize = 12;

/// Compact `(object_id, handle_hash)` pair standing in for a real handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Digest {
    /// Backend file id
    pub object_id: u64,
    /// Content hash of the real handle, salted with the file id
    pub handle_hash: u32,
}

impl Digest {
    pub const fn new(object_id: u64, handle_hash: u32) -> Self {
        Self {
            object_id,
            handle_hash,
        }
    }

    /// Mint the digest the proxy uses for `handle` of file `object_id`.
    pub fn for_handle(object_id: u64, handle: &[u8]) -> Self {
        Self::new(object_id, fh4_hash(handle, object_id as u32))
    }

    /// Store key; big-endian so rows sort by `(object_id, handle_hash)`.
    pub fn to_key(&self) -> [u8; DIGEST_KEY_LEN] {
        let mut key = [0u8; DIGEST_KEY_LEN];
        key[..8].copy_from_slice(&self.object_id.to_be_bytes());
        key[8..].copy_from_slice(&self.handle_hash.to_be_bytes());
        key
    }

    /// Inverse of [`Digest::to_key`]; `None` for keys of the wrong size.
    pub fn from_key(key: &[u8]) -> Option<Self> {
        if key.len() != DIGEST_KEY_LEN {
            return None;
        }
        let object_id = u64::from_be_bytes(key[..8].try_into().ok()?);
        let handle_hash = u32::from_be_bytes(key[8..].try_into().ok()?);
        Some(Self::new(object_id, handle_hash))
    }

    pub fn to_wire(&self) -> [u8; DIGEST_WIRE_LEN] {
        let mut buf = [0u8; DIGEST_WIRE_LEN];
        buf[0] = DIGEST_WIRE_LEN as u8;
        buf[1] = HANDLE_MAPPED;
        buf[4..8].copy_from_slice(&self.handle_hash.to_le_bytes());
        buf[8..16].copy_from_slice(&self.object_id.to_le_bytes());
        buf
    }

    /// Decode a wire digest.
    ///
    /// A buffer of the wrong size is `InvalidParam`; a buffer carrying some
    /// other type tag was not minted here and is answered with `Stale`.
    pub fn from_wire(buf: &[u8]) -> Result<Self> {
        if buf.len() != DIGEST_WIRE_LEN {
            return Err(MapError::InvalidParam(format!(
                "digest must be {} bytes, got {}",
                DIGEST_WIRE_LEN,
                buf.len()
            )));
        }
        if buf[0] as usize != DIGEST_WIRE_LEN {
            return Err(MapError::InvalidParam(format!(
                "digest length byte is {}, expected {}",
                buf[0], DIGEST_WIRE_LEN
            )));
        }
        if buf[1] != HANDLE_MAPPED {
            return Err(MapError::Stale);
        }
        let mut hash = [0u8; 4];
        hash.copy_from_slice(&buf[4..8]);
        let mut oid = [0u8; 8];
        oid.copy_from_slice(&buf[8..16]);
        Ok(Self::new(u64::from_le_bytes(oid), u32::from_le_bytes(hash)))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.object_id, self.handle_hash)
    }
}

/// Content hash of an NFSv4 handle.
///
/// Folds the handle four bytes at a time (little-endian words) into
/// `sum = 3 * sum + 5 * word + 1999`, starting from `cookie`. A trailing
/// partial word is accumulated big-endian and folded the same way.
pub fn fh4_hash(handle: &[u8], cookie: u32) -> u32 {
    let step = |sum: u32, word: u32| {
        sum.wrapping_mul(3)
            .wrapping_add(word.wrapping_mul(5))
            .wrapping_add(1999)
    };

    let mut chunks = handle.chunks_exact(4);
    let mut sum = cookie;
    for chunk in &mut chunks {
        let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        sum = step(sum, word);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let word = tail.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32);
        sum = step(sum, word);
    }

    sum
}
