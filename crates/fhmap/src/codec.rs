//! Text encoding of handle bytes in store rows.
//!
//! Handles are stored as lowercase hexadecimal, two characters per byte.
//! Each shard store records [`HANDLE_CODEC`] in its metadata so a future
//! encoding can be told apart from this one.

use thiserror::Error;

/// Codec identifier written into every shard store.
pub const HANDLE_CODEC: &str = "hex/1";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("odd number of hex digits ({0})")]
    OddLength(usize),

    #[error("decoded handle is {len} bytes, limit is {max}")]
    TooLong { len: usize, max: usize },

    #[error("invalid hex character {ch:?} at offset {index}")]
    InvalidDigit { ch: char, index: usize },
}

/// Encode handle bytes as lowercase hex.
pub fn encode(handle: &[u8]) -> String {
    hex::encode(handle)
}

/// Decode a stored row value, refusing anything longer than `max_len` bytes.
pub fn decode(text: &[u8], max_len: usize) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    decode_into(text, max_len, &mut out)?;
    Ok(out)
}

/// Like [`decode`] but reuses `out`. On error `out` is left empty.
pub fn decode_into(text: &[u8], max_len: usize, out: &mut Vec<u8>) -> Result<(), CodecError> {
    out.clear();
    if text.len() % 2 != 0 {
        return Err(CodecError::OddLength(text.len()));
    }
    let len = text.len() / 2;
    if len > max_len {
        return Err(CodecError::TooLong { len, max: max_len });
    }

    out.resize(len, 0);
    if let Err(e) = hex::decode_to_slice(text, &mut out[..]) {
        out.clear();
        return Err(match e {
            hex::FromHexError::InvalidHexCharacter { c, index } => {
                CodecError::InvalidDigit { ch: c, index }
            }
            // length was checked above
            _ => CodecError::OddLength(text.len()),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_is_lowercase() {
        assert_eq!(encode(&[0xAA, 0xBB, 0x0C]), "aabb0c");
        assert_eq!(encode(&[]), "");
    }

    #[test]
    fn test_decode_accepts_either_case() {
        assert_eq!(decode(b"AaBbCc", 8).unwrap(), vec![0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_decode_odd_length() {
        assert_eq!(decode(b"abc", 8), Err(CodecError::OddLength(3)));
    }

    #[test]
    fn test_decode_invalid_digit() {
        assert_eq!(
            decode(b"aazz", 8),
            Err(CodecError::InvalidDigit { ch: 'z', index: 2 })
        );
    }

    #[test]
    fn test_decode_respects_limit() {
        let text = encode(&[0u8; 5]);
        assert_eq!(
            decode(text.as_bytes(), 4),
            Err(CodecError::TooLong { len: 5, max: 4 })
        );
        assert_eq!(decode(text.as_bytes(), 5).unwrap().len(), 5);
    }

    #[test]
    fn test_decode_into_clears_on_error() {
        let mut buf = vec![1, 2, 3];
        assert!(decode_into(b"0g", 4, &mut buf).is_err());
        assert!(buf.is_empty());

        decode_into(b"ff00", 4, &mut buf).unwrap();
        assert_eq!(buf, vec![0xFF, 0x00]);
    }
}
