//! Versioned container for save-state blobs.
//!
//! ## Layout
//!
//! ```text
//! offset  size  field
//! 0       4     magic tag chosen by the engine
//! 4       4     format version (u32 little-endian)
//! 8       4     payload length (u32 little-endian)
//! 12      4     CRC-32 of the payload (u32 little-endian)
//! 16      n     payload
//! ```
//!
//! The payload encoding belongs to the engine; this module only frames it
//! and rejects blobs that are truncated, padded, corrupted or from another
//! engine/version.

use crate::error::StateError;

pub const HEADER_SIZE: usize = 16;

/// Wrap `payload` in a header.
pub fn encode(magic: [u8; 4], version: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&magic);
    out.extend_from_slice(&version.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Validate the header and return the payload slice.
pub fn decode(magic: [u8; 4], version: u32, data: &[u8]) -> Result<&[u8], StateError> {
    if data.len() < HEADER_SIZE {
        return Err(StateError::TooShort {
            len: data.len(),
            needed: HEADER_SIZE,
        });
    }

    let found = [data[0], data[1], data[2], data[3]];
    if found != magic {
        return Err(StateError::BadMagic { found });
    }

    let found_version = read_u32(data, 4);
    if found_version != version {
        return Err(StateError::UnsupportedVersion {
            found: found_version,
            expected: version,
        });
    }

    let declared = read_u32(data, 8) as usize;
    let payload = &data[HEADER_SIZE..];
    if payload.len() != declared {
        return Err(StateError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }

    if crc32fast::hash(payload) != read_u32(data, 12) {
        return Err(StateError::ChecksumMismatch);
    }

    Ok(payload)
}

/// Peek at the magic tag and version without validating the rest.
pub fn peek_header(data: &[u8]) -> Option<([u8; 4], u32)> {
    if data.len() < HEADER_SIZE {
        return None;
    }
    Some(([data[0], data[1], data[2], data[3]], read_u32(data, 4)))
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: [u8; 4] = *b"TEST";

    #[test]
    fn decode_returns_payload() {
        let blob = encode(MAGIC, 3, b"machine");
        assert_eq!(blob.len(), HEADER_SIZE + 7);
        assert_eq!(decode(MAGIC, 3, &blob).unwrap(), b"machine");
        assert_eq!(peek_header(&blob), Some((MAGIC, 3)));
    }

    #[test]
    fn empty_payload_is_valid() {
        let blob = encode(MAGIC, 1, &[]);
        assert_eq!(decode(MAGIC, 1, &blob).unwrap(), &[] as &[u8]);
    }

    #[test]
    fn rejects_short_blob() {
        assert_eq!(
            decode(MAGIC, 1, &[0; 5]),
            Err(StateError::TooShort { len: 5, needed: 16 })
        );
        assert_eq!(peek_header(&[0; 5]), None);
    }

    #[test]
    fn rejects_wrong_magic() {
        let blob = encode(*b"XXXX", 1, b"abc");
        assert_eq!(
            decode(MAGIC, 1, &blob),
            Err(StateError::BadMagic { found: *b"XXXX" })
        );
    }

    #[test]
    fn rejects_wrong_version() {
        let blob = encode(MAGIC, 2, b"abc");
        assert_eq!(
            decode(MAGIC, 1, &blob),
            Err(StateError::UnsupportedVersion {
                found: 2,
                expected: 1
            })
        );
    }

    #[test]
    fn rejects_truncated_and_padded_blobs() {
        let blob = encode(MAGIC, 1, b"abcdef");
        assert_eq!(
            decode(MAGIC, 1, &blob[..blob.len() - 2]),
            Err(StateError::LengthMismatch {
                declared: 6,
                actual: 4
            })
        );
        let mut padded = blob.clone();
        padded.push(0);
        assert!(matches!(
            decode(MAGIC, 1, &padded),
            Err(StateError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn rejects_corrupted_payload() {
        let mut blob = encode(MAGIC, 1, b"abcdef");
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert_eq!(decode(MAGIC, 1, &blob), Err(StateError::ChecksumMismatch));
    }
}
