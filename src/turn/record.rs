//! Fixed-size turn log record.
//!
//! Layout (80 bytes, little-endian):
//! turn_id u64 | parent_turn_id u64 | depth u32 | codec u32 | type_tag u64 |
//! payload_hash[32] | flags u32 | created_at_unix_ms u64 | crc32 u32
//!
//! The CRC is CRC-32C over the first 76 bytes. `type_tag` is a stable
//! 64-bit fingerprint of the declared type id so scans can group by type
//! without touching the metadata side file; the full string lives there.

use crc32c::crc32c;

use crate::error::{Result, StoreError};

pub const TURN_RECORD_LEN: usize = 8 + 8 + 4 + 4 + 8 + 32 + 4 + 8 + 4;

/// Flags bit 0: a filesystem snapshot root is attached to this turn.
pub const FLAG_HAS_FS: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnRecord {
    pub turn_id: u64,
    pub parent_turn_id: u64,
    pub depth: u32,
    pub codec: u32,
    pub type_tag: u64,
    pub payload_hash: [u8; 32],
    pub flags: u32,
    pub created_at_unix_ms: u64,
}

impl TurnRecord {
    pub fn encode(&self) -> [u8; TURN_RECORD_LEN] {
        let mut buf = [0u8; TURN_RECORD_LEN];
        buf[0..8].copy_from_slice(&self.turn_id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.parent_turn_id.to_le_bytes());
        buf[16..20].copy_from_slice(&self.depth.to_le_bytes());
        buf[20..24].copy_from_slice(&self.codec.to_le_bytes());
        buf[24..32].copy_from_slice(&self.type_tag.to_le_bytes());
        buf[32..64].copy_from_slice(&self.payload_hash);
        buf[64..68].copy_from_slice(&self.flags.to_le_bytes());
        buf[68..76].copy_from_slice(&self.created_at_unix_ms.to_le_bytes());
        let crc = crc32c(&buf[..76]);
        buf[76..80].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; TURN_RECORD_LEN]) -> Result<Self> {
        let expected = u32::from_le_bytes(buf[76..80].try_into().unwrap());
        let actual = crc32c(&buf[..76]);
        if actual != expected {
            return Err(StoreError::Decode(format!(
                "turn record crc mismatch: expected {expected:#x}, got {actual:#x}"
            )));
        }
        let mut payload_hash = [0u8; 32];
        payload_hash.copy_from_slice(&buf[32..64]);
        Ok(Self {
            turn_id: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            parent_turn_id: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            depth: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            codec: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            type_tag: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            payload_hash,
            flags: u32::from_le_bytes(buf[64..68].try_into().unwrap()),
            created_at_unix_ms: u64::from_le_bytes(buf[68..76].try_into().unwrap()),
        })
    }

    pub fn has_fs(&self) -> bool {
        self.flags & FLAG_HAS_FS != 0
    }
}

/// Stable 64-bit fingerprint of a type id string.
pub fn type_tag(type_id: &str) -> u64 {
    let digest = blake3::hash(type_id.as_bytes());
    u64::from_le_bytes(digest.as_bytes()[..8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TurnRecord {
        TurnRecord {
            turn_id: 42,
            parent_turn_id: 41,
            depth: 7,
            codec: 1,
            type_tag: type_tag("com.example.Message"),
            payload_hash: [0xAB; 32],
            flags: FLAG_HAS_FS,
            created_at_unix_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let record = sample();
        let buf = record.encode();
        let decoded = TurnRecord::decode(&buf).unwrap();
        assert_eq!(decoded, record);
        assert!(decoded.has_fs());
    }

    #[test]
    fn flipped_bit_fails_crc() {
        let mut buf = sample().encode();
        buf[10] ^= 0x01;
        let err = TurnRecord::decode(&buf).unwrap_err();
        assert!(matches!(err, StoreError::Decode(_)));
    }

    #[test]
    fn type_tag_is_stable_and_distinct() {
        assert_eq!(type_tag("a.B"), type_tag("a.B"));
        assert_ne!(type_tag("a.B"), type_tag("a.C"));
    }
}
