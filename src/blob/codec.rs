//! Hashing and compression for blob payloads.

use crate::error::{Result, StoreError};

pub const CODEC_NONE: u16 = 0;
pub const CODEC_ZSTD: u16 = 1;

/// Payloads below this size skip compression outright.
pub const COMPRESS_THRESHOLD: usize = 512;

const ZSTD_LEVEL: i32 = 3;

/// BLAKE3-256 of the uncompressed bytes as received.
pub fn content_hash(raw: &[u8]) -> [u8; 32] {
    *blake3::hash(raw).as_bytes()
}

/// Compress when it pays off. Returns the codec actually used and the
/// bytes to store; falls back to raw passthrough when zstd does not
/// shrink the payload.
pub fn encode(raw: &[u8]) -> (u16, Vec<u8>) {
    if raw.len() < COMPRESS_THRESHOLD {
        return (CODEC_NONE, raw.to_vec());
    }
    match zstd::encode_all(raw, ZSTD_LEVEL) {
        Ok(compressed) if compressed.len() < raw.len() => (CODEC_ZSTD, compressed),
        _ => (CODEC_NONE, raw.to_vec()),
    }
}

/// Decode stored bytes back to the raw payload, verifying the recorded
/// uncompressed length.
pub fn decode(codec: u16, stored: &[u8], raw_len: u32) -> Result<Vec<u8>> {
    let raw = match codec {
        CODEC_NONE => stored.to_vec(),
        CODEC_ZSTD => zstd::decode_all(stored)
            .map_err(|e| StoreError::Decode(format!("zstd decompress: {e}")))?,
        other => return Err(StoreError::Decode(format!("unknown blob codec {other}"))),
    };
    if raw.len() != raw_len as usize {
        return Err(StoreError::Decode(format!(
            "decompressed length {} does not match recorded {}",
            raw.len(),
            raw_len
        )));
    }
    Ok(raw)
}
