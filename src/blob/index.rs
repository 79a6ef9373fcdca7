//! Fixed-size sidecar index for the packfile.
//!
//! Entry layout (52 bytes, little-endian):
//! hash[32] | pack_offset u64 | raw_len u32 | stored_len u32 | codec u16 |
//! reserved u16
//!
//! The index is advisory: the pack is authoritative and the index is
//! rebuilt from a pack scan whenever loading detects a mismatch. A
//! trailing partial entry is dropped silently.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::Path;

use crate::blob::BlobHash;
use crate::error::Result;

pub const INDEX_ENTRY_LEN: usize = 32 + 8 + 4 + 4 + 2 + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub pack_offset: u64,
    pub raw_len: u32,
    pub stored_len: u32,
    pub codec: u16,
}

pub struct IndexFile {
    file: File,
}

impl IndexFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        Ok(Self { file })
    }

    /// Load every complete entry. Later entries win on duplicate hashes,
    /// matching append order.
    pub fn load(&mut self) -> Result<HashMap<BlobHash, IndexEntry>> {
        let mut map = HashMap::new();
        let mut reader = BufReader::new(&mut self.file);
        let mut buf = [0u8; INDEX_ENTRY_LEN];
        loop {
            let mut read = 0usize;
            while read < buf.len() {
                let n = reader.read(&mut buf[read..])?;
                if n == 0 {
                    break;
                }
                read += n;
            }
            if read < buf.len() {
                break;
            }
            let (hash, entry) = decode_entry(&buf);
            map.insert(hash, entry);
        }
        Ok(map)
    }

    pub fn append(&mut self, hash: &BlobHash, entry: &IndexEntry) -> Result<()> {
        self.file.write_all(&encode_entry(hash, entry))?;
        self.file.flush()?;
        Ok(())
    }

    /// Replace the file contents with the given entries. Used after a pack
    /// rescan found the index stale.
    pub fn rewrite(
        path: &Path,
        entries: impl Iterator<Item = (BlobHash, IndexEntry)>,
    ) -> Result<Self> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        for (hash, entry) in entries {
            file.write_all(&encode_entry(&hash, &entry))?;
        }
        file.sync_data()?;
        drop(file);
        Self::open(path)
    }
}

fn encode_entry(hash: &BlobHash, entry: &IndexEntry) -> [u8; INDEX_ENTRY_LEN] {
    let mut buf = [0u8; INDEX_ENTRY_LEN];
    buf[..32].copy_from_slice(hash);
    buf[32..40].copy_from_slice(&entry.pack_offset.to_le_bytes());
    buf[40..44].copy_from_slice(&entry.raw_len.to_le_bytes());
    buf[44..48].copy_from_slice(&entry.stored_len.to_le_bytes());
    buf[48..50].copy_from_slice(&entry.codec.to_le_bytes());
    // bytes 50..52 reserved, zero
    buf
}

fn decode_entry(buf: &[u8; INDEX_ENTRY_LEN]) -> (BlobHash, IndexEntry) {
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&buf[..32]);
    let entry = IndexEntry {
        pack_offset: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
        raw_len: u32::from_le_bytes(buf[40..44].try_into().unwrap()),
        stored_len: u32::from_le_bytes(buf[44..48].try_into().unwrap()),
        codec: u16::from_le_bytes(buf[48..50].try_into().unwrap()),
    };
    (hash, entry)
}
