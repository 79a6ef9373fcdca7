//! Dedup CAS over the packfile and index.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use crate::blob::codec;
use crate::blob::index::{IndexEntry, IndexFile};
use crate::blob::pack::{PackFile, PackRecordHeader};
use crate::blob::BlobHash;
use crate::error::{Result, StoreError};

const SHARD_COUNT: usize = 16;

pub struct BlobStore {
    pack: Mutex<PackFile>,
    index: Mutex<IndexFile>,
    map: RwLock<HashMap<BlobHash, IndexEntry>>,
    shards: Vec<Mutex<()>>,
}

impl BlobStore {
    /// Open the store, running pack recovery: verify every record CRC,
    /// truncate a torn tail, and rebuild the index when it disagrees with
    /// the pack.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let pack_path = dir.join("blobs.pack");
        let index_path = dir.join("blobs.idx");

        let mut pack = PackFile::open(&pack_path)?;
        let mut index = IndexFile::open(&index_path)?;
        let disk_map = index.load()?;

        let mut canonical: HashMap<BlobHash, IndexEntry> = HashMap::new();
        let valid_len = pack.scan(|offset, header| {
            canonical.insert(
                header.hash,
                IndexEntry {
                    pack_offset: offset,
                    raw_len: header.raw_len,
                    stored_len: header.stored_len,
                    codec: header.codec,
                },
            );
        })?;

        if valid_len < pack.len() {
            tracing::warn!(
                pack = %pack_path.display(),
                dropped = pack.len() - valid_len,
                "truncating torn tail from blob pack"
            );
            pack.truncate_to(valid_len)?;
        }

        if disk_map != canonical {
            tracing::info!(
                entries = canonical.len(),
                "rebuilding blob index from pack scan"
            );
            index = IndexFile::rewrite(&index_path, canonical.iter().map(|(h, e)| (*h, *e)))?;
        }

        Ok(Self {
            pack: Mutex::new(pack),
            index: Mutex::new(index),
            map: RwLock::new(canonical),
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(())).collect(),
        })
    }

    /// Insert bytes keyed by their BLAKE3 hash. Idempotent: the first
    /// insert writes one pack record, every later call with the same bytes
    /// returns `was_new == false`.
    pub fn insert_if_absent(&self, raw: &[u8]) -> Result<(BlobHash, bool)> {
        let hash = codec::content_hash(raw);
        if self.map.read().expect("blob map poisoned").contains_key(&hash) {
            return Ok((hash, false));
        }

        let shard = &self.shards[hash[0] as usize % SHARD_COUNT];
        let _guard = shard.lock().expect("blob shard poisoned");

        // Double-check under the shard lock: a concurrent insert of the
        // same bytes may have won the race.
        if self.map.read().expect("blob map poisoned").contains_key(&hash) {
            return Ok((hash, false));
        }

        let (blob_codec, stored) = codec::encode(raw);
        let header = PackRecordHeader {
            codec: blob_codec,
            raw_len: raw.len() as u32,
            stored_len: stored.len() as u32,
            hash,
        };

        let offset = self
            .pack
            .lock()
            .expect("blob pack poisoned")
            .append(&header, &stored)?;
        let entry = IndexEntry {
            pack_offset: offset,
            raw_len: header.raw_len,
            stored_len: header.stored_len,
            codec: blob_codec,
        };
        self.index
            .lock()
            .expect("blob index poisoned")
            .append(&hash, &entry)?;
        self.map
            .write()
            .expect("blob map poisoned")
            .insert(hash, entry);
        Ok((hash, true))
    }

    /// Insert with a client-supplied hash: the hash must match the bytes.
    pub fn insert_verified(&self, claimed: &BlobHash, raw: &[u8]) -> Result<(BlobHash, bool)> {
        let actual = codec::content_hash(raw);
        if &actual != claimed {
            return Err(StoreError::Decode(format!(
                "blob hash mismatch: claimed {}, computed {}",
                hex::encode(claimed),
                hex::encode(actual)
            )));
        }
        self.insert_if_absent(raw)
    }

    pub fn get_raw(&self, hash: &BlobHash) -> Result<Vec<u8>> {
        let entry = self
            .map
            .read()
            .expect("blob map poisoned")
            .get(hash)
            .copied()
            .ok_or_else(|| StoreError::NotFound(format!("blob {}", hex::encode(hash))))?;
        let (header, stored) = self
            .pack
            .lock()
            .expect("blob pack poisoned")
            .read_at(entry.pack_offset)?;
        if &header.hash != hash {
            return Err(StoreError::Decode(format!(
                "pack record at {} holds {} but index claims {}",
                entry.pack_offset,
                hex::encode(header.hash),
                hex::encode(hash)
            )));
        }
        codec::decode(header.codec, &stored, header.raw_len)
    }

    pub fn exists(&self, hash: &BlobHash) -> bool {
        self.map.read().expect("blob map poisoned").contains_key(hash)
    }

    pub fn count(&self) -> usize {
        self.map.read().expect("blob map poisoned").len()
    }

    pub fn pack_len(&self) -> u64 {
        self.pack.lock().expect("blob pack poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn insert_and_get_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = BlobStore::open(tmp.path()).unwrap();

        let (hash, was_new) = store.insert_if_absent(b"hello world").unwrap();
        assert!(was_new);
        assert!(store.exists(&hash));
        assert_eq!(store.get_raw(&hash).unwrap(), b"hello world");
    }

    #[test]
    fn duplicate_insert_dedups() {
        let tmp = TempDir::new().unwrap();
        let store = BlobStore::open(tmp.path()).unwrap();

        let (h1, new1) = store.insert_if_absent(b"abc").unwrap();
        let len_after_first = store.pack_len();
        let (h2, new2) = store.insert_if_absent(b"abc").unwrap();
        assert!(new1);
        assert!(!new2);
        assert_eq!(h1, h2);
        assert_eq!(store.pack_len(), len_after_first);
    }

    #[test]
    fn insert_verified_rejects_wrong_hash() {
        let tmp = TempDir::new().unwrap();
        let store = BlobStore::open(tmp.path()).unwrap();
        let wrong = [0u8; 32];
        let err = store.insert_verified(&wrong, b"payload").unwrap_err();
        assert!(matches!(err, StoreError::Decode(_)));
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn missing_hash_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = BlobStore::open(tmp.path()).unwrap();
        let err = store.get_raw(&[9u8; 32]).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn large_payload_roundtrips_through_compression() {
        let tmp = TempDir::new().unwrap();
        let store = BlobStore::open(tmp.path()).unwrap();
        let raw = vec![b'z'; 100_000];
        let (hash, _) = store.insert_if_absent(&raw).unwrap();
        // Stored form should be much smaller than raw.
        assert!(store.pack_len() < raw.len() as u64);
        assert_eq!(store.get_raw(&hash).unwrap(), raw);
    }

    #[test]
    fn reopen_preserves_blobs() {
        let tmp = TempDir::new().unwrap();
        let hash = {
            let store = BlobStore::open(tmp.path()).unwrap();
            store.insert_if_absent(b"persistent").unwrap().0
        };
        let store = BlobStore::open(tmp.path()).unwrap();
        assert_eq!(store.get_raw(&hash).unwrap(), b"persistent");
    }

    #[test]
    fn reopen_rebuilds_missing_index() {
        let tmp = TempDir::new().unwrap();
        let hash = {
            let store = BlobStore::open(tmp.path()).unwrap();
            store.insert_if_absent(b"indexed").unwrap().0
        };
        std::fs::remove_file(tmp.path().join("blobs.idx")).unwrap();
        let store = BlobStore::open(tmp.path()).unwrap();
        assert_eq!(store.get_raw(&hash).unwrap(), b"indexed");
    }

    #[test]
    fn reopen_truncates_torn_pack_tail() {
        let tmp = TempDir::new().unwrap();
        let (keep, torn) = {
            let store = BlobStore::open(tmp.path()).unwrap();
            let keep = store.insert_if_absent(b"keep me").unwrap().0;
            let torn = store.insert_if_absent(b"torn away").unwrap().0;
            (keep, torn)
        };

        let pack_path = tmp.path().join("blobs.pack");
        let len = std::fs::metadata(&pack_path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&pack_path).unwrap();
        file.set_len(len - 5).unwrap();
        drop(file);

        let store = BlobStore::open(tmp.path()).unwrap();
        assert_eq!(store.get_raw(&keep).unwrap(), b"keep me");
        assert!(!store.exists(&torn));
    }
}
