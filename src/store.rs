//! Store facade: the write path (hash, dedup, append, head advance) and
//! the read path (walks with payload hydration) used by both surfaces.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::blob::{BlobStore, codec};
use crate::error::{Result, StoreError};
use crate::fs_tree::{self, Located, TreeEntry};
use crate::turn::heads::ContextHead;
use crate::turn::meta::TurnMeta;
use crate::turn::record::TurnRecord;
use crate::turn::store::{AppendTurnArgs, TurnStore};

pub const COMPRESSION_NONE: u32 = 0;
pub const COMPRESSION_ZSTD: u32 = 1;

pub struct Store {
    pub blobs: BlobStore,
    pub turns: TurnStore,
    max_payload_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct AppendParams {
    pub context_id: u64,
    pub parent_turn_id: u64,
    pub declared_type_id: String,
    pub declared_type_version: u32,
    pub encoding: u32,
    pub compression: u32,
    pub uncompressed_len: u32,
    pub content_hash: [u8; 32],
    pub payload: Vec<u8>,
    pub idempotency_key: Vec<u8>,
    pub fs_root_hash: Option<[u8; 32]>,
}

#[derive(Debug, Clone, Copy)]
pub struct AppendOutcome {
    pub context_id: u64,
    pub turn_id: u64,
    pub depth: u32,
    pub payload_hash: [u8; 32],
    pub idem_hit: bool,
}

/// One turn hydrated for a read response.
#[derive(Debug, Clone)]
pub struct TurnItem {
    pub record: TurnRecord,
    pub meta: TurnMeta,
    pub payload: Option<Vec<u8>>,
    pub fs_root: Option<[u8; 32]>,
}

impl Store {
    pub fn open(data_dir: &Path, max_payload_bytes: usize) -> Result<Self> {
        let blobs = BlobStore::open(&data_dir.join("blobs"))?;
        let turns = TurnStore::open(&data_dir.join("turns"))?;
        Ok(Self {
            blobs,
            turns,
            max_payload_bytes,
        })
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }

    /// Full APPEND_TURN write path: decode the wire payload, verify the
    /// claimed hash, make the blob durable, then append under the head
    /// lock. The turn never references a blob that is not already durable.
    pub fn append_turn(&self, params: AppendParams) -> Result<AppendOutcome> {
        if params.payload.len() > self.max_payload_bytes {
            return Err(StoreError::InvalidInput(format!(
                "payload {} bytes exceeds cap {}",
                params.payload.len(),
                self.max_payload_bytes
            )));
        }

        let payload_hash = if params.payload.is_empty() && params.uncompressed_len > 0 {
            // Reference-only append: the client uploaded the bytes earlier
            // via PUT_BLOB. The turn may only land on a durable blob.
            if !self.blobs.exists(&params.content_hash) {
                return Err(StoreError::Precondition(format!(
                    "payload blob {} not present in store",
                    hex::encode(params.content_hash)
                )));
            }
            params.content_hash
        } else {
            let raw = match params.compression {
                COMPRESSION_NONE => params.payload,
                COMPRESSION_ZSTD => zstd::decode_all(params.payload.as_slice())
                    .map_err(|e| StoreError::Decode(format!("zstd decompress: {e}")))?,
                other => {
                    return Err(StoreError::InvalidInput(format!(
                        "unknown compression {other}"
                    )));
                }
            };
            if raw.len() > self.max_payload_bytes {
                return Err(StoreError::InvalidInput(format!(
                    "payload {} bytes exceeds cap {} after decompression",
                    raw.len(),
                    self.max_payload_bytes
                )));
            }
            if raw.len() != params.uncompressed_len as usize {
                return Err(StoreError::Decode(format!(
                    "uncompressed_len {} does not match payload length {}",
                    params.uncompressed_len,
                    raw.len()
                )));
            }
            let actual_hash = codec::content_hash(&raw);
            if actual_hash != params.content_hash {
                return Err(StoreError::Decode(format!(
                    "content hash mismatch: claimed {}, computed {}",
                    hex::encode(params.content_hash),
                    hex::encode(actual_hash)
                )));
            }
            self.blobs.insert_if_absent(&raw)?.0
        };

        let meta = TurnMeta {
            declared_type_id: params.declared_type_id,
            declared_type_version: params.declared_type_version,
            encoding: params.encoding,
            compression: params.compression,
            uncompressed_len: params.uncompressed_len,
        };
        let key = (!params.idempotency_key.is_empty()).then_some(params.idempotency_key.as_slice());
        let (record, idem_hit) = self.turns.append_turn(AppendTurnArgs {
            context_id: params.context_id,
            parent_turn_id: params.parent_turn_id,
            payload_hash,
            codec: params.compression,
            meta,
            fs_root_hash: params.fs_root_hash,
            idempotency_key: key,
            now_ms: now_unix_ms(),
        })?;

        Ok(AppendOutcome {
            context_id: params.context_id,
            turn_id: record.turn_id,
            depth: record.depth,
            payload_hash: record.payload_hash,
            idem_hit,
        })
    }

    pub fn create_context(&self, base_turn_id: u64) -> Result<ContextHead> {
        self.turns.create_context(base_turn_id, now_unix_ms())
    }

    pub fn get_head(&self, context_id: u64) -> Result<ContextHead> {
        self.turns.get_head(context_id)
    }

    pub fn get_last(
        &self,
        context_id: u64,
        limit: u32,
        include_payload: bool,
    ) -> Result<Vec<TurnItem>> {
        let records = self.turns.get_last(context_id, limit)?;
        self.hydrate(records, include_payload)
    }

    pub fn get_before(
        &self,
        context_id: u64,
        before_turn_id: u64,
        limit: u32,
        include_payload: bool,
    ) -> Result<Vec<TurnItem>> {
        let records = self.turns.get_before(context_id, before_turn_id, limit)?;
        self.hydrate(records, include_payload)
    }

    fn hydrate(&self, records: Vec<TurnRecord>, include_payload: bool) -> Result<Vec<TurnItem>> {
        records
            .into_iter()
            .map(|record| {
                let meta = self.turns.get_meta(record.turn_id)?;
                let payload = if include_payload {
                    Some(self.blobs.get_raw(&record.payload_hash)?)
                } else {
                    None
                };
                let fs_root = self.turns.get_fs_root(record.turn_id);
                Ok(TurnItem {
                    record,
                    meta,
                    payload,
                    fs_root,
                })
            })
            .collect()
    }

    pub fn put_blob(&self, claimed_hash: &[u8; 32], data: &[u8]) -> Result<([u8; 32], bool)> {
        self.blobs.insert_verified(claimed_hash, data)
    }

    pub fn get_blob(&self, hash: &[u8; 32]) -> Result<Vec<u8>> {
        self.blobs.get_raw(hash)
    }

    pub fn attach_fs(&self, turn_id: u64, fs_root_hash: [u8; 32]) -> Result<()> {
        self.turns.attach_fs(turn_id, fs_root_hash)
    }

    pub fn get_fs_root(&self, turn_id: u64) -> Option<[u8; 32]> {
        self.turns.get_fs_root(turn_id)
    }

    /// Snapshot visible at a turn: its own fs root, or the nearest
    /// ancestor's. Later turns inherit the workspace they were built on.
    pub fn effective_fs_root(&self, turn_id: u64) -> Result<Option<[u8; 32]>> {
        let mut cursor = turn_id;
        while cursor != 0 {
            if let Some(root) = self.turns.get_fs_root(cursor) {
                return Ok(Some(root));
            }
            cursor = self.turns.get_turn(cursor)?.parent_turn_id;
        }
        Ok(None)
    }

    /// Resolve a path inside the snapshot visible at a turn.
    pub fn locate_fs(&self, turn_id: u64, path: &str) -> Result<Located> {
        let root = self
            .effective_fs_root(turn_id)?
            .ok_or_else(|| StoreError::NotFound(format!("no fs snapshot for turn {turn_id}")))?;
        fs_tree::walk(|hash| self.blobs.get_raw(hash), root, path)
    }

    pub fn list_fs_entries(&self, turn_id: u64, path: &str) -> Result<Vec<TreeEntry>> {
        match self.locate_fs(turn_id, path)? {
            Located::Directory(entries) => Ok(entries),
            Located::File { .. } => Err(StoreError::InvalidInput(format!(
                "fs path {path} is a file, not a directory"
            ))),
        }
    }

    pub fn recent_contexts(&self, limit: usize) -> Result<Vec<ContextHead>> {
        self.turns.recent_contexts(limit)
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
