//! Append-only per-context head table.
//!
//! Record layout (36 bytes, little-endian):
//! context_id u64 | head_turn_id u64 | head_depth u32 | flags u32 |
//! created_at_unix_ms u64 | crc32 u32
//!
//! The last valid record per context wins. Appending a head record is the
//! commit point of a turn append: everything before it is garbage-collected
//! naturally by recovery if the process dies first.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crc32c::crc32c;

use crate::error::{Result, StoreError};

pub const HEAD_RECORD_LEN: usize = 8 + 8 + 4 + 4 + 8 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextHead {
    pub context_id: u64,
    pub head_turn_id: u64,
    pub head_depth: u32,
    pub created_at_unix_ms: u64,
}

pub struct HeadsFile {
    file: File,
    len: u64,
}

impl HeadsFile {
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join("heads.tbl");
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let valid_len = valid_prefix_len(&mut file)?;
        let disk_len = file.metadata()?.len();
        if valid_len < disk_len {
            tracing::warn!(
                heads = %path.display(),
                dropped = disk_len - valid_len,
                "truncating torn tail from heads table"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        Ok(Self {
            file,
            len: valid_len,
        })
    }

    pub fn append(&mut self, head: &ContextHead) -> Result<()> {
        self.file.write_all(&encode(head))?;
        self.file.sync_data()?;
        self.len += HEAD_RECORD_LEN as u64;
        Ok(())
    }

    /// Load the latest head per context plus the highest context_id seen.
    pub fn load_all(&mut self) -> Result<(HashMap<u64, ContextHead>, u64)> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&mut self.file);
        let mut heads = HashMap::new();
        let mut max_context_id = 0u64;
        let mut buf = [0u8; HEAD_RECORD_LEN];
        loop {
            if !read_full(&mut reader, &mut buf)? {
                break;
            }
            let head = decode(&buf)?;
            max_context_id = max_context_id.max(head.context_id);
            heads.insert(head.context_id, head);
        }
        Ok((heads, max_context_id))
    }

    /// Backward scan for the most recent record of one context. Used on
    /// head-cache misses so the full head set never has to stay resident.
    pub fn find_latest(&mut self, context_id: u64) -> Result<Option<ContextHead>> {
        let count = self.len / HEAD_RECORD_LEN as u64;
        let mut buf = [0u8; HEAD_RECORD_LEN];
        for i in (0..count).rev() {
            self.file
                .seek(SeekFrom::Start(i * HEAD_RECORD_LEN as u64))?;
            self.file.read_exact(&mut buf)?;
            let head = decode(&buf)?;
            if head.context_id == context_id {
                return Ok(Some(head));
            }
        }
        Ok(None)
    }

    /// Backward scan for the most recent record of one context whose turn
    /// satisfies `is_live`. Recovery uses this to demote a head whose turn
    /// was truncated to the newest surviving ancestor.
    pub fn find_latest_live(
        &mut self,
        context_id: u64,
        is_live: impl Fn(u64) -> bool,
    ) -> Result<Option<ContextHead>> {
        let count = self.len / HEAD_RECORD_LEN as u64;
        let mut buf = [0u8; HEAD_RECORD_LEN];
        for i in (0..count).rev() {
            self.file
                .seek(SeekFrom::Start(i * HEAD_RECORD_LEN as u64))?;
            self.file.read_exact(&mut buf)?;
            let head = decode(&buf)?;
            if head.context_id == context_id && is_live(head.head_turn_id) {
                return Ok(Some(head));
            }
        }
        Ok(None)
    }

    /// Most recently touched contexts, newest first, deduplicated.
    pub fn recent_contexts(&mut self, limit: usize) -> Result<Vec<ContextHead>> {
        let count = self.len / HEAD_RECORD_LEN as u64;
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        let mut buf = [0u8; HEAD_RECORD_LEN];
        for i in (0..count).rev() {
            if out.len() >= limit {
                break;
            }
            self.file
                .seek(SeekFrom::Start(i * HEAD_RECORD_LEN as u64))?;
            self.file.read_exact(&mut buf)?;
            let head = decode(&buf)?;
            if seen.insert(head.context_id) {
                out.push(head);
            }
        }
        Ok(out)
    }
}

fn encode(head: &ContextHead) -> [u8; HEAD_RECORD_LEN] {
    let mut buf = [0u8; HEAD_RECORD_LEN];
    buf[0..8].copy_from_slice(&head.context_id.to_le_bytes());
    buf[8..16].copy_from_slice(&head.head_turn_id.to_le_bytes());
    buf[16..20].copy_from_slice(&head.head_depth.to_le_bytes());
    // bytes 20..24: flags, reserved zero in v1
    buf[24..32].copy_from_slice(&head.created_at_unix_ms.to_le_bytes());
    let crc = crc32c(&buf[..32]);
    buf[32..36].copy_from_slice(&crc.to_le_bytes());
    buf
}

fn decode(buf: &[u8; HEAD_RECORD_LEN]) -> Result<ContextHead> {
    let expected = u32::from_le_bytes(buf[32..36].try_into().unwrap());
    let actual = crc32c(&buf[..32]);
    if actual != expected {
        return Err(StoreError::Decode(format!(
            "head record crc mismatch: expected {expected:#x}, got {actual:#x}"
        )));
    }
    Ok(ContextHead {
        context_id: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
        head_turn_id: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        head_depth: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
        created_at_unix_ms: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
    })
}

fn valid_prefix_len(file: &mut File) -> Result<u64> {
    file.seek(SeekFrom::Start(0))?;
    let mut reader = BufReader::new(file);
    let mut buf = [0u8; HEAD_RECORD_LEN];
    let mut offset = 0u64;
    loop {
        if !read_full(&mut reader, &mut buf)? {
            break;
        }
        if decode(&buf).is_err() {
            break;
        }
        offset += HEAD_RECORD_LEN as u64;
    }
    Ok(offset)
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    let mut read = 0usize;
    while read < buf.len() {
        let n = reader.read(&mut buf[read..])?;
        if n == 0 {
            return Ok(false);
        }
        read += n;
    }
    Ok(true)
}
