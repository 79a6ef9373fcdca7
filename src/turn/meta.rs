//! Variable-length metadata side file keyed by turn_id.
//!
//! Record framing: body_len u32 | body | crc32 u32, where body is
//! turn_id u64 | type_id_len u32 | type_id | type_version u32 |
//! encoding u32 | compression u32 | uncompressed_len u32. The CRC covers
//! the body, so a torn tail truncates the same way the main log does.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crc32c::crc32c;

use crate::error::{Result, StoreError};

/// Guard against absurd body lengths from a torn length prefix.
const MAX_BODY_LEN: u32 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnMeta {
    pub declared_type_id: String,
    pub declared_type_version: u32,
    pub encoding: u32,
    pub compression: u32,
    pub uncompressed_len: u32,
}

pub struct MetaFile {
    file: File,
    records: HashMap<u64, TurnMeta>,
}

impl MetaFile {
    /// Open and replay. `is_live` filters out records for turns that were
    /// truncated from the log before this file is read.
    pub fn open(dir: &Path, is_live: impl Fn(u64) -> bool) -> Result<Self> {
        let path = dir.join("turns.meta");
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let (records, valid_len) = scan(&mut file, &is_live)?;
        let disk_len = file.metadata()?.len();
        if valid_len < disk_len {
            tracing::warn!(
                meta = %path.display(),
                dropped = disk_len - valid_len,
                "truncating torn tail from turn metadata"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        Ok(Self { file, records })
    }

    pub fn append(&mut self, turn_id: u64, meta: &TurnMeta) -> Result<()> {
        let mut body = Vec::with_capacity(32 + meta.declared_type_id.len());
        body.extend_from_slice(&turn_id.to_le_bytes());
        body.extend_from_slice(&(meta.declared_type_id.len() as u32).to_le_bytes());
        body.extend_from_slice(meta.declared_type_id.as_bytes());
        body.extend_from_slice(&meta.declared_type_version.to_le_bytes());
        body.extend_from_slice(&meta.encoding.to_le_bytes());
        body.extend_from_slice(&meta.compression.to_le_bytes());
        body.extend_from_slice(&meta.uncompressed_len.to_le_bytes());

        let mut frame = Vec::with_capacity(body.len() + 8);
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);
        frame.extend_from_slice(&crc32c(&body).to_le_bytes());

        self.file.write_all(&frame)?;
        self.file.sync_data()?;
        self.records.insert(turn_id, meta.clone());
        Ok(())
    }

    pub fn get(&self, turn_id: u64) -> Option<&TurnMeta> {
        self.records.get(&turn_id)
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }
}

fn scan(
    file: &mut File,
    is_live: &impl Fn(u64) -> bool,
) -> Result<(HashMap<u64, TurnMeta>, u64)> {
    file.seek(SeekFrom::Start(0))?;
    let mut reader = BufReader::new(file);
    let mut records = HashMap::new();
    let mut offset = 0u64;

    loop {
        let mut len_buf = [0u8; 4];
        if !read_full(&mut reader, &mut len_buf)? {
            break;
        }
        let body_len = u32::from_le_bytes(len_buf);
        if body_len == 0 || body_len > MAX_BODY_LEN {
            break;
        }
        let mut body = vec![0u8; body_len as usize];
        if !read_full(&mut reader, &mut body)? {
            break;
        }
        let mut crc_buf = [0u8; 4];
        if !read_full(&mut reader, &mut crc_buf)? {
            break;
        }
        if crc32c(&body) != u32::from_le_bytes(crc_buf) {
            break;
        }
        match decode_body(&body) {
            Ok((turn_id, meta)) => {
                if is_live(turn_id) {
                    records.insert(turn_id, meta);
                }
            }
            Err(_) => break,
        }
        offset += 4 + body_len as u64 + 4;
    }
    Ok((records, offset))
}

fn decode_body(body: &[u8]) -> Result<(u64, TurnMeta)> {
    let mut offset = 0usize;
    let turn_id = u64::from_le_bytes(take(body, &mut offset, 8)?.try_into().unwrap());
    let type_id_len =
        u32::from_le_bytes(take(body, &mut offset, 4)?.try_into().unwrap()) as usize;
    let type_id_bytes = take(body, &mut offset, type_id_len)?;
    let declared_type_id = std::str::from_utf8(type_id_bytes)
        .map_err(|_| StoreError::Decode("turn meta type_id not utf-8".into()))?
        .to_string();
    let declared_type_version =
        u32::from_le_bytes(take(body, &mut offset, 4)?.try_into().unwrap());
    let encoding = u32::from_le_bytes(take(body, &mut offset, 4)?.try_into().unwrap());
    let compression = u32::from_le_bytes(take(body, &mut offset, 4)?.try_into().unwrap());
    let uncompressed_len = u32::from_le_bytes(take(body, &mut offset, 4)?.try_into().unwrap());
    Ok((
        turn_id,
        TurnMeta {
            declared_type_id,
            declared_type_version,
            encoding,
            compression,
            uncompressed_len,
        },
    ))
}

fn take<'a>(bytes: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = offset
        .checked_add(len)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| StoreError::Decode("turn meta body truncated".into()))?;
    let slice = &bytes[*offset..end];
    *offset = end;
    Ok(slice)
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
