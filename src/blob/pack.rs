//! Append-only packfile holding blob records.
//!
//! Record layout (little-endian):
//! magic u32 | version u16 | codec u16 | raw_len u32 | stored_len u32 |
//! hash[32] | stored_bytes[stored_len] | crc32 u32
//!
//! The CRC is CRC-32C over header + stored bytes. A torn tail is detected
//! by a failed magic, length, or CRC check and truncated on recovery.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc32c::crc32c;

use crate::error::{Result, StoreError};

pub const PACK_MAGIC: u32 = 0x4253_4C42; // "BLSB" on disk, LE
pub const PACK_VERSION: u16 = 1;
pub const PACK_HEADER_LEN: usize = 4 + 2 + 2 + 4 + 4 + 32;

/// Upper bound on a single stored record, as a corruption guard: a bogus
/// stored_len in a torn header must not drive a giant allocation.
const MAX_STORED_LEN: u32 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackRecordHeader {
    pub codec: u16,
    pub raw_len: u32,
    pub stored_len: u32,
    pub hash: [u8; 32],
}

pub struct PackFile {
    file: File,
    path: PathBuf,
    len: u64,
}

impl PackFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append a record and flush it to durable storage. Returns the record
    /// offset. The caller publishes the index entry only after this returns.
    pub fn append(&mut self, header: &PackRecordHeader, stored: &[u8]) -> Result<u64> {
        debug_assert_eq!(header.stored_len as usize, stored.len());
        let offset = self.len;
        let frame = encode_record(header, stored);
        self.file.write_all(&frame)?;
        self.file.sync_data()?;
        self.len += frame.len() as u64;
        Ok(offset)
    }

    /// Read the record at `offset`, verifying magic, version, and CRC.
    pub fn read_at(&mut self, offset: u64) -> Result<(PackRecordHeader, Vec<u8>)> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut header_buf = [0u8; PACK_HEADER_LEN];
        self.file.read_exact(&mut header_buf)?;
        let header = decode_header(&header_buf)?;

        let mut stored = vec![0u8; header.stored_len as usize];
        self.file.read_exact(&mut stored)?;
        let mut crc_buf = [0u8; 4];
        self.file.read_exact(&mut crc_buf)?;
        let expected = u32::from_le_bytes(crc_buf);

        let mut crc = crc32c(&header_buf);
        crc = crc32c::crc32c_append(crc, &stored);
        if crc != expected {
            return Err(StoreError::Decode(format!(
                "pack record crc mismatch at offset {offset}: expected {expected:#x}, got {crc:#x}"
            )));
        }
        // Seek position is left at the tail; appends use O_APPEND so this
        // does not disturb the write path.
        Ok((header, stored))
    }

    /// Scan from the start, calling `visit` for every CRC-valid record.
    /// Returns the length of the valid prefix; anything past it is a torn
    /// tail the caller should truncate.
    pub fn scan(&mut self, mut visit: impl FnMut(u64, &PackRecordHeader)) -> Result<u64> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&mut self.file);
        let mut offset = 0u64;

        loop {
            let mut header_buf = [0u8; PACK_HEADER_LEN];
            match read_full(&mut reader, &mut header_buf)? {
                ReadOutcome::Eof => break,
                ReadOutcome::Short => break,
                ReadOutcome::Full => {}
            }
            let header = match decode_header(&header_buf) {
                Ok(h) => h,
                Err(_) => break,
            };

            let mut stored = vec![0u8; header.stored_len as usize];
            if !matches!(read_full(&mut reader, &mut stored)?, ReadOutcome::Full) {
                break;
            }
            let mut crc_buf = [0u8; 4];
            if !matches!(read_full(&mut reader, &mut crc_buf)?, ReadOutcome::Full) {
                break;
            }
            let expected = u32::from_le_bytes(crc_buf);
            let mut crc = crc32c(&header_buf);
            crc = crc32c::crc32c_append(crc, &stored);
            if crc != expected {
                break;
            }

            visit(offset, &header);
            offset += (PACK_HEADER_LEN + stored.len() + 4) as u64;
        }
        Ok(offset)
    }

    /// Truncate to `len`. Used by recovery to drop a torn tail.
    pub fn truncate_to(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.file.sync_all()?;
        self.len = len;
        Ok(())
    }
}

enum ReadOutcome {
    Full,
    Short,
    Eof,
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<ReadOutcome> {
    let mut read = 0usize;
    while read < buf.len() {
        let n = reader.read(&mut buf[read..])?;
        if n == 0 {
            return Ok(if read == 0 {
                ReadOutcome::Eof
            } else {
                ReadOutcome::Short
            });
        }
        read += n;
    }
    Ok(ReadOutcome::Full)
}

pub fn encode_record(header: &PackRecordHeader, stored: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PACK_HEADER_LEN + stored.len() + 4);
    buf.extend_from_slice(&PACK_MAGIC.to_le_bytes());
    buf.extend_from_slice(&PACK_VERSION.to_le_bytes());
    buf.extend_from_slice(&header.codec.to_le_bytes());
    buf.extend_from_slice(&header.raw_len.to_le_bytes());
    buf.extend_from_slice(&header.stored_len.to_le_bytes());
    buf.extend_from_slice(&header.hash);
    buf.extend_from_slice(stored);
    let crc = crc32c(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

fn decode_header(buf: &[u8; PACK_HEADER_LEN]) -> Result<PackRecordHeader> {
    let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != PACK_MAGIC {
        return Err(StoreError::Decode(format!(
            "pack magic mismatch: got {magic:#x}"
        )));
    }
    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version != PACK_VERSION {
        return Err(StoreError::Decode(format!(
            "unsupported pack version {version}"
        )));
    }
    let codec = u16::from_le_bytes([buf[6], buf[7]]);
    let raw_len = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
    let stored_len = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
    if stored_len > MAX_STORED_LEN {
        return Err(StoreError::Decode(format!(
            "pack record stored_len {stored_len} exceeds cap"
        )));
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&buf[16..48]);
    Ok(PackRecordHeader {
        codec,
        raw_len,
        stored_len,
        hash,
    })
}
