//! Turn log and its fixed-size offset index.
//!
//! `turns.log` is a sequence of 80-byte `TurnRecord`s; `turns.idx` maps
//! turn_id to log offset in 16-byte entries. Recovery scans the log,
//! truncates the tail at the first record that fails CRC or breaks the
//! monotonic turn_id sequence, and rebuilds the index when stale.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Result, StoreError};
use crate::turn::record::{TURN_RECORD_LEN, TurnRecord};

const IDX_ENTRY_LEN: usize = 16;

pub struct TurnLog {
    log: File,
    idx: File,
    offsets: HashMap<u64, u64>,
    len: u64,
    max_turn_id: u64,
}

impl TurnLog {
    pub fn open(dir: &Path) -> Result<Self> {
        let log_path = dir.join("turns.log");
        let idx_path = dir.join("turns.idx");

        let mut log = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&log_path)?;

        let (offsets, valid_len, max_turn_id) = scan_log(&mut log)?;
        let disk_len = log.metadata()?.len();
        if valid_len < disk_len {
            tracing::warn!(
                log = %log_path.display(),
                dropped = disk_len - valid_len,
                "truncating torn tail from turn log"
            );
            log.set_len(valid_len)?;
            log.sync_all()?;
        }

        let idx = open_or_rebuild_idx(&idx_path, &offsets)?;

        Ok(Self {
            log,
            idx,
            offsets,
            len: valid_len,
            max_turn_id,
        })
    }

    pub fn append(&mut self, record: &TurnRecord) -> Result<u64> {
        if record.turn_id <= self.max_turn_id {
            return Err(StoreError::Corrupt(format!(
                "turn_id {} not greater than log max {}",
                record.turn_id, self.max_turn_id
            )));
        }
        let offset = self.len;
        self.log.write_all(&record.encode())?;
        self.log.sync_data()?;

        let mut idx_entry = [0u8; IDX_ENTRY_LEN];
        idx_entry[..8].copy_from_slice(&record.turn_id.to_le_bytes());
        idx_entry[8..].copy_from_slice(&offset.to_le_bytes());
        self.idx.write_all(&idx_entry)?;
        self.idx.flush()?;

        self.offsets.insert(record.turn_id, offset);
        self.len += TURN_RECORD_LEN as u64;
        self.max_turn_id = record.turn_id;
        Ok(offset)
    }

    pub fn get(&mut self, turn_id: u64) -> Result<TurnRecord> {
        let offset = *self
            .offsets
            .get(&turn_id)
            .ok_or_else(|| StoreError::NotFound(format!("turn {turn_id}")))?;
        self.log.seek(SeekFrom::Start(offset))?;
        let mut buf = [0u8; TURN_RECORD_LEN];
        self.log.read_exact(&mut buf)?;
        let record = TurnRecord::decode(&buf)?;
        if record.turn_id != turn_id {
            return Err(StoreError::Corrupt(format!(
                "turn log offset {offset} holds turn {} but index claims {turn_id}",
                record.turn_id
            )));
        }
        Ok(record)
    }

    pub fn contains(&self, turn_id: u64) -> bool {
        self.offsets.contains_key(&turn_id)
    }

    pub fn max_turn_id(&self) -> u64 {
        self.max_turn_id
    }

    pub fn count(&self) -> usize {
        self.offsets.len()
    }
}

fn scan_log(log: &mut File) -> Result<(HashMap<u64, u64>, u64, u64)> {
    log.seek(SeekFrom::Start(0))?;
    let mut reader = BufReader::new(log);
    let mut offsets = HashMap::new();
    let mut offset = 0u64;
    let mut max_turn_id = 0u64;

    loop {
        let mut buf = [0u8; TURN_RECORD_LEN];
        let mut read = 0usize;
        let mut eof = false;
        while read < buf.len() {
            let n = reader.read(&mut buf[read..])?;
            if n == 0 {
                eof = true;
                break;
            }
            read += n;
        }
        if eof && read == 0 {
            break;
        }
        if read < buf.len() {
            break; // torn tail
        }
        let record = match TurnRecord::decode(&buf) {
            Ok(r) => r,
            Err(_) => break,
        };
        if record.turn_id <= max_turn_id {
            break; // sequence violation: treat the rest as garbage
        }
        offsets.insert(record.turn_id, offset);
        max_turn_id = record.turn_id;
        offset += TURN_RECORD_LEN as u64;
    }
    Ok((offsets, offset, max_turn_id))
}

fn open_or_rebuild_idx(idx_path: &Path, offsets: &HashMap<u64, u64>) -> Result<File> {
    let mut idx = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(idx_path)?;

    let mut disk = HashMap::new();
    {
        idx.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&mut idx);
        let mut buf = [0u8; IDX_ENTRY_LEN];
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
            let turn_id = u64::from_le_bytes(buf[..8].try_into().unwrap());
            let offset = u64::from_le_bytes(buf[8..].try_into().unwrap());
            disk.insert(turn_id, offset);
        }
    }

    if &disk != offsets {
        tracing::info!(entries = offsets.len(), "rebuilding turn index from log scan");
        let mut sorted: Vec<_> = offsets.iter().collect();
        sorted.sort_by_key(|(turn_id, _)| **turn_id);
        let mut fresh = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(idx_path)?;
        for (turn_id, offset) in sorted {
            let mut entry = [0u8; IDX_ENTRY_LEN];
            entry[..8].copy_from_slice(&turn_id.to_le_bytes());
            entry[8..].copy_from_slice(&offset.to_le_bytes());
            fresh.write_all(&entry)?;
        }
        fresh.sync_data()?;
        drop(fresh);
        idx = OpenOptions::new().read(true).append(true).open(idx_path)?;
    }
    Ok(idx)
}
