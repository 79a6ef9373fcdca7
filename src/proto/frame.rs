//! Frame codec for the persistent binary connection.
//!
//! Frame layout (little-endian): len u32 | msg_type u16 | flags u16 |
//! req_id u64 | payload[len]. Responses echo the request's req_id so a
//! client may multiplex requests over one connection.

use std::io::{Read, Write};

use crate::error::{Result, StoreError};

/// Frames larger than this are rejected outright: a corrupted or hostile
/// length prefix must not drive a giant allocation.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

pub const FRAME_HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MsgType {
    Hello = 1,
    CtxCreate = 2,
    CtxFork = 3,
    GetHead = 4,
    AppendTurn = 5,
    GetLast = 6,
    GetBefore = 7,
    GetBlob = 9,
    AttachFs = 10,
    PutBlob = 11,
    Error = 255,
}

impl MsgType {
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(MsgType::Hello),
            2 => Some(MsgType::CtxCreate),
            3 => Some(MsgType::CtxFork),
            4 => Some(MsgType::GetHead),
            5 => Some(MsgType::AppendTurn),
            6 => Some(MsgType::GetLast),
            7 => Some(MsgType::GetBefore),
            9 => Some(MsgType::GetBlob),
            10 => Some(MsgType::AttachFs),
            11 => Some(MsgType::PutBlob),
            255 => Some(MsgType::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub len: u32,
    pub msg_type: u16,
    pub flags: u16,
    pub req_id: u64,
}

/// Read one frame. Returns `Ok(None)` on a clean EOF at a frame boundary.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<(FrameHeader, Vec<u8>)>> {
    let mut header_buf = [0u8; FRAME_HEADER_LEN];
    let mut read = 0usize;
    while read < header_buf.len() {
        let n = reader.read(&mut header_buf[read..])?;
        if n == 0 {
            if read == 0 {
                return Ok(None);
            }
            return Err(StoreError::InvalidInput(
                "connection closed mid frame header".into(),
            ));
        }
        read += n;
    }

    let len = u32::from_le_bytes(header_buf[0..4].try_into().unwrap());
    if len > MAX_FRAME_SIZE {
        return Err(StoreError::InvalidInput(format!(
            "frame size {len} exceeds maximum {MAX_FRAME_SIZE}"
        )));
    }
    let header = FrameHeader {
        len,
        msg_type: u16::from_le_bytes(header_buf[4..6].try_into().unwrap()),
        flags: u16::from_le_bytes(header_buf[6..8].try_into().unwrap()),
        req_id: u64::from_le_bytes(header_buf[8..16].try_into().unwrap()),
    };

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(Some((header, payload)))
}

pub fn write_frame<W: Write>(
    writer: &mut W,
    msg_type: u16,
    flags: u16,
    req_id: u64,
    payload: &[u8],
) -> Result<()> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&msg_type.to_le_bytes());
    buf.extend_from_slice(&flags.to_le_bytes());
    buf.extend_from_slice(&req_id.to_le_bytes());
    buf.extend_from_slice(payload);
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}
