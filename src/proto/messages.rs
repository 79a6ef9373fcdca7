//! Request and response payload codecs.
//!
//! Field order is part of the protocol contract; see the message table in
//! the frame module. All integers are little-endian.

use crate::error::{Result, StoreError};
use crate::store::TurnItem;
use crate::turn::heads::ContextHead;

#[derive(Debug, Clone, Default)]
pub struct HelloRequest {
    pub protocol_version: u16,
    pub client_tag: String,
    pub client_meta_json: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppendTurnRequest {
    pub context_id: u64,
    pub parent_turn_id: u64,
    pub declared_type_id: String,
    pub declared_type_version: u32,
    pub encoding: u32,
    pub compression: u32,
    pub uncompressed_len: u32,
    pub content_hash: [u8; 32],
    pub payload_bytes: Vec<u8>,
    pub idempotency_key: Vec<u8>,
    /// Present when frame flags bit 0 is set.
    pub fs_root_hash: Option<[u8; 32]>,
}

#[derive(Debug, Clone, Copy)]
pub struct GetLastRequest {
    pub context_id: u64,
    pub limit: u32,
    pub include_payload: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct GetBeforeRequest {
    pub context_id: u64,
    pub before_turn_id: u64,
    pub limit: u32,
    pub include_payload: u32,
}

/// HELLO tolerates the legacy empty payload.
pub fn parse_hello(payload: &[u8]) -> Result<HelloRequest> {
    if payload.is_empty() {
        return Ok(HelloRequest::default());
    }
    let mut offset = 0usize;
    let protocol_version = read_u16(payload, &mut offset)?;
    let client_tag_len = read_u16(payload, &mut offset)? as usize;
    let client_tag = read_utf8(payload, &mut offset, client_tag_len, "client_tag")?;
    let meta_len = read_u32(payload, &mut offset)? as usize;
    let client_meta_json = if meta_len > 0 {
        Some(read_utf8(payload, &mut offset, meta_len, "client_meta_json")?)
    } else {
        None
    };
    Ok(HelloRequest {
        protocol_version,
        client_tag,
        client_meta_json,
    })
}

pub fn encode_hello_resp(session_id: u64, protocol_version: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10);
    buf.extend_from_slice(&session_id.to_le_bytes());
    buf.extend_from_slice(&protocol_version.to_le_bytes());
    buf
}

/// CTX_CREATE, CTX_FORK, and GET_HEAD all carry a single u64.
pub fn parse_u64(payload: &[u8]) -> Result<u64> {
    let mut offset = 0usize;
    read_u64(payload, &mut offset)
}

pub fn encode_context_head(head: &ContextHead) -> Vec<u8> {
    let mut buf = Vec::with_capacity(20);
    buf.extend_from_slice(&head.context_id.to_le_bytes());
    buf.extend_from_slice(&head.head_turn_id.to_le_bytes());
    buf.extend_from_slice(&head.head_depth.to_le_bytes());
    buf
}

pub fn parse_append_turn(payload: &[u8], flags: u16) -> Result<AppendTurnRequest> {
    let mut offset = 0usize;
    let context_id = read_u64(payload, &mut offset)?;
    let parent_turn_id = read_u64(payload, &mut offset)?;

    let type_id_len = read_u32(payload, &mut offset)? as usize;
    let declared_type_id = read_utf8(payload, &mut offset, type_id_len, "declared_type_id")?;
    let declared_type_version = read_u32(payload, &mut offset)?;

    let encoding = read_u32(payload, &mut offset)?;
    let compression = read_u32(payload, &mut offset)?;
    let uncompressed_len = read_u32(payload, &mut offset)?;
    let content_hash = read_hash(payload, &mut offset)?;

    let payload_len = read_u32(payload, &mut offset)? as usize;
    let payload_bytes = take(payload, &mut offset, payload_len)?.to_vec();

    let idem_len = read_u32(payload, &mut offset)? as usize;
    let idempotency_key = take(payload, &mut offset, idem_len)?.to_vec();

    let fs_root_hash = if flags & 1 != 0 {
        Some(read_hash(payload, &mut offset)?)
    } else {
        None
    };

    Ok(AppendTurnRequest {
        context_id,
        parent_turn_id,
        declared_type_id,
        declared_type_version,
        encoding,
        compression,
        uncompressed_len,
        content_hash,
        payload_bytes,
        idempotency_key,
        fs_root_hash,
    })
}

pub fn encode_append_ack(
    context_id: u64,
    new_turn_id: u64,
    new_depth: u32,
    payload_hash: &[u8; 32],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(52);
    buf.extend_from_slice(&context_id.to_le_bytes());
    buf.extend_from_slice(&new_turn_id.to_le_bytes());
    buf.extend_from_slice(&new_depth.to_le_bytes());
    buf.extend_from_slice(payload_hash);
    buf
}

pub fn parse_get_last(payload: &[u8]) -> Result<GetLastRequest> {
    let mut offset = 0usize;
    Ok(GetLastRequest {
        context_id: read_u64(payload, &mut offset)?,
        limit: read_u32(payload, &mut offset)?,
        include_payload: read_u32(payload, &mut offset)?,
    })
}

pub fn parse_get_before(payload: &[u8]) -> Result<GetBeforeRequest> {
    let mut offset = 0usize;
    Ok(GetBeforeRequest {
        context_id: read_u64(payload, &mut offset)?,
        before_turn_id: read_u64(payload, &mut offset)?,
        limit: read_u32(payload, &mut offset)?,
        include_payload: read_u32(payload, &mut offset)?,
    })
}

/// Turn list shared by GET_LAST and GET_BEFORE. Payloads go out
/// uncompressed regardless of how they arrived, so compression is always
/// encoded as 0 and uncompressed_len mirrors the actual byte count.
pub fn encode_turn_items(items: &[TurnItem]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
    for item in items {
        buf.extend_from_slice(&item.record.turn_id.to_le_bytes());
        buf.extend_from_slice(&item.record.parent_turn_id.to_le_bytes());
        buf.extend_from_slice(&item.record.depth.to_le_bytes());

        let type_id = item.meta.declared_type_id.as_bytes();
        buf.extend_from_slice(&(type_id.len() as u32).to_le_bytes());
        buf.extend_from_slice(type_id);
        buf.extend_from_slice(&item.meta.declared_type_version.to_le_bytes());
        buf.extend_from_slice(&item.meta.encoding.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // compression

        let payload = item.payload.as_deref().unwrap_or(&[]);
        let uncompressed_len = if item.payload.is_some() {
            payload.len() as u32
        } else {
            item.meta.uncompressed_len
        };
        buf.extend_from_slice(&uncompressed_len.to_le_bytes());
        buf.extend_from_slice(&item.record.payload_hash);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);
    }
    buf
}

pub fn parse_get_blob(payload: &[u8]) -> Result<[u8; 32]> {
    if payload.len() != 32 {
        return Err(StoreError::InvalidInput(format!(
            "blob hash is {} bytes, want 32",
            payload.len()
        )));
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(payload);
    Ok(hash)
}

pub fn encode_get_blob_resp(hash: &[u8; 32], raw: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(36 + raw.len());
    buf.extend_from_slice(hash);
    buf.extend_from_slice(&(raw.len() as u32).to_le_bytes());
    buf.extend_from_slice(raw);
    buf
}

pub fn parse_attach_fs(payload: &[u8]) -> Result<(u64, [u8; 32])> {
    let mut offset = 0usize;
    let turn_id = read_u64(payload, &mut offset)?;
    let fs_root_hash = read_hash(payload, &mut offset)?;
    Ok((turn_id, fs_root_hash))
}

pub fn encode_attach_fs_resp(turn_id: u64, fs_root_hash: &[u8; 32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(40);
    buf.extend_from_slice(&turn_id.to_le_bytes());
    buf.extend_from_slice(fs_root_hash);
    buf
}

pub fn parse_put_blob(payload: &[u8]) -> Result<([u8; 32], Vec<u8>)> {
    let mut offset = 0usize;
    let hash = read_hash(payload, &mut offset)?;
    let data_len = read_u32(payload, &mut offset)? as usize;
    let data = take(payload, &mut offset, data_len)?.to_vec();
    Ok((hash, data))
}

pub fn encode_put_blob_resp(hash: &[u8; 32], was_new: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(33);
    buf.extend_from_slice(hash);
    buf.push(u8::from(was_new));
    buf
}

pub fn encode_error(code: u32, detail: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + detail.len());
    buf.extend_from_slice(&code.to_le_bytes());
    buf.extend_from_slice(&(detail.len() as u32).to_le_bytes());
    buf.extend_from_slice(detail.as_bytes());
    buf
}

fn take<'a>(payload: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = offset
        .checked_add(len)
        .filter(|end| *end <= payload.len())
        .ok_or_else(|| StoreError::InvalidInput("request payload truncated".into()))?;
    let slice = &payload[*offset..end];
    *offset = end;
    Ok(slice)
}

fn read_u16(payload: &[u8], offset: &mut usize) -> Result<u16> {
    let slice = take(payload, offset, 2)?;
    Ok(u16::from_le_bytes([slice[0], slice[1]]))
}

fn read_u32(payload: &[u8], offset: &mut usize) -> Result<u32> {
    let slice = take(payload, offset, 4)?;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn read_u64(payload: &[u8], offset: &mut usize) -> Result<u64> {
    let slice = take(payload, offset, 8)?;
    Ok(u64::from_le_bytes([
        slice[0], slice[1], slice[2], slice[3], slice[4], slice[5], slice[6], slice[7],
    ]))
}

fn read_hash(payload: &[u8], offset: &mut usize) -> Result<[u8; 32]> {
    let slice = take(payload, offset, 32)?;
    let mut hash = [0u8; 32];
    hash.copy_from_slice(slice);
    Ok(hash)
}

fn read_utf8(payload: &[u8], offset: &mut usize, len: usize, field: &str) -> Result<String> {
    let slice = take(payload, offset, len)?;
    std::str::from_utf8(slice)
        .map(str::to_string)
        .map_err(|_| StoreError::InvalidInput(format!("{field} is not utf-8")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::meta::TurnMeta;
    use crate::turn::record::TurnRecord;

    fn build_append_payload(with_idem: &[u8]) -> Vec<u8> {
        let payload = b"msgpack-bytes";
        let mut buf = Vec::new();
        buf.extend_from_slice(&7u64.to_le_bytes()); // context_id
        buf.extend_from_slice(&0u64.to_le_bytes()); // parent
        let type_id = b"com.example.Message";
        buf.extend_from_slice(&(type_id.len() as u32).to_le_bytes());
        buf.extend_from_slice(type_id);
        buf.extend_from_slice(&3u32.to_le_bytes()); // version
        buf.extend_from_slice(&1u32.to_le_bytes()); // encoding
        buf.extend_from_slice(&0u32.to_le_bytes()); // compression
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&[0xCD; 32]); // content hash
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);
        buf.extend_from_slice(&(with_idem.len() as u32).to_le_bytes());
        buf.extend_from_slice(with_idem);
        buf
    }

    #[test]
    fn append_turn_parses_all_fields() {
        let buf = build_append_payload(b"key-1");
        let req = parse_append_turn(&buf, 0).unwrap();
        assert_eq!(req.context_id, 7);
        assert_eq!(req.declared_type_id, "com.example.Message");
        assert_eq!(req.declared_type_version, 3);
        assert_eq!(req.payload_bytes, b"msgpack-bytes");
        assert_eq!(req.idempotency_key, b"key-1");
        assert!(req.fs_root_hash.is_none());
    }

    #[test]
    fn append_turn_reads_fs_root_when_flagged() {
        let mut buf = build_append_payload(b"");
        buf.extend_from_slice(&[0xEE; 32]);
        let req = parse_append_turn(&buf, 1).unwrap();
        assert_eq!(req.fs_root_hash, Some([0xEE; 32]));
    }

    #[test]
    fn truncated_append_is_invalid() {
        let buf = build_append_payload(b"");
        let err = parse_append_turn(&buf[..30], 0).unwrap_err();
        assert!(matches!(err, StoreError::InvalidInput(_)));
    }

    #[test]
    fn hello_empty_payload_defaults() {
        let req = parse_hello(&[]).unwrap();
        assert_eq!(req.protocol_version, 0);
        assert!(req.client_tag.is_empty());
    }

    #[test]
    fn hello_with_tag_roundtrip() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u16.to_le_bytes());
        buf.extend_from_slice(&(4u16).to_le_bytes());
        buf.extend_from_slice(b"tool");
        buf.extend_from_slice(&0u32.to_le_bytes());
        let req = parse_hello(&buf).unwrap();
        assert_eq!(req.protocol_version, 1);
        assert_eq!(req.client_tag, "tool");
        assert!(req.client_meta_json.is_none());
    }

    #[test]
    fn turn_items_encode_matches_reader_layout() {
        let items = vec![TurnItem {
            record: TurnRecord {
                turn_id: 5,
                parent_turn_id: 4,
                depth: 2,
                codec: 0,
                type_tag: 0,
                payload_hash: [9u8; 32],
                flags: 0,
                created_at_unix_ms: 0,
            },
            meta: TurnMeta {
                declared_type_id: "t.M".into(),
                declared_type_version: 1,
                encoding: 1,
                compression: 1,
                uncompressed_len: 3,
            },
            payload: Some(b"abc".to_vec()),
            fs_root: None,
        }];
        let buf = encode_turn_items(&items);

        let mut offset = 0usize;
        assert_eq!(read_u32(&buf, &mut offset).unwrap(), 1); // count
        assert_eq!(read_u64(&buf, &mut offset).unwrap(), 5); // turn_id
        assert_eq!(read_u64(&buf, &mut offset).unwrap(), 4); // parent
        assert_eq!(read_u32(&buf, &mut offset).unwrap(), 2); // depth
        let type_len = read_u32(&buf, &mut offset).unwrap() as usize;
        assert_eq!(take(&buf, &mut offset, type_len).unwrap(), b"t.M");
        assert_eq!(read_u32(&buf, &mut offset).unwrap(), 1); // version
        assert_eq!(read_u32(&buf, &mut offset).unwrap(), 1); // encoding
        assert_eq!(read_u32(&buf, &mut offset).unwrap(), 0); // compression forced to 0
        assert_eq!(read_u32(&buf, &mut offset).unwrap(), 3); // uncompressed_len
        assert_eq!(read_hash(&buf, &mut offset).unwrap(), [9u8; 32]);
        let payload_len = read_u32(&buf, &mut offset).unwrap() as usize;
        assert_eq!(take(&buf, &mut offset, payload_len).unwrap(), b"abc");
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn put_blob_roundtrip() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&[7u8; 32]);
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(b"abc");
        let (hash, data) = parse_put_blob(&buf).unwrap();
        assert_eq!(hash, [7u8; 32]);
        assert_eq!(data, b"abc");

        let resp = encode_put_blob_resp(&hash, true);
        assert_eq!(resp.len(), 33);
        assert_eq!(resp[32], 1);
    }

    #[test]
    fn error_payload_layout() {
        let buf = encode_error(404, "not found");
        assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), 404);
        assert_eq!(u32::from_le_bytes(buf[4..8].try_into().unwrap()), 9);
        assert_eq!(&buf[8..], b"not found");
    }
}
