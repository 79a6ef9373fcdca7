//! Shared fixtures: an in-process server and a minimal wire client.
#![allow(dead_code)] // each test binary uses a subset of these helpers

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;

use tempfile::TempDir;

use cxdb::blob::codec::content_hash;
use cxdb::http::{HttpHandle, start_http};
use cxdb::metrics::Metrics;
use cxdb::proto::frame::MsgType;
use cxdb::proto::server::{ServerShared, start_server};
use cxdb::proto::session::SessionIds;
use cxdb::registry::Registry;
use cxdb::store::Store;

pub struct TestServer {
    pub addr: SocketAddr,
    pub store: Arc<Store>,
    pub registry: Arc<Registry>,
    pub http: Option<HttpHandle>,
    _data_dir: TempDir,
}

impl TestServer {
    pub fn start() -> Self {
        Self::start_with(false, false)
    }

    pub fn start_with(strict_types: bool, with_http: bool) -> Self {
        let data_dir = TempDir::new().expect("tempdir");
        let store = Arc::new(Store::open(data_dir.path(), 1024 * 1024).expect("open store"));
        let registry =
            Arc::new(Registry::open(&data_dir.path().join("registry")).expect("open registry"));
        let metrics = Arc::new(Metrics::new());

        let http = with_http.then(|| {
            start_http(
                "127.0.0.1:0",
                Arc::clone(&store),
                Arc::clone(&registry),
                Arc::clone(&metrics),
            )
            .expect("start http")
        });

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let shared = Arc::new(ServerShared {
            store: Arc::clone(&store),
            registry: Arc::clone(&registry),
            metrics,
            strict_types,
            max_inflight_per_conn: 64,
            session_ids: SessionIds::new(),
        });
        let handle = start_server(listener, shared).expect("start server");

        TestServer {
            addr: handle.local_addr,
            store,
            registry,
            http,
            _data_dir: data_dir,
        }
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http.as_ref().expect("http not started").local_addr
    }
}

/// One framed response.
pub struct Reply {
    pub msg_type: u16,
    pub payload: Vec<u8>,
}

impl Reply {
    pub fn expect_ok(self, expected: MsgType) -> Vec<u8> {
        if self.msg_type == MsgType::Error as u16 {
            let (code, detail) = parse_error(&self.payload);
            panic!("server error {code}: {detail}");
        }
        assert_eq!(self.msg_type, expected as u16, "unexpected response type");
        self.payload
    }

    pub fn expect_error(self) -> (u32, String) {
        assert_eq!(self.msg_type, MsgType::Error as u16, "expected an error frame");
        parse_error(&self.payload)
    }
}

fn parse_error(payload: &[u8]) -> (u32, String) {
    let code = u32::from_le_bytes(payload[0..4].try_into().unwrap());
    let len = u32::from_le_bytes(payload[4..8].try_into().unwrap()) as usize;
    let detail = String::from_utf8_lossy(&payload[8..8 + len]).to_string();
    (code, detail)
}

pub struct Client {
    stream: TcpStream,
    next_req_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireTurn {
    pub turn_id: u64,
    pub parent_turn_id: u64,
    pub depth: u32,
    pub type_id: String,
    pub type_version: u32,
    pub encoding: u32,
    pub compression: u32,
    pub uncompressed_len: u32,
    pub payload_hash: [u8; 32],
    pub payload: Vec<u8>,
}

impl Client {
    /// Connect and complete the HELLO handshake.
    pub fn connect(addr: SocketAddr) -> Self {
        let mut client = Self::connect_raw(addr);
        let payload = client.hello_payload("test-client");
        let resp = client.send(MsgType::Hello as u16, 0, &payload);
        let payload = resp.expect_ok(MsgType::Hello);
        assert!(payload.len() >= 10);
        client
    }

    /// Connect without sending HELLO (for handshake gating tests).
    pub fn connect_raw(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect");
        stream.set_nodelay(true).expect("nodelay");
        Self {
            stream,
            next_req_id: 0,
        }
    }

    fn hello_payload(&self, tag: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u16.to_le_bytes());
        buf.extend_from_slice(&(tag.len() as u16).to_le_bytes());
        buf.extend_from_slice(tag.as_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf
    }

    pub fn send(&mut self, msg_type: u16, flags: u16, payload: &[u8]) -> Reply {
        self.next_req_id += 1;
        let req_id = self.next_req_id;

        let mut frame = Vec::with_capacity(16 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&msg_type.to_le_bytes());
        frame.extend_from_slice(&flags.to_le_bytes());
        frame.extend_from_slice(&req_id.to_le_bytes());
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame).expect("write frame");

        let mut header = [0u8; 16];
        self.stream.read_exact(&mut header).expect("read header");
        let len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
        let resp_type = u16::from_le_bytes(header[4..6].try_into().unwrap());
        let resp_req_id = u64::from_le_bytes(header[8..16].try_into().unwrap());
        assert_eq!(resp_req_id, req_id, "response req_id mismatch");

        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).expect("read payload");
        Reply {
            msg_type: resp_type,
            payload,
        }
    }

    pub fn ctx_create(&mut self, base_turn_id: u64) -> (u64, u64, u32) {
        let resp = self.send(MsgType::CtxCreate as u16, 0, &base_turn_id.to_le_bytes());
        parse_context_head(&resp.expect_ok(MsgType::CtxCreate))
    }

    pub fn ctx_fork(&mut self, base_turn_id: u64) -> (u64, u64, u32) {
        let resp = self.send(MsgType::CtxFork as u16, 0, &base_turn_id.to_le_bytes());
        parse_context_head(&resp.expect_ok(MsgType::CtxFork))
    }

    pub fn get_head(&mut self, context_id: u64) -> (u64, u64, u32) {
        let resp = self.send(MsgType::GetHead as u16, 0, &context_id.to_le_bytes());
        parse_context_head(&resp.expect_ok(MsgType::GetHead))
    }

    pub fn append_payload(
        context_id: u64,
        parent_turn_id: u64,
        type_id: &str,
        type_version: u32,
        payload: &[u8],
        idem_key: &[u8],
    ) -> Vec<u8> {
        let hash = content_hash(payload);
        let mut buf = Vec::new();
        buf.extend_from_slice(&context_id.to_le_bytes());
        buf.extend_from_slice(&parent_turn_id.to_le_bytes());
        buf.extend_from_slice(&(type_id.len() as u32).to_le_bytes());
        buf.extend_from_slice(type_id.as_bytes());
        buf.extend_from_slice(&type_version.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes()); // encoding: msgpack
        buf.extend_from_slice(&0u32.to_le_bytes()); // compression: none
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&hash);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);
        buf.extend_from_slice(&(idem_key.len() as u32).to_le_bytes());
        buf.extend_from_slice(idem_key);
        buf
    }

    /// APPEND_TURN; returns (context_id, turn_id, depth, payload_hash).
    pub fn append_turn(
        &mut self,
        context_id: u64,
        type_id: &str,
        payload: &[u8],
        idem_key: &[u8],
    ) -> (u64, u64, u32, [u8; 32]) {
        let buf = Self::append_payload(context_id, 0, type_id, 1, payload, idem_key);
        let resp = self.send(MsgType::AppendTurn as u16, 0, &buf);
        parse_append_ack(&resp.expect_ok(MsgType::AppendTurn))
    }

    pub fn get_last(&mut self, context_id: u64, limit: u32, include_payload: bool) -> Vec<WireTurn> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&context_id.to_le_bytes());
        buf.extend_from_slice(&limit.to_le_bytes());
        buf.extend_from_slice(&u32::from(include_payload).to_le_bytes());
        let resp = self.send(MsgType::GetLast as u16, 0, &buf);
        parse_turns(&resp.expect_ok(MsgType::GetLast))
    }

    pub fn get_before(
        &mut self,
        context_id: u64,
        before_turn_id: u64,
        limit: u32,
    ) -> Vec<WireTurn> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&context_id.to_le_bytes());
        buf.extend_from_slice(&before_turn_id.to_le_bytes());
        buf.extend_from_slice(&limit.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        let resp = self.send(MsgType::GetBefore as u16, 0, &buf);
        parse_turns(&resp.expect_ok(MsgType::GetBefore))
    }

    /// PUT_BLOB; returns (hash, was_new).
    pub fn put_blob(&mut self, data: &[u8]) -> ([u8; 32], bool) {
        let hash = content_hash(data);
        let mut buf = Vec::new();
        buf.extend_from_slice(&hash);
        buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        buf.extend_from_slice(data);
        let resp = self.send(MsgType::PutBlob as u16, 0, &buf);
        let payload = resp.expect_ok(MsgType::PutBlob);
        let mut out = [0u8; 32];
        out.copy_from_slice(&payload[0..32]);
        (out, payload[32] == 1)
    }

    pub fn get_blob(&mut self, hash: &[u8; 32]) -> Vec<u8> {
        let resp = self.send(MsgType::GetBlob as u16, 0, hash);
        let payload = resp.expect_ok(MsgType::GetBlob);
        let len = u32::from_le_bytes(payload[32..36].try_into().unwrap()) as usize;
        payload[36..36 + len].to_vec()
    }

    pub fn attach_fs(&mut self, turn_id: u64, fs_root_hash: &[u8; 32]) -> (u64, [u8; 32]) {
        let mut buf = Vec::new();
        buf.extend_from_slice(&turn_id.to_le_bytes());
        buf.extend_from_slice(fs_root_hash);
        let resp = self.send(MsgType::AttachFs as u16, 0, &buf);
        let payload = resp.expect_ok(MsgType::AttachFs);
        let echoed = u64::from_le_bytes(payload[0..8].try_into().unwrap());
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&payload[8..40]);
        (echoed, hash)
    }
}

pub fn parse_context_head(payload: &[u8]) -> (u64, u64, u32) {
    (
        u64::from_le_bytes(payload[0..8].try_into().unwrap()),
        u64::from_le_bytes(payload[8..16].try_into().unwrap()),
        u32::from_le_bytes(payload[16..20].try_into().unwrap()),
    )
}

pub fn parse_append_ack(payload: &[u8]) -> (u64, u64, u32, [u8; 32]) {
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&payload[20..52]);
    (
        u64::from_le_bytes(payload[0..8].try_into().unwrap()),
        u64::from_le_bytes(payload[8..16].try_into().unwrap()),
        u32::from_le_bytes(payload[16..20].try_into().unwrap()),
        hash,
    )
}

pub fn parse_turns(payload: &[u8]) -> Vec<WireTurn> {
    let mut offset = 0usize;
    let count = read_u32(payload, &mut offset);
    let mut turns = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let turn_id = read_u64(payload, &mut offset);
        let parent_turn_id = read_u64(payload, &mut offset);
        let depth = read_u32(payload, &mut offset);
        let type_len = read_u32(payload, &mut offset) as usize;
        let type_id = String::from_utf8(payload[offset..offset + type_len].to_vec()).unwrap();
        offset += type_len;
        let type_version = read_u32(payload, &mut offset);
        let encoding = read_u32(payload, &mut offset);
        let compression = read_u32(payload, &mut offset);
        let uncompressed_len = read_u32(payload, &mut offset);
        let mut payload_hash = [0u8; 32];
        payload_hash.copy_from_slice(&payload[offset..offset + 32]);
        offset += 32;
        let payload_len = read_u32(payload, &mut offset) as usize;
        let body = payload[offset..offset + payload_len].to_vec();
        offset += payload_len;
        turns.push(WireTurn {
            turn_id,
            parent_turn_id,
            depth,
            type_id,
            type_version,
            encoding,
            compression,
            uncompressed_len,
            payload_hash,
            payload: body,
        });
    }
    turns
}

fn read_u32(payload: &[u8], offset: &mut usize) -> u32 {
    let v = u32::from_le_bytes(payload[*offset..*offset + 4].try_into().unwrap());
    *offset += 4;
    v
}

fn read_u64(payload: &[u8], offset: &mut usize) -> u64 {
    let v = u64::from_le_bytes(payload[*offset..*offset + 8].try_into().unwrap());
    *offset += 8;
    v
}

/// Minimal HTTP client for gateway tests: one request per connection.
pub fn http_request(addr: SocketAddr, method: &str, path: &str, body: Option<&[u8]>) -> (u16, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).expect("http connect");
    let body = body.unwrap_or(&[]);
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    stream.write_all(request.as_bytes()).expect("http write");
    stream.write_all(body).expect("http write body");

    let mut response = Vec::new();
    stream.read_to_end(&mut response).expect("http read");
    let header_end = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("http header terminator");
    let head = String::from_utf8_lossy(&response[..header_end]).to_string();
    let status: u16 = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .expect("http status");

    let mut body = response[header_end + 4..].to_vec();
    if head.to_ascii_lowercase().contains("transfer-encoding: chunked") {
        body = decode_chunked(&body);
    }
    (status, body)
}

fn decode_chunked(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut rest = body;
    loop {
        let Some(line_end) = rest.windows(2).position(|w| w == b"\r\n") else {
            break;
        };
        let size_line = String::from_utf8_lossy(&rest[..line_end]);
        let size = usize::from_str_radix(size_line.trim(), 16).unwrap_or(0);
        if size == 0 {
            break;
        }
        let start = line_end + 2;
        out.extend_from_slice(&rest[start..start + size]);
        rest = &rest[start + size + 2..];
    }
    out
}
