//! TCP server for the binary protocol.
//!
//! One acceptor thread; each connection gets a reader thread plus a small
//! worker pool fed over a crossbeam channel. Responses are serialized per
//! connection by a writer mutex, so workers may finish out of order while
//! frames stay whole on the wire; clients correlate by req_id.

use std::io::BufReader;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam::channel::{Receiver, Sender};

use crate::error::{Result, StoreError};
use crate::metrics::Metrics;
use crate::proto::frame::{self, FrameHeader, MsgType};
use crate::proto::messages;
use crate::proto::session::{PROTOCOL_VERSION, SessionIds, SessionState};
use crate::registry::Registry;
use crate::store::{AppendParams, Store};

/// Worker threads per connection; the in-flight cap bounds queue growth.
const WORKERS_PER_CONN: usize = 4;

pub struct ServerShared {
    pub store: Arc<Store>,
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
    pub strict_types: bool,
    pub max_inflight_per_conn: usize,
    pub session_ids: SessionIds,
}

pub struct ServerHandle {
    pub local_addr: std::net::SocketAddr,
    accept_thread: thread::JoinHandle<()>,
}

impl ServerHandle {
    /// Block until the acceptor exits (listener closed or fatal error).
    pub fn join(self) {
        let _ = self.accept_thread.join();
    }
}

pub fn start_server(listener: TcpListener, shared: Arc<ServerShared>) -> Result<ServerHandle> {
    let local_addr = listener.local_addr()?;
    let accept_thread = thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let shared = Arc::clone(&shared);
                    thread::spawn(move || {
                        if let Err(err) = handle_conn(stream, shared) {
                            tracing::debug!("connection ended: {err}");
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!("accept failed: {err}");
                }
            }
        }
    });
    Ok(ServerHandle {
        local_addr,
        accept_thread,
    })
}

struct Job {
    header: FrameHeader,
    payload: Vec<u8>,
}

fn handle_conn(stream: TcpStream, shared: Arc<ServerShared>) -> Result<()> {
    let peer = stream.peer_addr().ok();
    stream.set_nodelay(true)?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let writer = Arc::new(Mutex::new(stream));
    let inflight = Arc::new(AtomicUsize::new(0));

    let (job_tx, job_rx): (Sender<Job>, Receiver<Job>) = crossbeam::channel::unbounded();
    let mut workers = Vec::with_capacity(WORKERS_PER_CONN);
    for _ in 0..WORKERS_PER_CONN {
        let job_rx = job_rx.clone();
        let shared = Arc::clone(&shared);
        let writer = Arc::clone(&writer);
        let inflight = Arc::clone(&inflight);
        workers.push(thread::spawn(move || {
            for job in job_rx.iter() {
                run_job(&shared, &writer, job);
                inflight.fetch_sub(1, Ordering::SeqCst);
            }
        }));
    }
    drop(job_rx);

    let mut session = SessionState::Unauthenticated;
    let result = read_loop(
        &mut reader,
        &writer,
        &shared,
        &mut session,
        &job_tx,
        &inflight,
        peer,
    );

    drop(job_tx);
    for worker in workers {
        let _ = worker.join();
    }
    result
}

fn read_loop(
    reader: &mut BufReader<TcpStream>,
    writer: &Arc<Mutex<TcpStream>>,
    shared: &Arc<ServerShared>,
    session: &mut SessionState,
    job_tx: &Sender<Job>,
    inflight: &Arc<AtomicUsize>,
    peer: Option<std::net::SocketAddr>,
) -> Result<()> {
    loop {
        let (header, payload) = match frame::read_frame(reader) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()), // clean close
            Err(err) => {
                // One best-effort ERROR frame, then drop the connection:
                // framing is unrecoverable once out of sync.
                send_error(writer, 0, &err, &shared.metrics);
                return Err(err);
            }
        };

        let Some(msg_type) = MsgType::from_u16(header.msg_type) else {
            let err = StoreError::InvalidInput(format!("unknown message type {}", header.msg_type));
            send_error(writer, header.req_id, &err, &shared.metrics);
            continue;
        };

        if !session.is_ready() {
            if msg_type != MsgType::Hello {
                let err = StoreError::InvalidInput("HELLO required before any other message".into());
                send_error(writer, header.req_id, &err, &shared.metrics);
                return Err(err);
            }
            let hello = match messages::parse_hello(&payload) {
                Ok(hello) => hello,
                Err(err) => {
                    send_error(writer, header.req_id, &err, &shared.metrics);
                    return Err(err);
                }
            };
            let session_id = shared.session_ids.allocate();
            tracing::info!(
                session_id,
                client_tag = %hello.client_tag,
                peer = ?peer,
                "session established"
            );
            *session = SessionState::Ready {
                session_id,
                client_tag: hello.client_tag,
            };
            let resp = messages::encode_hello_resp(session_id, PROTOCOL_VERSION);
            write_response(writer, MsgType::Hello as u16, header.req_id, &resp);
            continue;
        }

        if msg_type == MsgType::Hello {
            // Repeated HELLO is harmless; re-acknowledge the session.
            let session_id = session.session_id().unwrap_or(0);
            let resp = messages::encode_hello_resp(session_id, PROTOCOL_VERSION);
            write_response(writer, MsgType::Hello as u16, header.req_id, &resp);
            continue;
        }

        let current = inflight.load(Ordering::SeqCst);
        if current >= shared.max_inflight_per_conn {
            let err = StoreError::InvalidInput(format!(
                "too many in-flight requests (cap {})",
                shared.max_inflight_per_conn
            ));
            send_error(writer, header.req_id, &err, &shared.metrics);
            continue;
        }
        inflight.fetch_add(1, Ordering::SeqCst);
        if job_tx.send(Job { header, payload }).is_err() {
            return Ok(());
        }
    }
}

fn run_job(shared: &Arc<ServerShared>, writer: &Arc<Mutex<TcpStream>>, job: Job) {
    match handle_request(shared, &job) {
        Ok(resp) => write_response(writer, job.header.msg_type, job.header.req_id, &resp),
        Err(err) => send_error(writer, job.header.req_id, &err, &shared.metrics),
    }
}

/// Dispatch one request. The response frame echoes the request msg_type.
fn handle_request(shared: &Arc<ServerShared>, job: &Job) -> Result<Vec<u8>> {
    let msg_type = MsgType::from_u16(job.header.msg_type)
        .ok_or_else(|| StoreError::InvalidInput("unknown message type".into()))?;
    let store = &shared.store;
    let payload = &job.payload;

    match msg_type {
        MsgType::CtxCreate | MsgType::CtxFork => {
            let base_turn_id = messages::parse_u64(payload)?;
            let head = store.create_context(base_turn_id)?;
            Ok(messages::encode_context_head(&head))
        }
        MsgType::GetHead => {
            let context_id = messages::parse_u64(payload)?;
            let head = store.get_head(context_id)?;
            Ok(messages::encode_context_head(&head))
        }
        MsgType::AppendTurn => {
            let req = messages::parse_append_turn(payload, job.header.flags)?;
            if shared.strict_types
                && shared
                    .registry
                    .get_type_version(&req.declared_type_id, req.declared_type_version)
                    .is_none()
            {
                return Err(StoreError::Precondition(format!(
                    "unknown type {}@{}",
                    req.declared_type_id, req.declared_type_version
                )));
            }
            let outcome = store.append_turn(AppendParams {
                context_id: req.context_id,
                parent_turn_id: req.parent_turn_id,
                declared_type_id: req.declared_type_id,
                declared_type_version: req.declared_type_version,
                encoding: req.encoding,
                compression: req.compression,
                uncompressed_len: req.uncompressed_len,
                content_hash: req.content_hash,
                payload: req.payload_bytes,
                idempotency_key: req.idempotency_key,
                fs_root_hash: req.fs_root_hash,
            })?;
            if outcome.idem_hit {
                shared.metrics.record_append_idem_hit();
            } else {
                shared.metrics.record_append();
            }
            Ok(messages::encode_append_ack(
                outcome.context_id,
                outcome.turn_id,
                outcome.depth,
                &outcome.payload_hash,
            ))
        }
        MsgType::GetLast => {
            let req = messages::parse_get_last(payload)?;
            let items = store.get_last(req.context_id, req.limit, req.include_payload != 0)?;
            shared.metrics.record_read();
            Ok(messages::encode_turn_items(&items))
        }
        MsgType::GetBefore => {
            let req = messages::parse_get_before(payload)?;
            let items = store.get_before(
                req.context_id,
                req.before_turn_id,
                req.limit,
                req.include_payload != 0,
            )?;
            shared.metrics.record_read();
            Ok(messages::encode_turn_items(&items))
        }
        MsgType::GetBlob => {
            let hash = messages::parse_get_blob(payload)?;
            let raw = store.get_blob(&hash)?;
            Ok(messages::encode_get_blob_resp(&hash, &raw))
        }
        MsgType::AttachFs => {
            let (turn_id, fs_root_hash) = messages::parse_attach_fs(payload)?;
            store.attach_fs(turn_id, fs_root_hash)?;
            Ok(messages::encode_attach_fs_resp(turn_id, &fs_root_hash))
        }
        MsgType::PutBlob => {
            let (hash, data) = messages::parse_put_blob(payload)?;
            let (hash, was_new) = store.put_blob(&hash, &data)?;
            shared.metrics.record_blob_insert(was_new);
            Ok(messages::encode_put_blob_resp(&hash, was_new))
        }
        MsgType::Hello | MsgType::Error => {
            Err(StoreError::InvalidInput("unexpected message type".into()))
        }
    }
}

fn write_response(writer: &Arc<Mutex<TcpStream>>, msg_type: u16, req_id: u64, payload: &[u8]) {
    let mut guard = writer.lock().expect("connection writer poisoned");
    if let Err(err) = frame::write_frame(&mut *guard, msg_type, 0, req_id, payload) {
        tracing::debug!("response write failed: {err}");
    }
}

fn send_error(
    writer: &Arc<Mutex<TcpStream>>,
    req_id: u64,
    err: &StoreError,
    metrics: &Metrics,
) {
    metrics.record_error();
    let payload = messages::encode_error(err.code() as u32, &err.to_string());
    write_response(writer, MsgType::Error as u16, req_id, &payload);
}
