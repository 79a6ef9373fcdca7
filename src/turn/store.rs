//! Turn store: append orchestration, head management, recovery.
//!
//! Lock discipline: the per-context head mutex serializes head load, id
//! allocation, log/meta/side-log writes, and the heads-table append (the
//! commit point). Blob existence is the caller's concern and is checked
//! before any head lock is taken.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crc32c::crc32c;

use crate::error::{Result, StoreError};
use crate::turn::heads::{ContextHead, HeadsFile};
use crate::turn::log::TurnLog;
use crate::turn::meta::{MetaFile, TurnMeta};
use crate::turn::record::{FLAG_HAS_FS, TurnRecord, type_tag};

/// Bounded LRU for head lookups; misses fall back to a heads-table scan.
const HEAD_CACHE_CAP: usize = 1024;

/// Cap on the context-lock table; unlocked entries are evicted past this.
const CTX_LOCK_CAP: usize = 1024;

pub struct AppendTurnArgs<'a> {
    pub context_id: u64,
    pub parent_turn_id: u64,
    pub payload_hash: [u8; 32],
    pub codec: u32,
    pub meta: TurnMeta,
    pub fs_root_hash: Option<[u8; 32]>,
    pub idempotency_key: Option<&'a [u8]>,
    pub now_ms: u64,
}

pub struct TurnStore {
    log: Mutex<TurnLog>,
    meta: Mutex<MetaFile>,
    heads: Mutex<HeadsFile>,
    head_cache: Mutex<LruCache<u64, ContextHead>>,
    ctx_locks: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
    idem: Mutex<SideLog>,
    idem_map: RwLock<HashMap<(u64, Vec<u8>), u64>>,
    fsroots: Mutex<SideLog>,
    fsroot_map: RwLock<HashMap<u64, [u8; 32]>>,
    next_turn_id: AtomicU64,
    next_context_id: AtomicU64,
}

impl TurnStore {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let log = TurnLog::open(dir)?;
        let meta = {
            let live = |id: u64| log.contains(id);
            MetaFile::open(dir, live)?
        };

        let mut heads = HeadsFile::open(dir)?;
        let (loaded_heads, max_context_id) = heads.load_all()?;

        // Demote heads whose turn was truncated: the newest surviving
        // record for the context wins, else the head resets to empty.
        for (context_id, head) in &loaded_heads {
            if head.head_turn_id != 0 && !log.contains(head.head_turn_id) {
                let demoted = heads
                    .find_latest_live(*context_id, |id| id == 0 || log.contains(id))?
                    .unwrap_or(ContextHead {
                        context_id: *context_id,
                        head_turn_id: 0,
                        head_depth: 0,
                        created_at_unix_ms: head.created_at_unix_ms,
                    });
                tracing::warn!(
                    context_id,
                    from = head.head_turn_id,
                    to = demoted.head_turn_id,
                    "demoting head after turn log truncation"
                );
                heads.append(&demoted)?;
            }
        }

        let idem = SideLog::open(&dir.join("idem.log"))?;
        let mut idem_map = HashMap::new();
        idem.replay(|body| {
            if body.len() < 16 {
                return;
            }
            let context_id = u64::from_le_bytes(body[0..8].try_into().unwrap());
            let turn_id = u64::from_le_bytes(body[8..16].try_into().unwrap());
            if log.contains(turn_id) {
                idem_map.insert((context_id, body[16..].to_vec()), turn_id);
            }
        })?;

        let fsroots = SideLog::open(&dir.join("fsroots.log"))?;
        let mut fsroot_map = HashMap::new();
        fsroots.replay(|body| {
            if body.len() != 40 {
                return;
            }
            let turn_id = u64::from_le_bytes(body[0..8].try_into().unwrap());
            if log.contains(turn_id) {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&body[8..40]);
                fsroot_map.insert(turn_id, hash);
            }
        })?;

        let next_turn_id = log.max_turn_id() + 1;
        Ok(Self {
            log: Mutex::new(log),
            meta: Mutex::new(meta),
            heads: Mutex::new(heads),
            head_cache: Mutex::new(LruCache::new(HEAD_CACHE_CAP)),
            ctx_locks: Mutex::new(HashMap::new()),
            idem: Mutex::new(idem),
            idem_map: RwLock::new(idem_map),
            fsroots: Mutex::new(fsroots),
            fsroot_map: RwLock::new(fsroot_map),
            next_turn_id: AtomicU64::new(next_turn_id),
            next_context_id: AtomicU64::new(max_context_id + 1),
        })
    }

    /// Create a context whose head is `base_turn_id` (0 for an empty
    /// context). Fork and create share this path: both are O(1) head
    /// pointer writes.
    pub fn create_context(&self, base_turn_id: u64, now_ms: u64) -> Result<ContextHead> {
        let head_depth = if base_turn_id == 0 {
            0
        } else {
            self.get_turn(base_turn_id)?.depth
        };
        let context_id = self.next_context_id.fetch_add(1, Ordering::SeqCst);
        let head = ContextHead {
            context_id,
            head_turn_id: base_turn_id,
            head_depth,
            created_at_unix_ms: now_ms,
        };
        self.heads.lock().expect("heads poisoned").append(&head)?;
        self.head_cache
            .lock()
            .expect("head cache poisoned")
            .put(context_id, head);
        Ok(head)
    }

    pub fn get_head(&self, context_id: u64) -> Result<ContextHead> {
        if let Some(head) = self
            .head_cache
            .lock()
            .expect("head cache poisoned")
            .get(&context_id)
        {
            return Ok(head);
        }
        let found = self
            .heads
            .lock()
            .expect("heads poisoned")
            .find_latest(context_id)?;
        match found {
            Some(head) => {
                self.head_cache
                    .lock()
                    .expect("head cache poisoned")
                    .put(context_id, head);
                Ok(head)
            }
            None => Err(StoreError::NotFound(format!("context {context_id}"))),
        }
    }

    pub fn get_turn(&self, turn_id: u64) -> Result<TurnRecord> {
        self.log.lock().expect("turn log poisoned").get(turn_id)
    }

    pub fn turn_exists(&self, turn_id: u64) -> bool {
        self.log.lock().expect("turn log poisoned").contains(turn_id)
    }

    pub fn get_meta(&self, turn_id: u64) -> Result<TurnMeta> {
        self.meta
            .lock()
            .expect("turn meta poisoned")
            .get(turn_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("turn {turn_id} metadata")))
    }

    /// Append one turn under the context's head lock. Returns the new
    /// record and whether it was served from the idempotency table.
    pub fn append_turn(&self, args: AppendTurnArgs<'_>) -> Result<(TurnRecord, bool)> {
        let ctx_lock = self.context_lock(args.context_id);
        let _guard = ctx_lock.lock().expect("context lock poisoned");

        if let Some(key) = args.idempotency_key.filter(|k| !k.is_empty()) {
            let lookup = (args.context_id, key.to_vec());
            let hit = self
                .idem_map
                .read()
                .expect("idem map poisoned")
                .get(&lookup)
                .copied();
            if let Some(turn_id) = hit {
                return Ok((self.get_turn(turn_id)?, true));
            }
        }

        // Resolve the effective parent. parent==0 means "current head",
        // creating the context head implicitly when it has never been seen.
        let current_head = match self.get_head(args.context_id) {
            Ok(head) => head,
            Err(StoreError::NotFound(_)) => ContextHead {
                context_id: args.context_id,
                head_turn_id: 0,
                head_depth: 0,
                created_at_unix_ms: args.now_ms,
            },
            Err(e) => return Err(e),
        };
        let (parent_turn_id, depth) = if args.parent_turn_id == 0 {
            if current_head.head_turn_id == 0 {
                (0, 0)
            } else {
                (current_head.head_turn_id, current_head.head_depth + 1)
            }
        } else {
            let parent = self.get_turn(args.parent_turn_id)?;
            (parent.turn_id, parent.depth + 1)
        };

        let turn_id = self.next_turn_id.fetch_add(1, Ordering::SeqCst);
        let mut flags = 0u32;
        if args.fs_root_hash.is_some() {
            flags |= FLAG_HAS_FS;
        }
        let record = TurnRecord {
            turn_id,
            parent_turn_id,
            depth,
            codec: args.codec,
            type_tag: type_tag(&args.meta.declared_type_id),
            payload_hash: args.payload_hash,
            flags,
            created_at_unix_ms: args.now_ms,
        };

        self.log.lock().expect("turn log poisoned").append(&record)?;
        self.meta
            .lock()
            .expect("turn meta poisoned")
            .append(turn_id, &args.meta)?;

        if let Some(hash) = args.fs_root_hash {
            let mut body = Vec::with_capacity(40);
            body.extend_from_slice(&turn_id.to_le_bytes());
            body.extend_from_slice(&hash);
            self.fsroots.lock().expect("fsroots poisoned").append(&body)?;
            self.fsroot_map
                .write()
                .expect("fsroot map poisoned")
                .insert(turn_id, hash);
        }

        if let Some(key) = args.idempotency_key.filter(|k| !k.is_empty()) {
            let mut body = Vec::with_capacity(16 + key.len());
            body.extend_from_slice(&args.context_id.to_le_bytes());
            body.extend_from_slice(&turn_id.to_le_bytes());
            body.extend_from_slice(key);
            self.idem.lock().expect("idem poisoned").append(&body)?;
            self.idem_map
                .write()
                .expect("idem map poisoned")
                .insert((args.context_id, key.to_vec()), turn_id);
        }

        // Commit point: the heads append makes the turn reachable.
        let new_head = ContextHead {
            context_id: args.context_id,
            head_turn_id: turn_id,
            head_depth: depth,
            created_at_unix_ms: args.now_ms,
        };
        self.heads.lock().expect("heads poisoned").append(&new_head)?;
        self.head_cache
            .lock()
            .expect("head cache poisoned")
            .put(args.context_id, new_head);

        Ok((record, false))
    }

    /// Walk parents from `start_turn_id`, returning up to `limit` records
    /// oldest → newest (ending at the start turn).
    pub fn walk_back(&self, start_turn_id: u64, limit: u32) -> Result<Vec<TurnRecord>> {
        let mut out = Vec::new();
        if limit == 0 || start_turn_id == 0 {
            return Ok(out);
        }
        let mut log = self.log.lock().expect("turn log poisoned");
        let mut cursor = start_turn_id;
        while cursor != 0 && out.len() < limit as usize {
            let record = log.get(cursor)?;
            cursor = record.parent_turn_id;
            out.push(record);
        }
        out.reverse();
        Ok(out)
    }

    /// Last `limit` turns of a context, oldest → newest.
    pub fn get_last(&self, context_id: u64, limit: u32) -> Result<Vec<TurnRecord>> {
        let head = self.get_head(context_id)?;
        self.walk_back(head.head_turn_id, limit)
    }

    /// Turns strictly older than `before_turn_id`, oldest → newest.
    pub fn get_before(
        &self,
        context_id: u64,
        before_turn_id: u64,
        limit: u32,
    ) -> Result<Vec<TurnRecord>> {
        // The cursor must name a real turn; context is validated so the
        // error surface matches GET_LAST.
        self.get_head(context_id)?;
        let cursor = self.get_turn(before_turn_id)?;
        self.walk_back(cursor.parent_turn_id, limit)
    }

    pub fn attach_fs(&self, turn_id: u64, fs_root_hash: [u8; 32]) -> Result<()> {
        if !self.turn_exists(turn_id) {
            return Err(StoreError::NotFound(format!("turn {turn_id}")));
        }
        let mut body = Vec::with_capacity(40);
        body.extend_from_slice(&turn_id.to_le_bytes());
        body.extend_from_slice(&fs_root_hash);
        self.fsroots.lock().expect("fsroots poisoned").append(&body)?;
        self.fsroot_map
            .write()
            .expect("fsroot map poisoned")
            .insert(turn_id, fs_root_hash);
        Ok(())
    }

    pub fn get_fs_root(&self, turn_id: u64) -> Option<[u8; 32]> {
        self.fsroot_map
            .read()
            .expect("fsroot map poisoned")
            .get(&turn_id)
            .copied()
    }

    pub fn recent_contexts(&self, limit: usize) -> Result<Vec<ContextHead>> {
        self.heads
            .lock()
            .expect("heads poisoned")
            .recent_contexts(limit)
    }

    pub fn turn_count(&self) -> usize {
        self.log.lock().expect("turn log poisoned").count()
    }

    fn context_lock(&self, context_id: u64) -> Arc<Mutex<()>> {
        let mut locks = self.ctx_locks.lock().expect("ctx locks poisoned");
        if locks.len() > CTX_LOCK_CAP {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks
            .entry(context_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Minimal LRU keyed by access order.
struct LruCache<K, V> {
    cap: usize,
    tick: u64,
    entries: HashMap<K, (V, u64)>,
}

impl<K: std::hash::Hash + Eq + Clone, V: Copy> LruCache<K, V> {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            tick: 0,
            entries: HashMap::new(),
        }
    }

    fn get(&mut self, key: &K) -> Option<V> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(key).map(|(value, stamp)| {
            *stamp = tick;
            *value
        })
    }

    fn put(&mut self, key: K, value: V) {
        self.tick += 1;
        self.entries.insert(key, (value, self.tick));
        if self.entries.len() > self.cap {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, (_, stamp))| *stamp)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&oldest);
            }
        }
    }
}

/// Length-framed append-only side log: body_len u32 | body | crc32 u32.
struct SideLog {
    file: File,
}

impl SideLog {
    fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        let valid = Self::valid_prefix(&mut file)?;
        let disk_len = file.metadata()?.len();
        if valid < disk_len {
            tracing::warn!(
                log = %path.display(),
                dropped = disk_len - valid,
                "truncating torn tail from side log"
            );
            file.set_len(valid)?;
            file.sync_all()?;
        }
        Ok(Self { file })
    }

    fn append(&mut self, body: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(body.len() + 8);
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(body);
        frame.extend_from_slice(&crc32c(body).to_le_bytes());
        self.file.write_all(&frame)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn replay(&self, mut visit: impl FnMut(&[u8])) -> Result<()> {
        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&mut file);
        loop {
            match Self::read_record(&mut reader)? {
                Some(body) => visit(&body),
                None => break,
            }
        }
        Ok(())
    }

    fn valid_prefix(file: &mut File) -> Result<u64> {
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(file);
        let mut offset = 0u64;
        while let Some(body) = Self::read_record(&mut reader)? {
            offset += 4 + body.len() as u64 + 4;
        }
        Ok(offset)
    }

    fn read_record(reader: &mut impl Read) -> Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        if !read_full(reader, &mut len_buf)? {
            return Ok(None);
        }
        let body_len = u32::from_le_bytes(len_buf);
        if body_len == 0 || body_len > 1024 * 1024 {
            return Ok(None);
        }
        let mut body = vec![0u8; body_len as usize];
        if !read_full(reader, &mut body)? {
            return Ok(None);
        }
        let mut crc_buf = [0u8; 4];
        if !read_full(reader, &mut crc_buf)? {
            return Ok(None);
        }
        if crc32c(&body) != u32::from_le_bytes(crc_buf) {
            return Ok(None);
        }
        Ok(Some(body))
    }
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
