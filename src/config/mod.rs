//! Runtime configuration.
//!
//! The config surface is env-first: every knob has a `CXDB_*` variable and
//! a default that works for local development. Flags on the binary override
//! the environment.

use std::path::PathBuf;

/// Default cap on a single turn payload as carried on the wire.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Default cap on concurrently processing requests per connection.
pub const DEFAULT_MAX_INFLIGHT_PER_CONN: usize = 64;

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub bind_addr: String,
    pub http_bind_addr: String,
    /// Largest accepted turn payload (uncompressed), in bytes.
    pub max_payload_bytes: usize,
    /// Per-connection concurrent request cap.
    pub max_inflight_per_conn: usize,
    /// Strict registry mode: APPEND_TURN must name a known (type, version).
    pub strict_types: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            bind_addr: "127.0.0.1:9009".to_string(),
            http_bind_addr: "127.0.0.1:9010".to_string(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            max_inflight_per_conn: DEFAULT_MAX_INFLIGHT_PER_CONN,
            strict_types: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary lookup. Split out from `from_env`
    /// so tests never mutate process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Config::default();
        if let Some(dir) = lookup("CXDB_DATA_DIR").filter(|v| !v.trim().is_empty()) {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Some(addr) = lookup("CXDB_BIND") {
            cfg.bind_addr = addr;
        }
        if let Some(addr) = lookup("CXDB_HTTP_BIND") {
            cfg.http_bind_addr = addr;
        }
        if let Some(n) = lookup("CXDB_MAX_PAYLOAD_BYTES").and_then(|v| v.parse().ok()) {
            cfg.max_payload_bytes = n;
        }
        if let Some(n) = lookup("CXDB_MAX_INFLIGHT").and_then(|v| v.parse().ok()) {
            cfg.max_inflight_per_conn = n;
        }
        if let Some(v) = lookup("CXDB_STRICT_TYPES") {
            cfg.strict_types = matches!(v.trim(), "1" | "true" | "yes");
        }
        cfg
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }

    pub fn turns_dir(&self) -> PathBuf {
        self.data_dir.join("turns")
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.data_dir.join("registry")
    }
}
