//! Process-level counters exposed at `/v1/metrics`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Value as JsonValue, json};

#[derive(Debug, Default)]
pub struct Metrics {
    appends: AtomicU64,
    append_idem_hits: AtomicU64,
    blob_inserts: AtomicU64,
    blob_dedup_hits: AtomicU64,
    reads: AtomicU64,
    registry_ingests: AtomicU64,
    http_requests: AtomicU64,
    errors: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_append(&self) {
        self.appends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_append_idem_hit(&self) {
        self.append_idem_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blob_insert(&self, was_new: bool) {
        if was_new {
            self.blob_inserts.fetch_add(1, Ordering::Relaxed);
        } else {
            self.blob_dedup_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_registry_ingest(&self) {
        self.registry_ingests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_http(&self) {
        self.http_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> JsonValue {
        json!({
            "appends": self.appends.load(Ordering::Relaxed),
            "append_idem_hits": self.append_idem_hits.load(Ordering::Relaxed),
            "blob_inserts": self.blob_inserts.load(Ordering::Relaxed),
            "blob_dedup_hits": self.blob_dedup_hits.load(Ordering::Relaxed),
            "reads": self.reads.load(Ordering::Relaxed),
            "registry_ingests": self.registry_ingests.load(Ordering::Relaxed),
            "http_requests": self.http_requests.load(Ordering::Relaxed),
            "errors": self.errors.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counts() {
        let m = Metrics::new();
        m.record_append();
        m.record_append();
        m.record_blob_insert(true);
        m.record_blob_insert(false);
        let snap = m.snapshot();
        assert_eq!(snap["appends"], 2);
        assert_eq!(snap["blob_inserts"], 1);
        assert_eq!(snap["blob_dedup_hits"], 1);
    }
}
