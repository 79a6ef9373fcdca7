//! Content-addressed blob store.
//!
//! Blobs are keyed by BLAKE3-256 of their uncompressed bytes, stored in an
//! append-only packfile with a fixed-size sidecar index. The pack is the
//! source of truth; the index is rebuilt from it whenever they disagree.

pub mod codec;
pub mod index;
pub mod pack;
pub mod store;

pub use codec::{CODEC_NONE, CODEC_ZSTD, content_hash};
pub use index::IndexEntry;
pub use pack::{PackFile, PackRecordHeader};
pub use store::BlobStore;

/// 32-byte BLAKE3-256 digest of uncompressed blob bytes.
pub type BlobHash = [u8; 32];
