#![forbid(unsafe_code)]

pub mod blob;
pub mod config;
pub mod error;
pub mod fs_tree;
pub mod http;
pub mod metrics;
pub mod projection;
pub mod proto;
pub mod registry;
pub mod store;
pub mod telemetry;
pub mod turn;

pub use error::StoreError;
pub type Result<T> = std::result::Result<T, StoreError>;

// Re-export the types handlers and tests reach for most often.
pub use blob::BlobStore;
pub use store::{AppendOutcome, AppendParams, Store, TurnItem};
pub use turn::{ContextHead, TurnMeta, TurnRecord, TurnStore};
