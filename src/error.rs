//! Error taxonomy shared by the binary and HTTP surfaces.
//!
//! Every variant maps to a stable numeric code carried on the wire as the
//! ERROR frame code and as the HTTP status. Codes are part of the protocol
//! contract and never change meaning between releases.

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unknown context, turn, blob, bundle, or fs path.
    #[error("not found: {0}")]
    NotFound(String),

    /// Illegal registry evolution: version regression or tag reuse.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Strict-mode rejection: unknown declared type, or a turn referencing
    /// a blob that is not durable in the CAS.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Malformed request: bad frame, oversized payload, missing required
    /// parameter, invalid JSON.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Projection requested but no descriptor is available.
    #[error("missing dependency: {0}")]
    MissingDependency(String),

    /// Data that was accepted once but cannot be decoded now: BLAKE3 or
    /// CRC mismatch, zstd failure, malformed msgpack.
    #[error("decode error: {0}")]
    Decode(String),

    /// On-disk state that fails structural validation during recovery.
    #[error("corrupt data: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Stable code for this error, shared across surfaces.
    pub fn code(&self) -> u16 {
        match self {
            StoreError::NotFound(_) => 404,
            StoreError::Conflict(_) => 409,
            StoreError::Precondition(_) => 412,
            StoreError::InvalidInput(_) => 422,
            StoreError::MissingDependency(_) => 424,
            StoreError::Decode(_)
            | StoreError::Corrupt(_)
            | StoreError::Io(_)
            | StoreError::Json(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
