use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload session {upload_id} not found")]
    NotFound { upload_id: String },
    #[error("upload {upload_id} incomplete: {received}/{total} chunks received")]
    Incomplete {
        upload_id: String,
        received: usize,
        total: u32,
    },
    #[error("upload {upload_id} is missing chunk {index}")]
    MissingChunk { upload_id: String, index: u32 },
    #[error("chunk index {index} outside 0..{total}")]
    InvalidChunkIndex { index: u32, total: u32 },
    #[error("invalid upload id {0:?}")]
    InvalidUploadId(String),
    #[error("upload {upload_id} declared {declared} chunks but the session expects {expected}")]
    TotalMismatch {
        upload_id: String,
        expected: u32,
        declared: u32,
    },
    #[error("upload {upload_id} metadata is corrupted: {reason}")]
    Corrupted { upload_id: String, reason: String },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to encode session metadata: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;
