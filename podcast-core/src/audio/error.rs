use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors produced while inspecting an audio file with ffprobe.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("audio file not found: {path}")]
    MissingFile { path: PathBuf },
    #[error("probe tool not found: {tool}")]
    ToolMissing { tool: PathBuf },
    #[error("ffprobe exited with status {status:?}: {stderr}")]
    Failed { status: Option<i32>, stderr: String },
    #[error("ffprobe timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid ffprobe payload: {0}")]
    Parse(String),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

impl From<serde_json::Error> for ProbeError {
    fn from(source: serde_json::Error) -> Self {
        ProbeError::Parse(source.to_string())
    }
}

pub type ProbeResult<T> = Result<T, ProbeError>;

/// Errors produced while encoding or re-tagging with ffmpeg.
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("source audio not found: {path}")]
    MissingSource { path: PathBuf },
    #[error("encoder not found: {tool}")]
    ToolMissing { tool: PathBuf },
    #[error("ffmpeg exited with status {status:?}: {stderr}")]
    Failed { status: Option<i32>, stderr: String },
    #[error("ffmpeg timed out after {limit:?}")]
    Timeout { limit: Duration },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type TranscodeResult<T> = Result<T, TranscodeError>;
