use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("show {0} not found")]
    ShowNotFound(String),
    #[error("episode {show_id}/{episode_id} not found")]
    EpisodeNotFound {
        show_id: String,
        episode_id: String,
    },
    #[error("episode {show_id}/{episode_id} is busy processing audio")]
    EpisodeBusy {
        show_id: String,
        episode_id: String,
    },
    #[error("invalid identifier {0:?}")]
    InvalidId(String),
    #[error("malformed record {path}: {source}")]
    Malformed {
        source: serde_json::Error,
        path: PathBuf,
    },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to encode record: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("background write task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type CatalogResult<T> = Result<T, CatalogError>;
