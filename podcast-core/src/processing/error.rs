use thiserror::Error;

use crate::audio::{ProbeError, TranscodeError};
use crate::catalog::CatalogError;

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("audio analysis failed: {0}")]
    Probe(#[from] ProbeError),
    #[error("transcoding failed: {0}")]
    Transcode(#[from] TranscodeError),
    #[error("episode {show_id}/{episode_id} has no audio file")]
    MissingAudio {
        show_id: String,
        episode_id: String,
    },
    #[error("processing queue is full ({capacity} jobs waiting)")]
    QueueFull { capacity: usize },
    #[error("processing queue is shut down")]
    QueueClosed,
}

pub type ProcessingResult<T> = Result<T, ProcessingError>;
