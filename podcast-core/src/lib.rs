pub mod api;
pub mod audio;
pub mod catalog;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod feed;
pub mod processing;
pub mod upload;

pub use api::{router, serve, ApiError};
pub use audio::{
    AudioInfo, AudioProber, BitratePolicy, Id3Fields, ProbeError, TargetBitrate, TranscodeDecision,
    TranscodeError, Transcoder,
};
pub use catalog::{Catalog, CatalogError, ConversionStatus, EpisodeMetadata, NewEpisode, ShowFeedConfig};
pub use command::{CommandExecutor, SystemCommandExecutor};
pub use config::{load_publisher_config, PublisherConfig};
pub use context::PublisherContext;
pub use error::{ConfigError, Result};
pub use feed::{FeedDocument, FeedError, FeedSynthesizer};
pub use processing::{
    EpisodeProcessor, ProcessingError, ProcessingJob, ProcessingOutcome, ProcessingQueue, QueueStats,
};
pub use upload::{AssembledUpload, CleanupReport, UploadError, UploadStatus, UploadStore};
