use std::sync::Arc;
use std::time::Duration;

use crate::audio::{AudioProber, BitratePolicy, Transcoder};
use crate::catalog::Catalog;
use crate::command::CommandExecutor;
use crate::config::PublisherConfig;
use crate::feed::FeedSynthesizer;
use crate::processing::{EpisodeProcessor, ProcessingQueue};
use crate::upload::UploadStore;

/// Every long-lived component of the publisher, built once per process.
#[derive(Debug)]
pub struct PublisherContext {
    pub config: PublisherConfig,
    pub catalog: Arc<Catalog>,
    pub uploads: Arc<UploadStore>,
    pub prober: AudioProber,
    pub transcoder: Transcoder,
    pub policy: BitratePolicy,
    pub processor: Arc<EpisodeProcessor>,
    pub queue: ProcessingQueue,
    pub feed: FeedSynthesizer,
}

impl PublisherContext {
    /// Wires the components together and starts the processing workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_config(config: PublisherConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        let catalog = Arc::new(Catalog::new(config.paths.shows_dir()));
        let uploads = Arc::new(UploadStore::new(
            config.paths.uploads_dir(),
            config.paths.assembled_dir(),
        ));
        let prober = AudioProber::new(
            Arc::clone(&executor),
            config.audio.ffprobe.clone(),
            config.audio.probe_timeout(),
        );
        let transcoder = Transcoder::new(
            executor,
            config.audio.ffmpeg.clone(),
            config.audio.transcode_timeout(),
        );
        let policy = BitratePolicy::from_config(&config.audio);
        let processor = Arc::new(EpisodeProcessor::new(
            Arc::clone(&catalog),
            prober.clone(),
            transcoder.clone(),
            policy,
        ));
        let queue = ProcessingQueue::start(
            Arc::clone(&processor),
            config.workers.max_concurrent_jobs,
            config.workers.queue_capacity,
        );
        let feed = FeedSynthesizer::new(Arc::clone(&catalog));

        Self {
            config,
            catalog,
            uploads,
            prober,
            transcoder,
            policy,
            processor,
            queue,
            feed,
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.config.upload.session_ttl_seconds)
    }

    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}
