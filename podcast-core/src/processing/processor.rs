use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Datelike, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use super::error::{ProcessingError, ProcessingResult};
use crate::audio::{has_tags, AudioInfo, AudioProber, BitratePolicy, Id3Fields, Transcoder};
use crate::catalog::{Catalog, ConversionStatus, EpisodeMetadata, ShowFeedConfig};

/// One request to normalize an episode's audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingJob {
    pub show_id: String,
    pub episode_id: String,
    /// Audio to process; located from the episode record when absent.
    pub source: Option<PathBuf>,
}

impl ProcessingJob {
    pub fn new(show_id: impl Into<String>, episode_id: impl Into<String>) -> Self {
        Self {
            show_id: show_id.into(),
            episode_id: episode_id.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProcessingOutcome {
    pub show_id: String,
    pub episode_id: String,
    pub status: ConversionStatus,
    pub audio: Option<PathBuf>,
    pub transcoded: bool,
    pub retagged: bool,
    pub reason: Option<String>,
    pub error: Option<String>,
}

struct StageReport {
    audio: PathBuf,
    info: AudioInfo,
    transcoded: bool,
    retagged: bool,
    reason: String,
}

/// Drives one episode from `processing` to `success` or `failed`.
#[derive(Debug)]
pub struct EpisodeProcessor {
    catalog: Arc<Catalog>,
    prober: AudioProber,
    transcoder: Transcoder,
    policy: BitratePolicy,
}

impl EpisodeProcessor {
    pub fn new(
        catalog: Arc<Catalog>,
        prober: AudioProber,
        transcoder: Transcoder,
        policy: BitratePolicy,
    ) -> Self {
        Self {
            catalog,
            prober,
            transcoder,
            policy,
        }
    }

    /// Runs every stage while holding the episode's audio claim and persists
    /// the result.
    ///
    /// The record lock is taken only to read the record and, once the tools
    /// are done, to merge the result into a fresh copy. Stage failures are
    /// recorded on the episode and reported through the outcome. An error is
    /// returned only when the record cannot be loaded or saved.
    pub async fn process(&self, job: &ProcessingJob) -> ProcessingResult<ProcessingOutcome> {
        let _claim = self
            .catalog
            .claim_audio(&job.show_id, &job.episode_id)
            .await;
        let snapshot = {
            let _guard = self
                .catalog
                .lock_episode(&job.show_id, &job.episode_id)
                .await;
            self.catalog
                .load_episode(&job.show_id, &job.episode_id)
                .await?
        };
        info!(show = %job.show_id, episode = %job.episode_id, "processing episode audio");

        let show = match self.catalog.load_show(&job.show_id).await {
            Ok(show) => show,
            Err(err) => {
                warn!(show = %job.show_id, error = %err, "show config unavailable, tagging with defaults");
                ShowFeedConfig::default()
            }
        };

        let result = self.run_stages(job, &show, &snapshot).await;

        let _guard = self
            .catalog
            .lock_episode(&job.show_id, &job.episode_id)
            .await;
        let mut metadata = self
            .catalog
            .load_episode(&job.show_id, &job.episode_id)
            .await?;
        let outcome = match result {
            Ok(report) => {
                info!(
                    show = %job.show_id,
                    episode = %job.episode_id,
                    transcoded = report.transcoded,
                    retagged = report.retagged,
                    "episode audio ready"
                );
                if report.transcoded {
                    if let Some(name) = file_name(&report.audio) {
                        metadata.set_audio_reference(&job.show_id, &job.episode_id, &name);
                    }
                }
                metadata.apply_audio_info(&report.info);
                ProcessingOutcome {
                    show_id: job.show_id.clone(),
                    episode_id: job.episode_id.clone(),
                    status: ConversionStatus::Success,
                    audio: Some(report.audio),
                    transcoded: report.transcoded,
                    retagged: report.retagged,
                    reason: Some(report.reason),
                    error: None,
                }
            }
            Err(err) => {
                error!(show = %job.show_id, episode = %job.episode_id, error = %err, "episode processing failed");
                metadata.mark_failed(err.to_string());
                ProcessingOutcome {
                    show_id: job.show_id.clone(),
                    episode_id: job.episode_id.clone(),
                    status: ConversionStatus::Failed,
                    audio: None,
                    transcoded: false,
                    retagged: false,
                    reason: None,
                    error: Some(err.to_string()),
                }
            }
        };

        self.catalog
            .save_episode(&job.show_id, &job.episode_id, &metadata)
            .await?;
        Ok(outcome)
    }

    async fn run_stages(
        &self,
        job: &ProcessingJob,
        show: &ShowFeedConfig,
        metadata: &EpisodeMetadata,
    ) -> ProcessingResult<StageReport> {
        let source = match &job.source {
            Some(source) => source.clone(),
            None => self
                .catalog
                .locate_audio(&job.show_id, &job.episode_id, metadata)
                .await?
                .ok_or_else(|| ProcessingError::MissingAudio {
                    show_id: job.show_id.clone(),
                    episode_id: job.episode_id.clone(),
                })?,
        };

        let decision = self.policy.needs_transcoding(&self.prober, &source).await;
        info!(
            episode = %job.episode_id,
            required = decision.required,
            reason = %decision.reason,
            "transcode check"
        );
        let fields = id3_fields(show, metadata, &job.show_id, &job.episode_id);
        let cover = self
            .catalog
            .find_episode_cover(&job.show_id, &job.episode_id, metadata)
            .await?;

        let (audio, transcoded, retagged) = if !decision.required {
            let retagged = if !has_tags(&source).await {
                self.transcoder
                    .retag_in_place(&source, &fields, cover.as_deref())
                    .await?;
                true
            } else {
                false
            };
            (source, false, retagged)
        } else {
            let source_kbps = match decision.info.as_ref() {
                Some(info) => info.bitrate_kbps(),
                None => self
                    .prober
                    .probe(&source)
                    .await
                    .ok()
                    .and_then(|info| info.bitrate_kbps()),
            };
            let target = self.policy.select(source_kbps);
            info!(episode = %job.episode_id, source_kbps = ?source_kbps, target = %target, "selected bitrate");
            let output = self
                .transcoder
                .transcode(&source, target, &fields, cover.as_deref())
                .await?;
            (output, true, false)
        };

        let info = self.prober.probe(&audio).await?;
        Ok(StageReport {
            audio,
            info,
            transcoded,
            retagged,
            reason: decision.reason,
        })
    }
}

fn id3_fields(
    show: &ShowFeedConfig,
    metadata: &EpisodeMetadata,
    show_id: &str,
    episode_id: &str,
) -> Id3Fields {
    let show_title = show.title_or(show_id).to_string();
    let artist = show
        .author
        .clone()
        .filter(|author| !author.trim().is_empty())
        .unwrap_or_else(|| show_title.clone());
    Id3Fields {
        title: Some(
            metadata
                .title
                .clone()
                .filter(|title| !title.trim().is_empty())
                .unwrap_or_else(|| episode_id.to_string()),
        ),
        artist: Some(artist),
        album: Some(show_title),
        date: Some(Utc::now().year().to_string()),
        copyright: show.copyright.clone(),
        explicit: metadata.is_explicit(),
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|name| name.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id3_fields_fall_back_to_show_title() {
        let show = ShowFeedConfig {
            title: Some("Morning Show".into()),
            copyright: Some("© 2025 Morning".into()),
            ..ShowFeedConfig::default()
        };
        let metadata = EpisodeMetadata {
            explicit: Some("yes".into()),
            ..EpisodeMetadata::default()
        };
        let fields = id3_fields(&show, &metadata, "morning", "ep1");
        assert_eq!(fields.title.as_deref(), Some("ep1"));
        assert_eq!(fields.artist.as_deref(), Some("Morning Show"));
        assert_eq!(fields.album.as_deref(), Some("Morning Show"));
        assert_eq!(fields.copyright.as_deref(), Some("© 2025 Morning"));
        assert!(fields.explicit);
        assert_eq!(fields.date, Some(Utc::now().year().to_string()));
    }

    #[test]
    fn id3_fields_prefer_author() {
        let show = ShowFeedConfig {
            author: Some("Jo Host".into()),
            ..ShowFeedConfig::default()
        };
        let metadata = EpisodeMetadata {
            title: Some("Pilot".into()),
            ..EpisodeMetadata::default()
        };
        let fields = id3_fields(&show, &metadata, "morning", "ep1");
        assert_eq!(fields.artist.as_deref(), Some("Jo Host"));
        assert_eq!(fields.album.as_deref(), Some("morning"));
        assert_eq!(fields.title.as_deref(), Some("Pilot"));
        assert!(!fields.explicit);
    }
}
