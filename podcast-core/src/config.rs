use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use crate::audio::BITRATE_LADDER;
use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PublisherConfig {
    pub paths: PathsSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub upload: UploadSection,
    #[serde(default)]
    pub audio: AudioSection,
    #[serde(default)]
    pub workers: WorkersSection,
}

impl PublisherConfig {
    /// Builds a configuration rooted at `base_dir` with defaults everywhere else.
    pub fn with_base_dir<P: AsRef<Path>>(base_dir: P) -> Self {
        let base = base_dir.as_ref();
        Self {
            paths: PathsSection {
                shows_dir: base.join("shows").to_string_lossy().to_string(),
                uploads_dir: base.join("uploads").to_string_lossy().to_string(),
                assembled_dir: base.join("uploads_assembled").to_string_lossy().to_string(),
            },
            server: ServerSection::default(),
            upload: UploadSection::default(),
            audio: AudioSection::default(),
            workers: WorkersSection::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.upload.session_ttl_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "upload.session_ttl_seconds",
                reason: "must be greater than zero".into(),
            });
        }
        if self.workers.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid {
                field: "workers.max_concurrent_jobs",
                reason: "must be greater than zero".into(),
            });
        }
        if self.workers.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "workers.queue_capacity",
                reason: "must be greater than zero".into(),
            });
        }
        for (field, kbps) in [
            ("audio.min_bitrate_kbps", self.audio.min_bitrate_kbps),
            ("audio.default_bitrate_kbps", self.audio.default_bitrate_kbps),
        ] {
            if !BITRATE_LADDER.contains(&kbps) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{kbps} kbps is not one of {BITRATE_LADDER:?}"),
                });
            }
        }
        self.server.bind_addr()?;
        self.server.public_base_url()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub shows_dir: String,
    pub uploads_dir: String,
    pub assembled_dir: String,
}

impl PathsSection {
    pub fn shows_dir(&self) -> PathBuf {
        PathBuf::from(&self.shows_dir)
    }

    pub fn uploads_dir(&self) -> PathBuf {
        PathBuf::from(&self.uploads_dir)
    }

    pub fn assembled_dir(&self) -> PathBuf {
        PathBuf::from(&self.assembled_dir)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub public_base_url: Option<String>,
    #[serde(default = "default_feed_cache_control")]
    pub feed_cache_control: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            public_base_url: None,
            feed_cache_control: default_feed_cache_control(),
        }
    }
}

impl ServerSection {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind.parse().map_err(|err| ConfigError::Invalid {
            field: "server.bind",
            reason: format!("{err}"),
        })
    }

    pub fn public_base_url(&self) -> Result<Option<Url>> {
        match self.public_base_url.as_deref() {
            None | Some("") => Ok(None),
            Some(raw) => Url::parse(raw)
                .map(Some)
                .map_err(|err| ConfigError::Invalid {
                    field: "server.public_base_url",
                    reason: err.to_string(),
                }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadSection {
    #[serde(default = "default_session_ttl")]
    pub session_ttl_seconds: u64,
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: usize,
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            session_ttl_seconds: default_session_ttl(),
            max_chunk_bytes: default_max_chunk_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioSection {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: PathBuf,
    #[serde(default = "default_ffprobe")]
    pub ffprobe: PathBuf,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,
    #[serde(default = "default_transcode_timeout")]
    pub transcode_timeout_seconds: u64,
    #[serde(default = "default_min_bitrate")]
    pub min_bitrate_kbps: u32,
    #[serde(default = "default_bitrate")]
    pub default_bitrate_kbps: u32,
}

impl AudioSection {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }

    pub fn transcode_timeout(&self) -> Duration {
        Duration::from_secs(self.transcode_timeout_seconds)
    }
}

impl Default for AudioSection {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            probe_timeout_seconds: default_probe_timeout(),
            transcode_timeout_seconds: default_transcode_timeout(),
            min_bitrate_kbps: default_min_bitrate(),
            default_bitrate_kbps: default_bitrate(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkersSection {
    #[serde(default = "default_max_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_jobs(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:5050".to_string()
}

fn default_feed_cache_control() -> String {
    "public, max-age=300".to_string()
}

fn default_session_ttl() -> u64 {
    24 * 60 * 60
}

fn default_max_chunk_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_probe_timeout() -> u64 {
    60
}

fn default_transcode_timeout() -> u64 {
    300
}

fn default_min_bitrate() -> u32 {
    160
}

fn default_bitrate() -> u32 {
    192
}

fn default_max_jobs() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    32
}

pub fn load_publisher_config<P: AsRef<Path>>(path: P) -> Result<PublisherConfig> {
    let config: PublisherConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/publisher.toml");
        let config = load_publisher_config(path).expect("config should parse");
        assert_eq!(config.paths.shows_dir, "data/shows");
        assert_eq!(config.audio.min_bitrate_kbps, 160);
        assert_eq!(config.workers.max_concurrent_jobs, 2);
        assert_eq!(config.server.bind_addr().unwrap().port(), 5050);
    }

    #[test]
    fn sections_fall_back_to_defaults() {
        let config: PublisherConfig = toml::from_str(
            r#"
            [paths]
            shows_dir = "/srv/shows"
            uploads_dir = "/srv/uploads"
            assembled_dir = "/srv/assembled"
            "#,
        )
        .unwrap();
        assert_eq!(config.upload.session_ttl_seconds, 86_400);
        assert_eq!(config.audio.transcode_timeout(), Duration::from_secs(300));
        assert_eq!(config.audio.ffprobe, PathBuf::from("ffprobe"));
        assert!(config.server.public_base_url().unwrap().is_none());
        config.validate().unwrap();
    }

    #[test]
    fn rejects_bitrates_off_the_ladder() {
        let mut config = PublisherConfig::with_base_dir("/tmp/podcast");
        config.audio.min_bitrate_kbps = 400;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "audio.min_bitrate_kbps",
                ..
            })
        ));

        let mut config = PublisherConfig::with_base_dir("/tmp/podcast");
        config.audio.default_bitrate_kbps = 150;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "audio.default_bitrate_kbps",
                ..
            })
        ));

        let mut config = PublisherConfig::with_base_dir("/tmp/podcast");
        config.audio.min_bitrate_kbps = 128;
        config.validate().unwrap();
    }

    #[test]
    fn rejects_zero_workers() {
        let mut config = PublisherConfig::with_base_dir("/tmp/podcast");
        config.workers.max_concurrent_jobs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "workers.max_concurrent_jobs",
                ..
            })
        ));
    }
}
