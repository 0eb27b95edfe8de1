#![allow(dead_code)]

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::process::Command;

use podcast_core::catalog::{Catalog, EpisodeMetadata, NewEpisode, ShowFeedConfig};
use podcast_core::command::CommandExecutor;
use podcast_core::config::PublisherConfig;
use podcast_core::context::PublisherContext;

/// Stands in for ffprobe and ffmpeg.
///
/// Fixture audio is plain text: `MP3:<kbps>` is an MP3 at that bitrate,
/// an `ID3` prefix marks it as tagged and any file ending in `.wav` is PCM.
/// Anything else makes ffprobe exit with status 1, and ffmpeg refuses
/// inputs starting with `garbage`.
#[derive(Debug, Default)]
pub struct FakeTools {
    calls: Mutex<Vec<Vec<String>>>,
}

impl FakeTools {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn ffmpeg_calls(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|call| call[0].ends_with("ffmpeg"))
            .collect()
    }
}

#[async_trait::async_trait]
impl CommandExecutor for FakeTools {
    async fn run(&self, command: &mut Command) -> io::Result<Output> {
        let std = command.as_std();
        let mut call = vec![std.get_program().to_string_lossy().to_string()];
        call.extend(std.get_args().map(|arg| arg.to_string_lossy().to_string()));
        self.calls.lock().unwrap().push(call.clone());

        let last = PathBuf::from(call.last().cloned().unwrap_or_default());
        if call[0].ends_with("ffprobe") {
            return Ok(probe(&last));
        }

        let input = input_path(&call);
        let original = std::fs::read(&input)?;
        if original.starts_with(b"garbage") {
            return Ok(exit(1, Vec::new(), b"Invalid data found when processing input".to_vec()));
        }
        let body = if call.windows(2).any(|pair| pair[0] == "-c:a" && pair[1] == "copy") {
            let mut retagged = b"ID3".to_vec();
            retagged.extend_from_slice(&original);
            retagged
        } else {
            let target = call
                .windows(2)
                .find(|pair| pair[0] == "-b:a")
                .map(|pair| pair[1].trim_end_matches('k').to_string())
                .unwrap_or_default();
            format!("ID3MP3:{target}").into_bytes()
        };
        std::fs::write(&last, body)?;
        Ok(exit(0, Vec::new(), Vec::new()))
    }
}

/// Delays every ffmpeg run before handing it to [`FakeTools`].
#[derive(Debug)]
pub struct SlowFfmpeg {
    inner: Arc<FakeTools>,
    delay: Duration,
}

#[async_trait::async_trait]
impl CommandExecutor for SlowFfmpeg {
    async fn run(&self, command: &mut Command) -> io::Result<Output> {
        if command.as_std().get_program().to_string_lossy().ends_with("ffmpeg") {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.run(command).await
    }
}

fn input_path(call: &[String]) -> PathBuf {
    call.windows(2)
        .find(|pair| pair[0] == "-i")
        .map(|pair| PathBuf::from(&pair[1]))
        .unwrap_or_default()
}

fn probe(path: &Path) -> Output {
    let Ok(bytes) = std::fs::read(path) else {
        return exit(1, Vec::new(), b"No such file".to_vec());
    };
    let text = String::from_utf8_lossy(&bytes);
    let body = text.strip_prefix("ID3").unwrap_or(&text);
    let size = bytes.len().to_string();
    let (format, bit_rate) = if let Some(kbps) = body.strip_prefix("MP3:") {
        let kbps: u64 = kbps.trim().parse().unwrap_or(0);
        ("mp3", kbps * 1000)
    } else if path.extension().and_then(|e| e.to_str()) == Some("wav") {
        ("wav", 1_411_200)
    } else {
        return exit(1, Vec::new(), b"Invalid data found when processing input".to_vec());
    };
    let document = json!({
        "streams": [{
            "codec_type": "audio",
            "bit_rate": bit_rate.to_string(),
            "sample_rate": "44100",
            "channels": 2
        }],
        "format": {
            "format_name": format,
            "duration": "125.5",
            "size": size,
            "bit_rate": bit_rate.to_string()
        }
    });
    exit(0, serde_json::to_vec(&document).unwrap(), Vec::new())
}

fn exit(code: i32, stdout: Vec<u8>, stderr: Vec<u8>) -> Output {
    Output {
        status: ExitStatus::from_raw(code << 8),
        stdout,
        stderr,
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub tools: Arc<FakeTools>,
    pub ctx: Arc<PublisherContext>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut PublisherConfig)) -> Self {
        Self::build(adjust, None)
    }

    /// Every ffmpeg run takes at least `delay`.
    pub fn with_slow_ffmpeg(delay: Duration) -> Self {
        Self::build(|_| {}, Some(delay))
    }

    fn build(adjust: impl FnOnce(&mut PublisherConfig), ffmpeg_delay: Option<Duration>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PublisherConfig::with_base_dir(dir.path());
        config.audio.probe_timeout_seconds = 5;
        config.audio.transcode_timeout_seconds = 5;
        adjust(&mut config);
        let tools = FakeTools::new();
        let executor: Arc<dyn CommandExecutor> = match ffmpeg_delay {
            Some(delay) => Arc::new(SlowFfmpeg {
                inner: tools.clone(),
                delay,
            }),
            None => tools.clone(),
        };
        let ctx = Arc::new(PublisherContext::from_config(config, executor));
        Self { dir, tools, ctx }
    }

    /// Polls until a job holds the episode's audio claim.
    pub async fn wait_for_claim(&self, show_id: &str, episode_id: &str) {
        for _ in 0..200 {
            match self.catalog().try_claim_audio(show_id, episode_id) {
                Ok(claim) => drop(claim),
                Err(_) => return,
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no job claimed {show_id}/{episode_id}");
    }

    pub fn catalog(&self) -> &Catalog {
        &self.ctx.catalog
    }

    pub async fn create_show(&self, show_id: &str) {
        let config = ShowFeedConfig {
            title: Some("Morning Show".into()),
            description: Some("Daily news".into()),
            author: Some("Jo Host".into()),
            language: Some("en-US".into()),
            category_main: Some("News".into()),
            ..ShowFeedConfig::default()
        };
        self.catalog().save_show(show_id, &config).await.unwrap();
    }

    pub async fn create_episode(&self, show_id: &str, title: &str) -> String {
        let draft = NewEpisode {
            title: title.into(),
            description: "First line\n\n1. Intro\n- welcome".into(),
            ..NewEpisode::default()
        };
        self.catalog().create_episode(show_id, &draft).await.unwrap().0
    }

    pub fn episode_dir(&self, show_id: &str, episode_id: &str) -> PathBuf {
        self.catalog().episode_dir(show_id, episode_id).unwrap()
    }

    pub async fn metadata(&self, show_id: &str, episode_id: &str) -> EpisodeMetadata {
        self.catalog().load_episode(show_id, episode_id).await.unwrap()
    }

    /// Polls until the episode leaves `processing`.
    pub async fn wait_for_terminal(&self, show_id: &str, episode_id: &str) -> EpisodeMetadata {
        for _ in 0..500 {
            let metadata = self.metadata(show_id, episode_id).await;
            if metadata.status().terminal() {
                return metadata;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("episode {show_id}/{episode_id} never finished processing");
    }
}

pub fn write_fixture(dir: &Path, name: &str, contents: &str) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}
