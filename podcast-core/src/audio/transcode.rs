use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::error::{TranscodeError, TranscodeResult};
use super::policy::TargetBitrate;
use crate::command::{describe, run_with_timeout, CommandExecutor, ToolOutcome};

/// ID3 frames written alongside the audio.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Id3Fields {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub date: Option<String>,
    pub copyright: Option<String>,
    pub explicit: bool,
}

impl Id3Fields {
    fn metadata_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let pairs = [
            ("title", &self.title),
            ("artist", &self.artist),
            ("album", &self.album),
            ("date", &self.date),
            ("copyright", &self.copyright),
        ];
        for (key, value) in pairs {
            if let Some(value) = value.as_deref().filter(|v| !v.trim().is_empty()) {
                args.push("-metadata".to_string());
                args.push(format!("{key}={value}"));
            }
        }
        // Written as a TXXX frame by the mp3 muxer.
        args.push("-metadata".to_string());
        args.push(format!("EXPLICIT={}", if self.explicit { "true" } else { "false" }));
        args
    }
}

#[derive(Clone)]
pub struct Transcoder {
    executor: Arc<dyn CommandExecutor>,
    ffmpeg: PathBuf,
    timeout: Duration,
}

impl std::fmt::Debug for Transcoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transcoder")
            .field("ffmpeg", &self.ffmpeg)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Transcoder {
    pub fn new(executor: Arc<dyn CommandExecutor>, ffmpeg: PathBuf, timeout: Duration) -> Self {
        Self {
            executor,
            ffmpeg,
            timeout,
        }
    }

    /// Encodes `source` to constant-bitrate MP3 and returns the new path.
    ///
    /// The output sits next to the source with an `.mp3` extension. The
    /// source is removed once the output is in place; on failure it is left
    /// untouched and nothing else remains on disk.
    pub async fn transcode(
        &self,
        source: &Path,
        bitrate: TargetBitrate,
        fields: &Id3Fields,
        cover: Option<&Path>,
    ) -> TranscodeResult<PathBuf> {
        ensure_exists(source).await?;
        let output = source.with_extension("mp3");
        let scratch = scratch_path(&output, "partial");

        let mut command = Command::new(&self.ffmpeg);
        command.arg("-hide_banner").arg("-loglevel").arg("error");
        command.arg("-i").arg(source);
        push_cover_inputs(&mut command, cover);
        command
            .arg("-ac")
            .arg("2")
            .arg("-ar")
            .arg("44100")
            .arg("-c:a")
            .arg("libmp3lame")
            .arg("-b:a")
            .arg(bitrate.label())
            .arg("-id3v2_version")
            .arg("3")
            .args(fields.metadata_args())
            .arg("-f")
            .arg("mp3")
            .arg("-y")
            .arg(&scratch);

        info!(
            source = %source.display(),
            bitrate = %bitrate,
            cover = cover.is_some(),
            "transcoding audio"
        );
        self.run_into(&mut command, &scratch).await?;
        replace_file(&scratch, &output).await?;
        if output != source {
            if let Err(err) = fs::remove_file(source).await {
                warn!(source = %source.display(), error = %err, "failed to remove transcoded source");
            }
        }
        Ok(output)
    }

    /// Rewrites the ID3 tags of an MP3 without re-encoding the audio.
    pub async fn retag_in_place(
        &self,
        source: &Path,
        fields: &Id3Fields,
        cover: Option<&Path>,
    ) -> TranscodeResult<PathBuf> {
        ensure_exists(source).await?;
        let scratch = scratch_path(source, "retag");

        let mut command = Command::new(&self.ffmpeg);
        command.arg("-hide_banner").arg("-loglevel").arg("error");
        command.arg("-i").arg(source);
        push_cover_inputs(&mut command, cover);
        if cover.is_none() {
            command.arg("-map").arg("0:a:0");
        }
        command
            .arg("-c:a")
            .arg("copy")
            .arg("-id3v2_version")
            .arg("3")
            .args(fields.metadata_args())
            .arg("-f")
            .arg("mp3")
            .arg("-y")
            .arg(&scratch);

        info!(source = %source.display(), "writing ID3 tags");
        self.run_into(&mut command, &scratch).await?;
        replace_file(&scratch, source).await?;
        Ok(source.to_path_buf())
    }

    async fn run_into(&self, command: &mut Command, scratch: &Path) -> TranscodeResult<()> {
        debug!(command = %describe(command), "running ffmpeg");
        let result = match run_with_timeout(self.executor.as_ref(), command, self.timeout).await {
            ToolOutcome::Completed(output) if output.status.success() => Ok(()),
            ToolOutcome::Completed(output) => Err(TranscodeError::Failed {
                status: output.status.code(),
                stderr: ToolOutcome::stderr_lossy(&output),
            }),
            ToolOutcome::NotFound => Err(TranscodeError::ToolMissing {
                tool: self.ffmpeg.clone(),
            }),
            ToolOutcome::SpawnFailed(source) => Err(TranscodeError::Io {
                source,
                path: self.ffmpeg.clone(),
            }),
            ToolOutcome::TimedOut(limit) => Err(TranscodeError::Timeout { limit }),
        };
        if let Err(err) = &result {
            warn!(output = %scratch.display(), error = %err, "ffmpeg failed");
            let _ = fs::remove_file(scratch).await;
        }
        result
    }
}

/// True when the file starts with an ID3v2 header.
pub async fn has_tags(path: &Path) -> bool {
    let mut file = match fs::File::open(path).await {
        Ok(file) => file,
        Err(_) => return false,
    };
    let mut header = [0u8; 3];
    match file.read_exact(&mut header).await {
        Ok(_) => &header == b"ID3",
        Err(_) => false,
    }
}

fn push_cover_inputs(command: &mut Command, cover: Option<&Path>) {
    if let Some(cover) = cover {
        command
            .arg("-i")
            .arg(cover)
            .arg("-map")
            .arg("0:a:0")
            .arg("-map")
            .arg("1:v:0")
            .arg("-c:v")
            .arg("copy")
            .arg("-disposition:v:0")
            .arg("attached_pic")
            .arg("-metadata:s:v")
            .arg("title=Album cover")
            .arg("-metadata:s:v")
            .arg("comment=Cover (front)");
    }
}

/// Hidden sibling used as ffmpeg's output until the run succeeds.
fn scratch_path(target: &Path, purpose: &str) -> PathBuf {
    let stem = target
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_else(|| OsString::from("audio"));
    let mut name = OsString::from(".");
    name.push(stem);
    name.push(format!(".{purpose}.mp3"));
    target.with_file_name(name)
}

async fn ensure_exists(path: &Path) -> TranscodeResult<()> {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(()),
        _ => Err(TranscodeError::MissingSource {
            path: path.to_path_buf(),
        }),
    }
}

async fn replace_file(from: &Path, to: &Path) -> TranscodeResult<()> {
    if let Err(source) = fs::rename(from, to).await {
        let _ = fs::remove_file(from).await;
        return Err(TranscodeError::Io {
            source,
            path: to.to_path_buf(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Output};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Writes `payload` to the last argument, or fails with `stderr`.
    struct ScriptedFfmpeg {
        payload: Option<Vec<u8>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedFfmpeg {
        fn succeeding(payload: &[u8]) -> Self {
            Self {
                payload: Some(payload.to_vec()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                payload: None,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl CommandExecutor for ScriptedFfmpeg {
        async fn run(&self, command: &mut Command) -> io::Result<Output> {
            let args: Vec<String> = command
                .as_std()
                .get_args()
                .map(|arg| arg.to_string_lossy().to_string())
                .collect();
            self.calls.lock().unwrap().push(args.clone());
            let target = PathBuf::from(args.last().cloned().unwrap_or_default());
            match &self.payload {
                Some(payload) => {
                    std::fs::write(&target, payload)?;
                    Ok(Output {
                        status: ExitStatus::from_raw(0),
                        stdout: Vec::new(),
                        stderr: Vec::new(),
                    })
                }
                None => {
                    std::fs::write(&target, b"half")?;
                    Ok(Output {
                        status: ExitStatus::from_raw(1 << 8),
                        stdout: Vec::new(),
                        stderr: b"Invalid data found when processing input".to_vec(),
                    })
                }
            }
        }
    }

    fn transcoder(executor: Arc<ScriptedFfmpeg>) -> Transcoder {
        Transcoder::new(executor, PathBuf::from("ffmpeg"), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn transcode_replaces_source_with_mp3() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("episode.wav");
        std::fs::write(&source, b"RIFF....").unwrap();
        let executor = Arc::new(ScriptedFfmpeg::succeeding(b"ID3encoded"));
        let fields = Id3Fields {
            title: Some("Pilot".into()),
            explicit: true,
            ..Id3Fields::default()
        };

        let output = transcoder(executor.clone())
            .transcode(&source, TargetBitrate::from_kbps(192), &fields, None)
            .await
            .unwrap();

        assert_eq!(output, dir.path().join("episode.mp3"));
        assert!(!source.exists());
        assert_eq!(std::fs::read(&output).unwrap(), b"ID3encoded");
        let calls = executor.calls.lock().unwrap();
        let args = &calls[0];
        assert!(args.windows(2).any(|w| w[0] == "-b:a" && w[1] == "192k"));
        assert!(args.windows(2).any(|w| w[0] == "-c:a" && w[1] == "libmp3lame"));
        assert!(args.iter().any(|a| a == "EXPLICIT=true"));
        assert!(args.iter().any(|a| a == "title=Pilot"));
    }

    #[tokio::test]
    async fn transcode_over_same_path_keeps_name() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("episode.mp3");
        std::fs::write(&source, b"low bitrate").unwrap();
        let executor = Arc::new(ScriptedFfmpeg::succeeding(b"ID3better"));

        let output = transcoder(executor)
            .transcode(&source, TargetBitrate::from_kbps(160), &Id3Fields::default(), None)
            .await
            .unwrap();

        assert_eq!(output, source);
        assert_eq!(std::fs::read(&source).unwrap(), b"ID3better");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn failed_transcode_leaves_source_untouched() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("episode.flac");
        std::fs::write(&source, b"fLaC").unwrap();
        let executor = Arc::new(ScriptedFfmpeg::failing());

        let err = transcoder(executor)
            .transcode(&source, TargetBitrate::from_kbps(192), &Id3Fields::default(), None)
            .await
            .unwrap_err();

        match err {
            TranscodeError::Failed { stderr, .. } => assert!(stderr.contains("Invalid data")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(std::fs::read(&source).unwrap(), b"fLaC");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn cover_is_attached_as_picture_stream() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("episode.m4a");
        let cover = dir.path().join("cover.jpg");
        std::fs::write(&source, b"m4a").unwrap();
        std::fs::write(&cover, b"jpg").unwrap();
        let executor = Arc::new(ScriptedFfmpeg::succeeding(b"ID3"));

        transcoder(executor.clone())
            .transcode(&source, TargetBitrate::from_kbps(192), &Id3Fields::default(), Some(&cover))
            .await
            .unwrap();

        let calls = executor.calls.lock().unwrap();
        let args = &calls[0];
        assert!(args.windows(2).any(|w| w[0] == "-map" && w[1] == "1:v:0"));
        assert!(args.windows(2).any(|w| w[0] == "-c:v" && w[1] == "copy"));
        assert!(args.iter().any(|a| a == "attached_pic"));
    }

    #[tokio::test]
    async fn retag_copies_audio_and_adds_header() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("episode.mp3");
        std::fs::write(&source, b"\xff\xfbframes").unwrap();
        assert!(!has_tags(&source).await);
        let executor = Arc::new(ScriptedFfmpeg::succeeding(b"ID3\x03\x00\xff\xfbframes"));

        let path = transcoder(executor.clone())
            .retag_in_place(&source, &Id3Fields::default(), None)
            .await
            .unwrap();

        assert_eq!(path, source);
        assert!(has_tags(&source).await);
        let calls = executor.calls.lock().unwrap();
        assert!(calls[0].windows(2).any(|w| w[0] == "-c:a" && w[1] == "copy"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn failed_retag_removes_scratch_file() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("episode.mp3");
        std::fs::write(&source, b"\xff\xfb").unwrap();

        let result = transcoder(Arc::new(ScriptedFfmpeg::failing()))
            .retag_in_place(&source, &Id3Fields::default(), None)
            .await;

        assert!(result.is_err());
        assert_eq!(std::fs::read(&source).unwrap(), b"\xff\xfb");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn missing_source_is_reported() {
        let dir = TempDir::new().unwrap();
        let err = transcoder(Arc::new(ScriptedFfmpeg::failing()))
            .transcode(&dir.path().join("nope.wav"), TargetBitrate::from_kbps(192), &Id3Fields::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::MissingSource { .. }));
    }

    #[test]
    fn explicit_flag_uses_canonical_words() {
        let fields = Id3Fields::default();
        assert!(fields.metadata_args().contains(&"EXPLICIT=false".to_string()));
    }
}
