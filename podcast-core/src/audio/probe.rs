use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, warn};

use super::error::{ProbeError, ProbeResult};
use crate::command::{run_with_timeout, CommandExecutor, ToolOutcome};

/// Technical attributes of an audio file as reported by ffprobe.
///
/// Field names match the keys stored in episode metadata records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioInfo {
    pub filename: String,
    /// Display bitrate, `"<kbps> kbps"` or `"N/A"`.
    pub bitrate: String,
    pub size: String,
    pub size_bytes: u64,
    pub duration: String,
    pub duration_seconds: Option<f64>,
    pub samplerate: Option<u32>,
    pub channels: Option<u32>,
    pub format: String,
}

impl AudioInfo {
    pub fn bitrate_kbps(&self) -> Option<u32> {
        parse_bitrate_label(&self.bitrate)
    }

    /// True when the container reported by ffprobe is MP3.
    pub fn is_mp3_container(&self) -> bool {
        self.format
            .split(',')
            .any(|name| name.trim().eq_ignore_ascii_case("mp3"))
    }
}

/// Parses the leading integer of a `"192 kbps"` style label.
pub fn parse_bitrate_label(label: &str) -> Option<u32> {
    label.split_whitespace().next()?.parse().ok()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct FfprobeOutput {
    #[serde(default)]
    pub streams: Vec<FfprobeStream>,
    #[serde(default)]
    pub format: FfprobeFormat,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct FfprobeStream {
    pub codec_type: Option<String>,
    pub bit_rate: Option<String>,
    pub sample_rate: Option<String>,
    pub channels: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct FfprobeFormat {
    pub format_name: Option<String>,
    pub duration: Option<String>,
    pub size: Option<String>,
    pub bit_rate: Option<String>,
}

#[derive(Clone)]
pub struct AudioProber {
    executor: Arc<dyn CommandExecutor>,
    ffprobe: PathBuf,
    timeout: Duration,
}

impl std::fmt::Debug for AudioProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioProber")
            .field("ffprobe", &self.ffprobe)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl AudioProber {
    pub fn new(executor: Arc<dyn CommandExecutor>, ffprobe: PathBuf, timeout: Duration) -> Self {
        Self {
            executor,
            ffprobe,
            timeout,
        }
    }

    pub async fn probe(&self, path: &Path) -> ProbeResult<AudioInfo> {
        if fs::metadata(path).await.is_err() {
            return Err(ProbeError::MissingFile {
                path: path.to_path_buf(),
            });
        }
        let mut command = Command::new(&self.ffprobe);
        command
            .arg("-v")
            .arg("quiet")
            .arg("-print_format")
            .arg("json")
            .arg("-show_format")
            .arg("-show_streams")
            .arg(path);
        let output = match run_with_timeout(self.executor.as_ref(), &mut command, self.timeout).await
        {
            ToolOutcome::Completed(output) if output.status.success() => output,
            ToolOutcome::Completed(output) => {
                let stderr = ToolOutcome::stderr_lossy(&output);
                warn!(file = %path.display(), %stderr, "ffprobe returned non-zero status");
                return Err(ProbeError::Failed {
                    status: output.status.code(),
                    stderr,
                });
            }
            ToolOutcome::NotFound => {
                return Err(ProbeError::ToolMissing {
                    tool: self.ffprobe.clone(),
                })
            }
            ToolOutcome::SpawnFailed(source) => {
                return Err(ProbeError::Io {
                    source,
                    path: self.ffprobe.clone(),
                })
            }
            ToolOutcome::TimedOut(limit) => return Err(ProbeError::Timeout(limit)),
        };
        let parsed: FfprobeOutput = serde_json::from_slice(&output.stdout)?;
        let info = audio_info_from_ffprobe(path, &parsed);
        debug!(file = %path.display(), bitrate = %info.bitrate, format = %info.format, "probed audio");
        Ok(info)
    }
}

pub(crate) fn audio_info_from_ffprobe(path: &Path, data: &FfprobeOutput) -> AudioInfo {
    let audio_stream = data
        .streams
        .iter()
        .find(|stream| stream.codec_type.as_deref() == Some("audio"));

    let bitrate_bits = data
        .format
        .bit_rate
        .as_deref()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .or_else(|| {
            audio_stream
                .and_then(|stream| stream.bit_rate.as_deref())
                .and_then(|value| value.trim().parse::<u64>().ok())
        });
    let bitrate = bitrate_bits
        .map(|bits| format!("{} kbps", bits / 1000))
        .unwrap_or_else(|| "N/A".to_string());

    let size_bytes = data
        .format
        .size
        .as_deref()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(0);
    let duration_seconds = data
        .format
        .duration
        .as_deref()
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite() && *value >= 0.0);
    let samplerate = audio_stream
        .and_then(|stream| stream.sample_rate.as_deref())
        .and_then(|value| value.trim().parse::<u32>().ok());
    let channels = audio_stream.and_then(|stream| stream.channels);

    AudioInfo {
        filename: path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default(),
        bitrate,
        size: format_size(size_bytes),
        size_bytes,
        duration: format_duration(duration_seconds.unwrap_or(0.0)),
        duration_seconds,
        samplerate,
        channels,
        format: data
            .format
            .format_name
            .clone()
            .unwrap_or_else(|| "N/A".to_string()),
    }
}

/// Human readable size using binary units, e.g. `"1.5 MB"` or `"2.0 KB"`.
///
/// Keeps at least one and at most two decimals.
pub fn format_size(size_bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if size_bytes == 0 {
        return "0 B".to_string();
    }
    let mut value = size_bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = (value * 100.0).round() / 100.0;
    if rounded.fract() == 0.0 {
        format!("{rounded:.1} {}", UNITS[unit])
    } else {
        format!("{rounded} {}", UNITS[unit])
    }
}

/// `HH:MM:SS` when the duration reaches an hour, `MM:SS` otherwise.
pub fn format_duration(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds as u64
    } else {
        0
    };
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes:02}:{secs:02}")
    }
}
