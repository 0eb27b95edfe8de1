use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::text::normalize_explicit;
use crate::audio::AudioInfo;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConversionStatus {
    #[default]
    Pending,
    Processing,
    Success,
    Failed,
    #[serde(other)]
    Unknown,
}

impl ConversionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversionStatus::Pending => "pending",
            ConversionStatus::Processing => "processing",
            ConversionStatus::Success => "success",
            ConversionStatus::Failed => "failed",
            ConversionStatus::Unknown => "unknown",
        }
    }

    pub fn terminal(&self) -> bool {
        matches!(self, ConversionStatus::Success | ConversionStatus::Failed)
    }
}

impl fmt::Display for ConversionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ConversionStatus::Pending),
            "processing" => Ok(ConversionStatus::Processing),
            "success" => Ok(ConversionStatus::Success),
            "failed" => Ok(ConversionStatus::Failed),
            other => Err(format!("unknown conversion status: {other}")),
        }
    }
}

/// Channel level settings stored in `<show>/config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ShowFeedConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub explicit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copyright: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_main: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_sub: Option<String>,
    /// Cover file name relative to the show directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub show_type: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_u64",
        skip_serializing_if = "Option::is_none"
    )]
    pub ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ShowFeedConfig {
    pub fn is_explicit(&self) -> bool {
        self.explicit.as_deref().map(normalize_explicit).unwrap_or(false)
    }

    pub fn title_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        non_empty(self.title.as_deref()).unwrap_or(fallback)
    }
}

/// Per-episode record stored in `<episode>/metadata.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EpisodeMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub explicit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_main: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubdate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub duration: Option<String>,
    /// Public path of the audio file, `/shows/<show>/episodes/<ep>/<file>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversion_status: Option<ConversionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversion_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_u64",
        skip_serializing_if = "Option::is_none"
    )]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(
        default,
        deserialize_with = "lenient_u32",
        skip_serializing_if = "Option::is_none"
    )]
    pub samplerate: Option<u32>,
    #[serde(
        default,
        deserialize_with = "lenient_u32",
        skip_serializing_if = "Option::is_none"
    )]
    pub channels: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EpisodeMetadata {
    pub fn status(&self) -> ConversionStatus {
        self.conversion_status.unwrap_or(ConversionStatus::Unknown)
    }

    pub fn is_explicit(&self) -> bool {
        self.explicit.as_deref().map(normalize_explicit).unwrap_or(false)
    }

    /// File name of the current audio, preferring the public reference.
    pub fn audio_file_name(&self) -> Option<String> {
        non_empty(self.audio.as_deref())
            .and_then(|audio| Path::new(audio).file_name())
            .map(|name| name.to_string_lossy().to_string())
            .or_else(|| non_empty(self.filename.as_deref()).map(str::to_string))
    }

    pub fn set_audio_reference(&mut self, show_id: &str, episode_id: &str, file_name: &str) {
        self.audio = Some(audio_reference(show_id, episode_id, file_name));
    }

    pub fn mark_processing(&mut self) {
        self.conversion_status = Some(ConversionStatus::Processing);
        self.conversion_error = None;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.conversion_status = Some(ConversionStatus::Failed);
        self.conversion_error = Some(error.into());
    }

    /// Copies every probed attribute and marks the record successful.
    pub fn apply_audio_info(&mut self, info: &AudioInfo) {
        self.filename = Some(info.filename.clone());
        self.bitrate = Some(info.bitrate.clone());
        self.size = Some(info.size.clone());
        self.size_bytes = Some(info.size_bytes);
        self.duration = Some(info.duration.clone());
        self.duration_seconds = info.duration_seconds;
        self.samplerate = info.samplerate;
        self.channels = info.channels;
        self.format = Some(info.format.clone());
        self.conversion_status = Some(ConversionStatus::Success);
        self.conversion_error = None;
    }
}

pub fn audio_reference(show_id: &str, episode_id: &str, file_name: &str) -> String {
    format!("/shows/{show_id}/episodes/{episode_id}/{file_name}")
}

pub(crate) fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Fields accepted when creating an episode.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewEpisode {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub explicit: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub category_main: Option<String>,
    #[serde(default)]
    pub category_sub: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub pubdate: Option<String>,
    #[serde(default)]
    pub transcript: Option<String>,
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(Value::Bool(b)) => Some(b.to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(other) => Some(other.to_string()),
    })
}

fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_u64(deserializer)?.and_then(|v| u32::try_from(v).ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_keys_survive_round_trip() {
        let raw = r#"{"title":"Pilot","explicit":"yes","genres":["news"],"number":3}"#;
        let meta: EpisodeMetadata = serde_json::from_str(raw).unwrap();
        assert!(meta.is_explicit());
        let encoded = serde_json::to_value(&meta).unwrap();
        assert_eq!(encoded["genres"][0], "news");
        assert_eq!(encoded["number"], 3);
    }

    #[test]
    fn loosely_typed_fields_are_accepted() {
        let raw = r#"{"explicit":true,"duration":125,"size_bytes":"2048","samplerate":"44100","ttl":"60"}"#;
        let meta: EpisodeMetadata = serde_json::from_str(raw).unwrap();
        assert_eq!(meta.explicit.as_deref(), Some("true"));
        assert_eq!(meta.duration.as_deref(), Some("125"));
        assert_eq!(meta.size_bytes, Some(2048));
        assert_eq!(meta.samplerate, Some(44_100));

        let show: ShowFeedConfig = serde_json::from_str(r#"{"ttl":"60","type":"serial"}"#).unwrap();
        assert_eq!(show.ttl, Some(60));
        assert_eq!(show.show_type.as_deref(), Some("serial"));
    }

    #[test]
    fn unrecognized_status_is_unknown() {
        let meta: EpisodeMetadata =
            serde_json::from_str(r#"{"conversion_status":"exploded"}"#).unwrap();
        assert_eq!(meta.status(), ConversionStatus::Unknown);
        assert_eq!("failed".parse::<ConversionStatus>(), Ok(ConversionStatus::Failed));
    }

    #[test]
    fn audio_file_name_prefers_reference() {
        let mut meta = EpisodeMetadata {
            filename: Some("old.wav".into()),
            ..EpisodeMetadata::default()
        };
        assert_eq!(meta.audio_file_name().as_deref(), Some("old.wav"));
        meta.set_audio_reference("show", "ep1", "new.mp3");
        assert_eq!(meta.audio.as_deref(), Some("/shows/show/episodes/ep1/new.mp3"));
        assert_eq!(meta.audio_file_name().as_deref(), Some("new.mp3"));
    }

    #[test]
    fn applying_audio_info_clears_error() {
        let mut meta = EpisodeMetadata::default();
        meta.mark_failed("boom");
        meta.apply_audio_info(&AudioInfo {
            filename: "ep.mp3".into(),
            bitrate: "192 kbps".into(),
            size: "1 MB".into(),
            size_bytes: 1_048_576,
            duration: "01:00".into(),
            duration_seconds: Some(60.0),
            samplerate: Some(44_100),
            channels: Some(2),
            format: "mp3".into(),
        });
        assert_eq!(meta.status(), ConversionStatus::Success);
        assert!(meta.conversion_error.is_none());
        assert_eq!(meta.filename.as_deref(), Some("ep.mp3"));
    }
}
