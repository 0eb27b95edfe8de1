//! Audio inspection and normalization.
//!
//! [`AudioProber`] reads technical attributes through ffprobe,
//! [`BitratePolicy`] decides whether a file meets directory requirements and
//! [`Transcoder`] re-encodes or re-tags it with ffmpeg.

mod error;
mod policy;
mod probe;
mod transcode;

pub use error::{ProbeError, ProbeResult, TranscodeError, TranscodeResult};
pub use policy::{
    select_target_bitrate, BitratePolicy, TargetBitrate, TranscodeDecision, BITRATE_LADDER,
    DEFAULT_BITRATE_KBPS, PLATFORM_MINIMUM_KBPS,
};
pub use probe::{format_duration, format_size, parse_bitrate_label, AudioInfo, AudioProber};
pub use transcode::{has_tags, Id3Fields, Transcoder};
