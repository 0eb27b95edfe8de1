use std::fmt;
use std::path::Path;

use tracing::{debug, info};

use super::error::ProbeError;
use super::probe::{AudioInfo, AudioProber};
use crate::config::AudioSection;

/// Constant bitrates accepted by the MP3 encoder, in kbps.
pub const BITRATE_LADDER: [u32; 14] = [32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];

/// Lowest bitrate podcast directories accept without complaint.
pub const PLATFORM_MINIMUM_KBPS: u32 = 160;

pub const DEFAULT_BITRATE_KBPS: u32 = 192;

/// Encoder bitrate, rendered as ffmpeg expects it (`"192k"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetBitrate(u32);

impl TargetBitrate {
    /// Rounds up to the nearest ladder step.
    pub fn from_kbps(kbps: u32) -> Self {
        TargetBitrate(ladder_ceiling(kbps))
    }

    pub fn kbps(self) -> u32 {
        self.0
    }

    pub fn label(self) -> String {
        format!("{}k", self.0)
    }
}

impl fmt::Display for TargetBitrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}k", self.0)
    }
}

/// Picks a ladder bitrate using the platform defaults.
pub fn select_target_bitrate(source_kbps: Option<u32>) -> TargetBitrate {
    BitratePolicy::default().select(source_kbps)
}

fn ladder_ceiling(kbps: u32) -> u32 {
    BITRATE_LADDER
        .iter()
        .copied()
        .find(|step| *step >= kbps)
        .unwrap_or(BITRATE_LADDER[BITRATE_LADDER.len() - 1])
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeDecision {
    pub required: bool,
    pub reason: String,
    pub info: Option<AudioInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitratePolicy {
    minimum_kbps: u32,
    default_kbps: u32,
}

impl Default for BitratePolicy {
    fn default() -> Self {
        Self {
            minimum_kbps: PLATFORM_MINIMUM_KBPS,
            default_kbps: DEFAULT_BITRATE_KBPS,
        }
    }
}

impl BitratePolicy {
    pub fn from_config(config: &AudioSection) -> Self {
        Self {
            minimum_kbps: config.min_bitrate_kbps,
            default_kbps: config.default_bitrate_kbps,
        }
    }

    pub fn minimum_kbps(&self) -> u32 {
        self.minimum_kbps
    }

    pub fn select(&self, source_kbps: Option<u32>) -> TargetBitrate {
        match source_kbps {
            Some(source) => {
                let effective = source.max(self.minimum_kbps);
                TargetBitrate(ladder_ceiling(effective))
            }
            None => {
                info!(
                    fallback = self.default_kbps,
                    "source bitrate unknown, using default target"
                );
                TargetBitrate(ladder_ceiling(self.default_kbps))
            }
        }
    }

    /// Probes `path` and decides whether it must be re-encoded.
    pub async fn needs_transcoding(&self, prober: &AudioProber, path: &Path) -> TranscodeDecision {
        let probed = prober.probe(path).await;
        let decision = self.decide(path, probed);
        debug!(
            file = %path.display(),
            required = decision.required,
            reason = %decision.reason,
            "transcode decision"
        );
        decision
    }

    pub fn decide(&self, path: &Path, probed: Result<AudioInfo, ProbeError>) -> TranscodeDecision {
        let info = match probed {
            Ok(info) => info,
            Err(err) => {
                return TranscodeDecision {
                    required: true,
                    reason: format!("could not analyze audio: {err}"),
                    info: None,
                }
            }
        };
        let mp3_extension = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("mp3"))
            .unwrap_or(false);
        if !mp3_extension || !info.is_mp3_container() {
            return TranscodeDecision {
                required: true,
                reason: format!("format {} is not MP3", info.format),
                info: Some(info),
            };
        }
        match info.bitrate_kbps() {
            None => TranscodeDecision {
                required: true,
                reason: format!("unreadable bitrate: {}", info.bitrate),
                info: Some(info),
            },
            Some(kbps) if kbps < self.minimum_kbps => TranscodeDecision {
                required: true,
                reason: format!("bitrate {kbps} kbps is below the {} kbps minimum", self.minimum_kbps),
                info: Some(info),
            },
            Some(kbps) => TranscodeDecision {
                required: false,
                reason: format!("already compliant: MP3 at {kbps} kbps"),
                info: Some(info),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(format: &str, bitrate: &str) -> AudioInfo {
        AudioInfo {
            filename: "episode.mp3".into(),
            bitrate: bitrate.into(),
            size: "1 MB".into(),
            size_bytes: 1_048_576,
            duration: "01:00".into(),
            duration_seconds: Some(60.0),
            samplerate: Some(44_100),
            channels: Some(2),
            format: format.into(),
        }
    }

    #[test]
    fn selects_ladder_values() {
        assert_eq!(select_target_bitrate(Some(192)).label(), "192k");
        assert_eq!(select_target_bitrate(Some(500)).label(), "320k");
        assert_eq!(select_target_bitrate(Some(0)).label(), "160k");
        assert_eq!(select_target_bitrate(Some(70)).label(), "160k");
        assert_eq!(select_target_bitrate(Some(200)).label(), "224k");
        assert_eq!(select_target_bitrate(None).label(), "192k");
    }

    #[test]
    fn selection_is_monotonic_and_on_the_ladder() {
        let mut previous = select_target_bitrate(Some(0));
        for source in 0..=400 {
            let target = select_target_bitrate(Some(source));
            assert!(BITRATE_LADDER.contains(&target.kbps()));
            assert!(target >= previous);
            assert!(target.kbps() >= source.min(320));
            assert!(target.kbps() >= PLATFORM_MINIMUM_KBPS);
            previous = target;
        }
    }

    #[test]
    fn configured_minimum_is_respected() {
        let policy = BitratePolicy::from_config(&AudioSection {
            min_bitrate_kbps: 128,
            default_bitrate_kbps: 160,
            ..AudioSection::default()
        });
        assert_eq!(policy.select(Some(96)).kbps(), 128);
        assert_eq!(policy.select(None).kbps(), 160);
    }

    #[test]
    fn non_mp3_requires_transcoding() {
        let policy = BitratePolicy::default();
        let decision = policy.decide(Path::new("ep.wav"), Ok(info("wav", "1411 kbps")));
        assert!(decision.required);
        assert!(decision.reason.contains("not MP3"));

        let disguised = policy.decide(Path::new("ep.mp3"), Ok(info("ogg", "192 kbps")));
        assert!(disguised.required);
    }

    #[test]
    fn low_bitrate_mp3_requires_transcoding() {
        let policy = BitratePolicy::default();
        let decision = policy.decide(Path::new("ep.mp3"), Ok(info("mp3", "128 kbps")));
        assert!(decision.required);
        assert!(decision.reason.contains("below"));

        let unknown = policy.decide(Path::new("ep.mp3"), Ok(info("mp3", "N/A")));
        assert!(unknown.required);
    }

    #[test]
    fn compliant_mp3_is_left_alone() {
        let policy = BitratePolicy::default();
        let decision = policy.decide(Path::new("ep.MP3"), Ok(info("mp3", "192 kbps")));
        assert!(!decision.required);
        assert!(decision.reason.starts_with("already compliant"));
        assert!(decision.info.is_some());
    }

    #[test]
    fn probe_failure_requires_transcoding() {
        let policy = BitratePolicy::default();
        let decision = policy.decide(
            Path::new("ep.mp3"),
            Err(ProbeError::Parse("truncated".into())),
        );
        assert!(decision.required);
        assert!(decision.info.is_none());
    }
}
