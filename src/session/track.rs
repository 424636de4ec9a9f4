//! Per-mid negotiation records

use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use crate::sdp::OpusCodecParameters;
use crate::stats::FecRecommendation;

pub type Mid = String;

/// Media kind of a transceiver
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Codec a transceiver should list first
#[typeshare]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreferredCodec {
    #[default]
    #[serde(rename = "opus")]
    Opus,
    /// audio/red wrapping opus
    #[serde(rename = "red-fec")]
    RedFec,
}

/// Opus preset family of a track
#[typeshare]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityMode {
    #[default]
    Speech,
    Music,
}

/// What the session negotiates for one media section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackNegotiationRecord {
    pub mid: Mid,
    pub kind: MediaKind,
    /// Human-readable name, exchanged over the data channel
    pub label: Option<String>,
    pub preferred_codec: PreferredCodec,
    pub opus_params: OpusCodecParameters,
    /// Seconds
    pub playout_delay: Option<f64>,
    pub quality_mode: QualityMode,
}

impl TrackNegotiationRecord {
    pub fn audio(mid: impl Into<Mid>, opus_params: OpusCodecParameters) -> Self {
        Self {
            mid: mid.into(),
            kind: MediaKind::Audio,
            label: None,
            preferred_codec: PreferredCodec::Opus,
            opus_params,
            playout_delay: None,
            quality_mode: QualityMode::Speech,
        }
    }

    pub fn video(mid: impl Into<Mid>) -> Self {
        Self {
            kind: MediaKind::Video,
            ..Self::audio(mid, OpusCodecParameters::default())
        }
    }

    pub fn is_audio(&self) -> bool {
        self.kind == MediaKind::Audio
    }

    /// New record with `params` merged over the current parameters
    pub fn with_parameters(&self, params: &OpusCodecParameters) -> Self {
        Self {
            opus_params: self.opus_params.merged_with(params),
            ..self.clone()
        }
    }

    /// New record switched to `mode`, parameters replaced by `preset`
    pub fn with_quality_mode(&self, mode: QualityMode, preset: &OpusCodecParameters) -> Self {
        Self {
            quality_mode: mode,
            ..self.with_parameters(preset)
        }
    }

    /// FEC mode the record currently asks for
    pub fn fec_mode(&self) -> FecRecommendation {
        match (self.preferred_codec, self.opus_params.inband_fec) {
            (PreferredCodec::RedFec, _) => FecRecommendation::RedundantFec,
            (PreferredCodec::Opus, Some(true)) => FecRecommendation::InbandFec,
            _ => FecRecommendation::NoChange,
        }
    }

    /// New record following `recommendation`, `None` if nothing would change.
    pub fn apply_recommendation(&self, recommendation: FecRecommendation) -> Option<Self> {
        if !self.is_audio()
            || recommendation == FecRecommendation::NoChange
            || recommendation == self.fec_mode()
        {
            return None;
        }

        let mut next = self.clone();
        match recommendation {
            FecRecommendation::InbandFec => {
                next.preferred_codec = PreferredCodec::Opus;
                next.opus_params = next.opus_params.with_inband_fec(true);
            }
            FecRecommendation::RedundantFec => {
                next.preferred_codec = PreferredCodec::RedFec;
            }
            FecRecommendation::NoChange => {}
        }
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_mode_swaps_preset() {
        let record = TrackNegotiationRecord::audio("0", OpusCodecParameters::initial());
        let music = record.with_quality_mode(QualityMode::Music, &OpusCodecParameters::music());

        assert_eq!(music.quality_mode, QualityMode::Music);
        assert_eq!(music.opus_params.packet_time, Some(10));
        assert_eq!(music.opus_params.dtx, Some(false));
        // preset leaves maxptime alone
        assert_eq!(music.opus_params.max_packet_time, Some(120));
        // original untouched
        assert_eq!(record.opus_params.packet_time, Some(20));
    }

    #[test]
    fn test_apply_recommendation() {
        let record = TrackNegotiationRecord::audio("0", OpusCodecParameters::default());
        assert_eq!(record.fec_mode(), FecRecommendation::NoChange);

        let inband = record.apply_recommendation(FecRecommendation::InbandFec).unwrap();
        assert_eq!(inband.opus_params.inband_fec, Some(true));
        assert!(inband.apply_recommendation(FecRecommendation::InbandFec).is_none());

        let red = inband.apply_recommendation(FecRecommendation::RedundantFec).unwrap();
        assert_eq!(red.preferred_codec, PreferredCodec::RedFec);
        assert!(red.apply_recommendation(FecRecommendation::NoChange).is_none());

        let back = red.apply_recommendation(FecRecommendation::InbandFec).unwrap();
        assert_eq!(back.preferred_codec, PreferredCodec::Opus);
    }

    #[test]
    fn test_video_ignores_recommendation() {
        let record = TrackNegotiationRecord::video("1");
        assert!(record.apply_recommendation(FecRecommendation::RedundantFec).is_none());
    }

    #[test]
    fn test_codec_wire_names() {
        assert_eq!(serde_json::to_string(&PreferredCodec::RedFec).unwrap(), "\"red-fec\"");
        assert_eq!(serde_json::to_string(&QualityMode::Music).unwrap(), "\"music\"");
    }
}
