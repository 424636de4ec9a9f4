//! Opus format parameters (RFC 7587 `a=fmtp` keys)

use serde::{Deserialize, Serialize};
use typeshare::typeshare;

/// Lowest average bitrate the music/speech presets use (bit/s)
pub const MIN_AVERAGE_BITRATE: u32 = 32_000;
/// Highest average bitrate the music preset uses (bit/s)
pub const MAX_AVERAGE_BITRATE: u32 = 256_000;

/// Opus codec parameter set for one media section.
///
/// Every field is optional; `None` means "leave whatever the description
/// already carries". A negotiation round always works on a fresh value, records
/// replace their parameters instead of editing them in place.
#[typeshare]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpusCodecParameters {
    #[serde(rename = "ptime", skip_serializing_if = "Option::is_none")]
    pub packet_time: Option<u32>,
    #[serde(rename = "maxptime", skip_serializing_if = "Option::is_none")]
    pub max_packet_time: Option<u32>,
    #[serde(rename = "minptime", skip_serializing_if = "Option::is_none")]
    pub min_packet_time: Option<u32>,
    #[serde(rename = "maxplaybackrate", skip_serializing_if = "Option::is_none")]
    pub max_playback_rate: Option<u32>,
    #[serde(rename = "maxaveragebitrate", skip_serializing_if = "Option::is_none")]
    pub max_average_bitrate: Option<u32>,
    #[serde(rename = "sprop-maxcapturerate", skip_serializing_if = "Option::is_none")]
    pub sprop_max_capture_rate: Option<u32>,
    #[serde(rename = "sprop-stereo", skip_serializing_if = "Option::is_none")]
    pub sprop_stereo: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stereo: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cbr: Option<bool>,
    #[serde(rename = "useinbandfec", skip_serializing_if = "Option::is_none")]
    pub inband_fec: Option<bool>,
    #[serde(rename = "usedtx", skip_serializing_if = "Option::is_none")]
    pub dtx: Option<bool>,
}

fn flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim() {
        "1" => Some(true),
        "0" => Some(false),
        _ => None,
    }
}

impl OpusCodecParameters {
    /// Parameters a freshly negotiated voice track starts with.
    pub fn initial() -> Self {
        Self {
            packet_time: Some(20),
            max_packet_time: Some(120),
            max_average_bitrate: Some(MIN_AVERAGE_BITRATE),
            stereo: Some(false),
            cbr: Some(false),
            inband_fec: Some(true),
            dtx: Some(true),
            ..Default::default()
        }
    }

    /// Speech preset: DTX on, 20 ms frames, low bitrate.
    pub fn speech() -> Self {
        Self {
            packet_time: Some(20),
            max_average_bitrate: Some(MIN_AVERAGE_BITRATE),
            stereo: Some(false),
            inband_fec: Some(true),
            dtx: Some(true),
            ..Default::default()
        }
    }

    /// Music preset: DTX off, 10 ms frames, high bitrate.
    pub fn music() -> Self {
        Self {
            packet_time: Some(10),
            max_average_bitrate: Some(MAX_AVERAGE_BITRATE),
            stereo: Some(false),
            inband_fec: Some(true),
            dtx: Some(false),
            ..Default::default()
        }
    }

    /// Right-biased merge: fields set in `other` win.
    pub fn merged_with(&self, other: &OpusCodecParameters) -> Self {
        Self {
            packet_time: other.packet_time.or(self.packet_time),
            max_packet_time: other.max_packet_time.or(self.max_packet_time),
            min_packet_time: other.min_packet_time.or(self.min_packet_time),
            max_playback_rate: other.max_playback_rate.or(self.max_playback_rate),
            max_average_bitrate: other.max_average_bitrate.or(self.max_average_bitrate),
            sprop_max_capture_rate: other.sprop_max_capture_rate.or(self.sprop_max_capture_rate),
            sprop_stereo: other.sprop_stereo.or(self.sprop_stereo),
            stereo: other.stereo.or(self.stereo),
            cbr: other.cbr.or(self.cbr),
            inband_fec: other.inband_fec.or(self.inband_fec),
            dtx: other.dtx.or(self.dtx),
        }
    }

    pub fn with_inband_fec(mut self, enabled: bool) -> Self {
        self.inband_fec = Some(enabled);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Key/value pairs of the fields that are set, in fmtp key spelling.
    pub fn to_fmtp_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        let numbers = [
            ("ptime", self.packet_time),
            ("maxptime", self.max_packet_time),
            ("minptime", self.min_packet_time),
            ("maxplaybackrate", self.max_playback_rate),
            ("maxaveragebitrate", self.max_average_bitrate),
            ("sprop-maxcapturerate", self.sprop_max_capture_rate),
        ];
        for (key, value) in numbers {
            if let Some(v) = value {
                pairs.push((key, v.to_string()));
            }
        }
        let flags = [
            ("sprop-stereo", self.sprop_stereo),
            ("stereo", self.stereo),
            ("cbr", self.cbr),
            ("useinbandfec", self.inband_fec),
            ("usedtx", self.dtx),
        ];
        for (key, value) in flags {
            if let Some(v) = value {
                pairs.push((key, flag(v)));
            }
        }
        pairs
    }

    /// Build from parsed fmtp pairs. Unknown keys and unparseable values are ignored.
    pub fn from_fmtp_pairs<K, V>(pairs: &[(K, V)]) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut params = Self::default();
        for (key, value) in pairs {
            let value = value.as_ref();
            let number = || value.trim().parse::<u32>().ok();
            match key.as_ref() {
                "ptime" => params.packet_time = number(),
                "maxptime" => params.max_packet_time = number(),
                "minptime" => params.min_packet_time = number(),
                "maxplaybackrate" => params.max_playback_rate = number(),
                "maxaveragebitrate" => params.max_average_bitrate = number(),
                "sprop-maxcapturerate" => params.sprop_max_capture_rate = number(),
                "sprop-stereo" => params.sprop_stereo = parse_flag(value),
                "stereo" => params.stereo = parse_flag(value),
                "cbr" => params.cbr = parse_flag(value),
                "useinbandfec" => params.inband_fec = parse_flag(value),
                "usedtx" => params.dtx = parse_flag(value),
                _ => {}
            }
        }
        params
    }
}
