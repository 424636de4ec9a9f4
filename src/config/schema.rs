use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use crate::sdp::OpusCodecParameters;

/// Main application configuration
#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// ICE server settings
    pub ice: IceConfig,
    /// Offer/answer and adaptation settings
    pub negotiation: NegotiationConfig,
    /// Opus presets
    pub audio: AudioConfig,
    /// Relay connection settings
    pub signaling: SignalingConfig,
}

/// TURN server
#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TurnServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// ICE configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IceConfig {
    /// STUN server URLs (e.g., stun:stun.l.google.com:19302)
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: vec![],
        }
    }
}

/// Negotiation and quality-adaptation configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Statistics polling period in milliseconds
    pub stats_interval_ms: u32,
    /// Let the quality advisor renegotiate FEC on its own
    pub adaptive_fec: bool,
    /// Evaluate the advisor every N statistics ticks
    pub adapt_every_ticks: u32,
    /// Loss fraction at and above which RED is preferred over in-band FEC
    pub red_loss_threshold: f64,
    /// Label of the control data channel
    pub data_channel_label: String,
    /// Maximum concurrent sessions
    pub max_sessions: u32,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            stats_interval_ms: 300,
            adaptive_fec: true,
            adapt_every_ticks: 3,
            red_loss_threshold: 0.2,
            data_channel_label: "Data Channel".to_string(),
            max_sessions: 16,
        }
    }
}

/// Opus presets
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    /// Parameters a new voice track starts with
    pub initial: OpusCodecParameters,
    /// Preset for QualityMode::Speech
    pub speech: OpusCodecParameters,
    /// Preset for QualityMode::Music
    pub music: OpusCodecParameters,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            initial: OpusCodecParameters::initial(),
            speech: OpusCodecParameters::speech(),
            music: OpusCodecParameters::music(),
        }
    }
}

/// Relay connection configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SignalingConfig {
    /// WebSocket URL of the relay
    pub relay_url: String,
    /// Name announced to other participants
    pub display_name: String,
    /// Join muted
    pub start_muted: bool,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8080/ws".to_string(),
            display_name: "duet".to_string(),
            start_muted: false,
        }
    }
}
