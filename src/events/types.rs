//! Call event types
//!
//! Everything the session layer reports to the UI goes through these events.

use serde::{Deserialize, Serialize};

use crate::rtc::signaling::{ConnectionState, MuteState};
use crate::session::track::{MediaKind, Mid, QualityMode};
use crate::stats::{FecRecommendation, StatsSnapshot};

/// Call event enumeration
///
/// Serialized as:
/// ```json
/// {
///   "event": "track.added",
///   "data": { "participant_id": "alice", "mid": "1", "kind": "audio" }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum CallEvent {
    // ============================================================================
    // Participants
    // ============================================================================
    #[serde(rename = "participant.joined")]
    ParticipantJoined {
        participant_id: String,
        display_name: String,
        mute_state: MuteState,
    },

    #[serde(rename = "participant.left")]
    ParticipantLeft { participant_id: String },

    /// Remote microphone state changed
    #[serde(rename = "mute.changed")]
    MuteStateChanged {
        participant_id: String,
        state: MuteState,
    },

    // ============================================================================
    // Media
    // ============================================================================
    /// A remote track arrived on transceiver `mid`
    #[serde(rename = "track.added")]
    RemoteTrackAdded {
        participant_id: String,
        mid: Mid,
        kind: MediaKind,
    },

    /// The remote side named one of its tracks
    #[serde(rename = "track.labeled")]
    RemoteTrackLabeled {
        participant_id: String,
        mid: Mid,
        label: String,
    },

    // ============================================================================
    // Quality
    // ============================================================================
    #[serde(rename = "stats.updated")]
    StatsUpdated {
        participant_id: String,
        snapshot: StatsSnapshot,
    },

    /// The remote side switched a track between speech and music
    #[serde(rename = "quality.remote_mode")]
    RemoteQualityModeChanged {
        participant_id: String,
        mid: Mid,
        mode: QualityMode,
    },

    /// Loss-driven FEC change was renegotiated
    #[serde(rename = "quality.fec_adapted")]
    FecAdapted {
        participant_id: String,
        mid: Mid,
        recommendation: FecRecommendation,
    },

    // ============================================================================
    // Connection
    // ============================================================================
    #[serde(rename = "connection.state_changed")]
    ConnectionStateChanged {
        participant_id: String,
        state: ConnectionState,
    },

    /// The transport failed for good; the session is gone
    #[serde(rename = "call.ended")]
    CallEnded {
        participant_id: String,
        reason: String,
    },
}

impl CallEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ParticipantJoined { .. } => "participant.joined",
            Self::ParticipantLeft { .. } => "participant.left",
            Self::MuteStateChanged { .. } => "mute.changed",
            Self::RemoteTrackAdded { .. } => "track.added",
            Self::RemoteTrackLabeled { .. } => "track.labeled",
            Self::StatsUpdated { .. } => "stats.updated",
            Self::RemoteQualityModeChanged { .. } => "quality.remote_mode",
            Self::FecAdapted { .. } => "quality.fec_adapted",
            Self::ConnectionStateChanged { .. } => "connection.state_changed",
            Self::CallEnded { .. } => "call.ended",
        }
    }

    pub fn participant_id(&self) -> &str {
        match self {
            Self::ParticipantJoined { participant_id, .. }
            | Self::ParticipantLeft { participant_id }
            | Self::MuteStateChanged { participant_id, .. }
            | Self::RemoteTrackAdded { participant_id, .. }
            | Self::RemoteTrackLabeled { participant_id, .. }
            | Self::StatsUpdated { participant_id, .. }
            | Self::RemoteQualityModeChanged { participant_id, .. }
            | Self::FecAdapted { participant_id, .. }
            | Self::ConnectionStateChanged { participant_id, .. }
            | Self::CallEnded { participant_id, .. } => participant_id,
        }
    }

    /// Check if event name matches a topic pattern (`*`, `track.*`, exact)
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        if topic.ends_with(".*") {
            let prefix = topic.trim_end_matches(".*");
            event_name.starts_with(prefix)
        } else {
            event_name == topic
        }
    }
}
