//! Signaling types and relay messages

use serde::{Deserialize, Serialize};
use typeshare::typeshare;

/// Session description kind
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Offer or answer as carried on the wire
#[typeshare]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Same kind, different body
    pub fn with_sdp(&self, sdp: String) -> Self {
        Self {
            sdp_type: self.sdp_type,
            sdp,
        }
    }
}

/// ICE candidate
#[typeshare]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }
}

/// Connection state
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// The connection will not recover
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Microphone state of a participant
#[typeshare]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MuteState {
    Muted,
    #[default]
    Unmuted,
}

/// Message exchanged with the signaling relay
///
/// `participant_id` on offer/answer/candidate is the sender, filled in by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum RelayMessage {
    /// Announce ourselves to the room
    Join {
        display_name: String,
        #[serde(default)]
        initial_mute_state: MuteState,
    },
    Offer {
        description: SessionDescription,
        target_participant_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participant_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    Answer {
        description: SessionDescription,
        target_participant_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participant_id: Option<String>,
    },
    IceCandidate {
        candidate: IceCandidate,
        target_participant_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participant_id: Option<String>,
    },
    ParticipantJoined {
        participant_id: String,
        #[serde(default)]
        display_name: String,
        #[serde(default)]
        initial_mute_state: MuteState,
    },
    ParticipantLeft {
        participant_id: String,
    },
    MuteStateChanged {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participant_id: Option<String>,
        mute_state: MuteState,
    },
}

/// What a session wants delivered to its peer
#[derive(Debug, Clone, PartialEq)]
pub enum SignalPayload {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

impl RelayMessage {
    /// Relay envelope addressed to `target`
    pub fn addressed(target: &str, payload: SignalPayload, display_name: Option<String>) -> Self {
        let target_participant_id = target.to_string();
        match payload {
            SignalPayload::Description(description) => match description.sdp_type {
                SdpType::Answer | SdpType::Pranswer => RelayMessage::Answer {
                    description,
                    target_participant_id,
                    participant_id: None,
                },
                SdpType::Offer | SdpType::Rollback => RelayMessage::Offer {
                    description,
                    target_participant_id,
                    participant_id: None,
                    display_name,
                },
            },
            SignalPayload::Candidate(candidate) => RelayMessage::IceCandidate {
                candidate,
                target_participant_id,
                participant_id: None,
            },
        }
    }

    /// Participant a message concerns, sender for relayed payloads
    pub fn participant_id(&self) -> Option<&str> {
        match self {
            RelayMessage::Join { .. } => None,
            RelayMessage::Offer { participant_id, .. }
            | RelayMessage::Answer { participant_id, .. }
            | RelayMessage::IceCandidate { participant_id, .. }
            | RelayMessage::MuteStateChanged { participant_id, .. } => participant_id.as_deref(),
            RelayMessage::ParticipantJoined { participant_id, .. }
            | RelayMessage::ParticipantLeft { participant_id } => Some(participant_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_offer_wire_format() {
        let msg = RelayMessage::addressed(
            "bob",
            SignalPayload::Description(SessionDescription::offer("v=0")),
            None,
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "offer",
                "description": { "type": "offer", "sdp": "v=0" },
                "targetParticipantId": "bob"
            })
        );
    }

    #[test]
    fn test_parse_relayed_candidate() {
        let msg: RelayMessage = serde_json::from_value(json!({
            "type": "ice-candidate",
            "candidate": { "candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host", "sdpMid": "0", "sdpMLineIndex": 0 },
            "targetParticipantId": "me",
            "participantId": "alice"
        }))
        .unwrap();

        assert_eq!(msg.participant_id(), Some("alice"));
        match msg {
            RelayMessage::IceCandidate { candidate, .. } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.username_fragment, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_participant_joined() {
        let msg: RelayMessage = serde_json::from_str(
            r#"{"type":"participant-joined","participantId":"alice","displayName":"Alice","initialMuteState":"muted"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            RelayMessage::ParticipantJoined {
                participant_id: "alice".into(),
                display_name: "Alice".into(),
                initial_mute_state: MuteState::Muted,
            }
        );
    }

    #[test]
    fn test_answer_envelope() {
        let msg = RelayMessage::addressed(
            "alice",
            SignalPayload::Description(SessionDescription::answer("v=0")),
            Some("ignored".into()),
        );
        assert!(matches!(msg, RelayMessage::Answer { .. }));
    }
}
