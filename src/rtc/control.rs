//! Data channel control messages
//!
//! JSON text messages tagged by `msg`:
//! - `sdp`: renegotiation offer/answer, same payload as the relay form
//! - `music-start` / `music-stop`: quality mode change for a `mid`
//! - `requestTrackName` / `sendTrackName`: label exchange for a new track

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::signaling::SessionDescription;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg")]
pub enum ControlMessage {
    #[serde(rename = "sdp")]
    Sdp { sdp: SessionDescription },
    #[serde(rename = "music-start")]
    MusicStart { mid: String },
    #[serde(rename = "music-stop")]
    MusicStop { mid: String },
    #[serde(rename = "requestTrackName")]
    RequestTrackName { mid: String },
    #[serde(rename = "sendTrackName")]
    SendTrackName { mid: String, cname: String },
}

impl ControlMessage {
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// Parse a control message received on the data channel
pub fn parse_control_message(data: &[u8]) -> Option<ControlMessage> {
    if data.is_empty() {
        warn!("Empty control message");
        return None;
    }

    match serde_json::from_slice::<ControlMessage>(data) {
        Ok(msg) => {
            debug!("Control message: {:?}", msg);
            Some(msg)
        }
        Err(e) => {
            warn!("Invalid control message ({} bytes): {}", data.len(), e);
            None
        }
    }
}
