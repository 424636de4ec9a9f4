//! Transport seams for the negotiation engine
//!
//! The session layer drives a peer connection through [`MediaTransport`] and
//! reaches remote participants through [`SignalingTransport`]. Production
//! implementations live in [`peer`] (webrtc-rs) and [`relay`] (WebSocket);
//! tests substitute in-memory fakes.
//!
//! ```text
//! SessionRegistry --> SessionDriver --> MediaTransport (RTCPeerConnection)
//!        ^                 |                  |
//!        |                 +---- SignalingTransport (relay) / data channel
//!        +---- RelayMessage <---- WsRelayClient
//! ```

pub mod control;
pub mod peer;
pub mod relay;
pub mod signaling;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

pub use control::{parse_control_message, ControlMessage};
pub use peer::{RtcTransport, RtcTransportFactory};
pub use relay::WsRelayClient;
pub use signaling::{
    ConnectionState, IceCandidate, MuteState, RelayMessage, SdpType, SessionDescription,
    SignalPayload,
};

use crate::error::Result;
use crate::session::state::SignalingState;
use crate::session::track::{MediaKind, Mid, PreferredCodec};
use crate::stats::RawStatsReport;

/// Capacity of the per-transport event channel
pub const TRANSPORT_EVENT_CAPACITY: usize = 64;

/// Asynchronous notifications from a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    NegotiationNeeded,
    LocalCandidate(IceCandidate),
    DataChannelOpen,
    DataChannelClosed,
    /// Parsed message from the control data channel
    ControlMessage(ControlMessage),
    RemoteTrack { mid: Mid, kind: MediaKind },
    ConnectionStateChanged(ConnectionState),
}

/// One peer connection, as seen by the negotiation engine
#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Roll back a pending local offer and apply `description` in one step
    async fn rollback_and_set_remote(&self, description: SessionDescription) -> Result<()>;

    /// Discard the pending local or remote description, back to stable
    async fn rollback(&self) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Reorder the codecs of transceiver `mid` so `codec` comes first
    async fn set_codec_preferences(&self, mid: &str, codec: PreferredCodec) -> Result<()>;

    async fn set_playout_delay(&self, mid: &str, seconds: f64) -> Result<()>;

    /// Add a local audio track; triggers negotiation-needed on success
    async fn add_audio_track(&self, label: &str) -> Result<()>;

    async fn send_control(&self, data: Bytes) -> Result<()>;

    fn data_channel_open(&self) -> bool;

    async fn get_stats(&self) -> Result<RawStatsReport>;

    async fn signaling_state(&self) -> SignalingState;

    /// Mids and kinds of all negotiated transceivers
    async fn transceiver_mids(&self) -> Vec<(Mid, MediaKind)>;

    async fn close(&self) -> Result<()>;
}

/// Builds a transport per remote participant
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// `create_data_channel` is true for the side that starts the call
    async fn create(
        &self,
        participant_id: &str,
        create_data_channel: bool,
    ) -> Result<(Arc<dyn MediaTransport>, mpsc::Receiver<TransportEvent>)>;
}

/// Outbound path to the signaling relay
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, message: RelayMessage) -> Result<()>;
}
