//! webrtc-rs implementation of [`MediaTransport`]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::control::parse_control_message;
use super::signaling::{ConnectionState, IceCandidate, SdpType, SessionDescription};
use super::{MediaTransport, TransportEvent, TransportFactory, TRANSPORT_EVENT_CAPACITY};
use crate::config::{AppConfig, ConfigStore};
use crate::error::{AppError, Result};
use crate::session::state::SignalingState;
use crate::session::track::{MediaKind, Mid, PreferredCodec};
use crate::stats::RawStatsReport;

const MIME_TYPE_RED: &str = "audio/red";
const OPUS_PAYLOAD_TYPE: u8 = 111;
const RED_PAYLOAD_TYPE: u8 = 63;
/// Stream id shared by all local audio tracks
const LOCAL_STREAM_ID: &str = "duet-audio";

fn opus_codec() -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            rtcp_feedback: vec![],
        },
        payload_type: OPUS_PAYLOAD_TYPE,
        ..Default::default()
    }
}

/// RED carrying two opus generations (RFC 2198)
fn red_codec() -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_RED.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: format!("{}/{}", OPUS_PAYLOAD_TYPE, OPUS_PAYLOAD_TYPE),
            rtcp_feedback: vec![],
        },
        payload_type: RED_PAYLOAD_TYPE,
        ..Default::default()
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let SessionDescription { sdp_type, sdp } = description;
    let result = match sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
        SdpType::Rollback => return rollback_description(sdp),
    };
    result.map_err(|e| AppError::MalformedDescription(e.to_string()))
}

/// webrtc-rs has no public rollback constructor and rejects an empty body
/// Store the delay for `mid`; true the first time the mid gets one
fn record_playout_delay(delays: &mut HashMap<Mid, f64>, mid: &str, seconds: f64) -> bool {
    delays.insert(mid.to_string(), seconds).is_none()
}

fn rollback_description(sdp: String) -> Result<RTCSessionDescription> {
    serde_json::from_value(json!({ "type": "rollback", "sdp": sdp })).map_err(AppError::from)
}

fn from_rtc_description(description: &RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        other => {
            return Err(AppError::MalformedDescription(format!(
                "unsupported description type {:?}",
                other
            )))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp.clone(),
    })
}

fn media_kind(kind: RTPCodecType) -> MediaKind {
    match kind {
        RTPCodecType::Video => MediaKind::Video,
        _ => MediaKind::Audio,
    }
}

fn connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

/// Peer connection with one control data channel and opus audio tracks
pub struct RtcTransport {
    participant_id: String,
    pc: Arc<RTCPeerConnection>,
    data_channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    channel_open: Arc<AtomicBool>,
    local_tracks: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
    /// Requested jitter-buffer targets; webrtc-rs exposes no receiver knob
    playout_delays: Mutex<HashMap<Mid, f64>>,
    events: mpsc::Sender<TransportEvent>,
}

impl RtcTransport {
    /// Build the peer connection and its first audio track
    pub async fn new(
        config: &AppConfig,
        participant_id: &str,
        create_data_channel: bool,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtcError(format!("Failed to register codecs: {}", e)))?;
        media_engine
            .register_codec(red_codec(), RTPCodecType::Audio)
            .map_err(|e| AppError::WebRtcError(format!("Failed to register RED codec: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| AppError::WebRtcError(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let mut ice_servers = vec![];
        for stun_url in &config.ice.stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }
        for turn in &config.ice.turn_servers {
            // webrtc-rs requires TURN credentials
            if turn.username.is_empty() || turn.credential.is_empty() {
                warn!("Skipping TURN server {:?}: credentials missing", turn.urls);
                continue;
            }
            ice_servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?;

        let (events, rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
        let transport = Self {
            participant_id: participant_id.to_string(),
            pc: Arc::new(pc),
            data_channel: Arc::new(RwLock::new(None)),
            channel_open: Arc::new(AtomicBool::new(false)),
            local_tracks: Mutex::new(Vec::new()),
            playout_delays: Mutex::new(HashMap::new()),
            events,
        };

        transport.setup_event_handlers();
        transport.add_audio_track("voice").await?;

        if create_data_channel {
            let init = RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            };
            let dc = transport
                .pc
                .create_data_channel(&config.negotiation.data_channel_label, Some(init))
                .await
                .map_err(|e| AppError::WebRtcError(format!("Failed to create data channel: {}", e)))?;
            transport.attach_data_channel(dc).await;
            info!(
                "Data channel '{}' created for {}",
                config.negotiation.data_channel_label, participant_id
            );
        }

        Ok((transport, rx))
    }

    fn setup_event_handlers(&self) {
        let participant_id = self.participant_id.clone();
        let events = self.events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let events = events.clone();
                let participant_id = participant_id.clone();
                Box::pin(async move {
                    let Some(state) = connection_state(s) else {
                        return;
                    };
                    info!("Peer {} connection state: {}", participant_id, state);
                    let _ = events.send(TransportEvent::ConnectionStateChanged(state)).await;
                })
            }));

        let events = self.events.clone();
        self.pc.on_negotiation_needed(Box::new(move || {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(TransportEvent::NegotiationNeeded).await;
            })
        }));

        let events = self.events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                Box::pin(async move {
                    let Some(c) = candidate else {
                        return;
                    };
                    match c.to_json() {
                        Ok(init) => {
                            debug!("ICE candidate: {}", init.candidate);
                            let candidate = IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            };
                            let _ = events.send(TransportEvent::LocalCandidate(candidate)).await;
                        }
                        Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
                    }
                })
            }));

        let events = self.events.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  transceiver: Arc<RTCRtpTransceiver>| {
                let events = events.clone();
                Box::pin(async move {
                    let Some(mid) = transceiver.mid() else {
                        debug!("Remote track without mid ignored");
                        return;
                    };
                    let kind = media_kind(track.kind());
                    info!("Remote {} track on mid={}", kind, mid);
                    let _ = events
                        .send(TransportEvent::RemoteTrack {
                            mid: mid.to_string(),
                            kind,
                        })
                        .await;
                })
            },
        ));

        // Polite side receives the channel instead of creating it
        let data_channel = self.data_channel.clone();
        let channel_open = self.channel_open.clone();
        let events = self.events.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let data_channel = data_channel.clone();
                let channel_open = channel_open.clone();
                let events = events.clone();
                Box::pin(async move {
                    info!("Data channel received: {}", dc.label());
                    wire_data_channel(&dc, channel_open, events);
                    *data_channel.write().await = Some(dc);
                })
            }));
    }

    async fn attach_data_channel(&self, dc: Arc<RTCDataChannel>) {
        wire_data_channel(&dc, self.channel_open.clone(), self.events.clone());
        *self.data_channel.write().await = Some(dc);
    }

    async fn transceiver(&self, mid: &str) -> Result<Arc<RTCRtpTransceiver>> {
        for transceiver in self.pc.get_transceivers().await {
            if transceiver.mid().as_deref() == Some(mid) {
                return Ok(transceiver);
            }
        }
        Err(AppError::NotFound(format!("No transceiver with mid={}", mid)))
    }

    /// Requested playout delay for `mid`, if any
    pub fn playout_delay(&self, mid: &str) -> Option<f64> {
        self.playout_delays.lock().get(mid).copied()
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }
}

/// Hook open/close/message handlers of the control channel
fn wire_data_channel(
    dc: &Arc<RTCDataChannel>,
    channel_open: Arc<AtomicBool>,
    events: mpsc::Sender<TransportEvent>,
) {
    if dc.ready_state() == RTCDataChannelState::Open {
        channel_open.store(true, Ordering::SeqCst);
        let events = events.clone();
        tokio::spawn(async move {
            let _ = events.send(TransportEvent::DataChannelOpen).await;
        });
    }

    let open_flag = channel_open.clone();
    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        let events = open_events.clone();
        let open_flag = open_flag.clone();
        Box::pin(async move {
            open_flag.store(true, Ordering::SeqCst);
            let _ = events.send(TransportEvent::DataChannelOpen).await;
        })
    }));

    let close_flag = channel_open;
    let close_events = events.clone();
    dc.on_close(Box::new(move || {
        let events = close_events.clone();
        let close_flag = close_flag.clone();
        Box::pin(async move {
            close_flag.store(false, Ordering::SeqCst);
            let _ = events.send(TransportEvent::DataChannelClosed).await;
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = events.clone();
        Box::pin(async move {
            if let Some(control) = parse_control_message(&msg.data) {
                let _ = events.send(TransportEvent::ControlMessage(control)).await;
            }
        })
    }));
}

#[async_trait]
impl MediaTransport for RtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create offer: {}", e)))?;
        from_rtc_description(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create answer: {}", e)))?;
        from_rtc_description(&answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set remote description: {}", e)))
    }

    async fn rollback_and_set_remote(&self, description: SessionDescription) -> Result<()> {
        let remote = to_rtc_description(description)?;

        if self.pc.signaling_state() != RTCSignalingState::HaveLocalOffer {
            debug!("No local offer to roll back for {}", self.participant_id);
            return self
                .pc
                .set_remote_description(remote)
                .await
                .map_err(|e| AppError::WebRtcError(format!("Failed to set remote description: {}", e)));
        }

        let pending = self
            .pc
            .pending_local_description()
            .await
            .map(|d| d.sdp)
            .unwrap_or_default();
        let rollback = rollback_description(pending)?;

        let rollback_fut = async {
            self.pc
                .set_local_description(rollback)
                .await
                .map_err(|e| AppError::RollbackFailed {
                    participant: self.participant_id.clone(),
                    reason: e.to_string(),
                })
        };
        let remote_fut = async {
            self.pc
                .set_remote_description(remote)
                .await
                .map_err(|e| AppError::RollbackFailed {
                    participant: self.participant_id.clone(),
                    reason: e.to_string(),
                })
        };
        tokio::try_join!(rollback_fut, remote_fut)?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let rollback_err = |e: webrtc::Error| AppError::RollbackFailed {
            participant: self.participant_id.clone(),
            reason: e.to_string(),
        };

        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer => {
                let pending = self.pc.pending_local_description().await.map(|d| d.sdp);
                let rollback = rollback_description(pending.unwrap_or_default())?;
                self.pc.set_local_description(rollback).await.map_err(rollback_err)
            }
            RTCSignalingState::HaveRemoteOffer => {
                let pending = self.pc.pending_remote_description().await.map(|d| d.sdp);
                let rollback = rollback_description(pending.unwrap_or_default())?;
                self.pc.set_remote_description(rollback).await.map_err(rollback_err)
            }
            state => {
                debug!("Nothing to roll back for {} in {}", self.participant_id, state);
                Ok(())
            }
        }
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn set_codec_preferences(&self, mid: &str, codec: PreferredCodec) -> Result<()> {
        let transceiver = self.transceiver(mid).await?;
        let codecs = match codec {
            PreferredCodec::Opus => vec![opus_codec(), red_codec()],
            PreferredCodec::RedFec => vec![red_codec(), opus_codec()],
        };
        transceiver
            .set_codec_preferences(codecs)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set codec preferences: {}", e)))?;
        info!("Codec preference for mid={} set to {:?}", mid, codec);
        Ok(())
    }

    async fn set_playout_delay(&self, mid: &str, seconds: f64) -> Result<()> {
        self.transceiver(mid).await?;
        if record_playout_delay(&mut self.playout_delays.lock(), mid, seconds) {
            warn!(
                "Playout delay for {} mid={} recorded ({}s) but not applied: receiver has no jitter-buffer target",
                self.participant_id, mid, seconds
            );
        } else {
            debug!("Playout delay for {} mid={} updated: {}s", self.participant_id, mid, seconds);
        }
        Ok(())
    }

    async fn add_audio_track(&self, label: &str) -> Result<()> {
        let track = Arc::new(TrackLocalStaticSample::new(
            opus_codec().capability,
            format!("{}-{}", label, uuid::Uuid::new_v4()),
            LOCAL_STREAM_ID.to_string(),
        ));

        self.pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add audio track: {}", e)))?;

        self.local_tracks.lock().push(track);
        info!("Audio track '{}' added for {}", label, self.participant_id);
        Ok(())
    }

    async fn send_control(&self, data: Bytes) -> Result<()> {
        let dc = self.data_channel.read().await;
        let Some(channel) = dc.as_ref() else {
            return Err(AppError::TransportClosed("no data channel".to_string()));
        };
        if channel.ready_state() != RTCDataChannelState::Open {
            return Err(AppError::TransportClosed("data channel not open".to_string()));
        }

        let text = String::from_utf8(data.to_vec())
            .map_err(|e| AppError::BadRequest(format!("Control message is not UTF-8: {}", e)))?;
        channel
            .send_text(text)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to send control message: {}", e)))?;
        Ok(())
    }

    fn data_channel_open(&self) -> bool {
        self.channel_open.load(Ordering::SeqCst)
    }

    async fn get_stats(&self) -> Result<RawStatsReport> {
        let stats = self.pc.get_stats().await;
        let value = serde_json::to_value(&stats)
            .map_err(|e| AppError::StatsUnavailable(format!("Failed to serialize stats: {}", e)))?;
        let now_ms = chrono::Utc::now().timestamp_millis() as f64;
        Ok(RawStatsReport::from_json(&value)?.restamped(now_ms))
    }

    async fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Stable => {
                if self.pc.current_remote_description().await.is_some() {
                    SignalingState::Stable
                } else {
                    SignalingState::Idle
                }
            }
            _ => SignalingState::Idle,
        }
    }

    async fn transceiver_mids(&self) -> Vec<(Mid, MediaKind)> {
        let mut mids = Vec::new();
        for transceiver in self.pc.get_transceivers().await {
            if let Some(mid) = transceiver.mid() {
                mids.push((mid.to_string(), media_kind(transceiver.kind())));
            }
        }
        mids
    }

    async fn close(&self) -> Result<()> {
        self.channel_open.store(false, Ordering::SeqCst);
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to close peer connection: {}", e)))
    }
}

/// Creates [`RtcTransport`]s from the live configuration
pub struct RtcTransportFactory {
    config: ConfigStore,
}

impl RtcTransportFactory {
    pub fn new(config: ConfigStore) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        participant_id: &str,
        create_data_channel: bool,
    ) -> Result<(Arc<dyn MediaTransport>, mpsc::Receiver<TransportEvent>)> {
        let config = self.config.get();
        let (transport, rx) = RtcTransport::new(&config, participant_id, create_data_channel).await?;
        Ok((Arc::new(transport), rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_description_keeps_body() {
        let rollback = rollback_description("v=0\r\n".to_string()).unwrap();
        assert_eq!(rollback.sdp_type, RTCSdpType::Rollback);
        assert_eq!(rollback.sdp, "v=0\r\n");
    }

    #[test]
    fn test_red_wraps_opus() {
        let red = red_codec();
        assert_eq!(red.capability.sdp_fmtp_line, "111/111");
        assert_eq!(red.payload_type, RED_PAYLOAD_TYPE);
        assert_eq!(opus_codec().payload_type, OPUS_PAYLOAD_TYPE);
    }

    #[test]
    fn test_playout_delay_first_record_per_mid() {
        let mut delays = HashMap::new();
        assert!(record_playout_delay(&mut delays, "0", 0.2));
        assert!(!record_playout_delay(&mut delays, "0", 0.4));
        assert!(record_playout_delay(&mut delays, "1", 0.1));
        assert_eq!(delays.get("0"), Some(&0.4));
    }

    #[test]
    fn test_connection_state_mapping() {
        assert_eq!(
            connection_state(RTCPeerConnectionState::Failed),
            Some(ConnectionState::Failed)
        );
        assert_eq!(connection_state(RTCPeerConnectionState::Unspecified), None);
        assert_eq!(media_kind(RTPCodecType::Video), MediaKind::Video);
    }
}
